//! routegate — an API gateway with longest-prefix routing, distributed
//! token-bucket rate limiting, and a live access-log stream.
//!
//! Every inbound request flows match → limit → forward → relay → log:
//! the route cache resolves the longest registered path prefix, the Redis
//! token bucket decides admission, the body is streamed to the downstream
//! service through a shared connection pool, and a single access-log
//! event is published to Kafka regardless of outcome. A consumer task
//! feeds those events to the `/dashboard/stream` server-sent-events
//! endpoint for the live traffic view.

pub mod access_log;
pub mod admin;
pub mod config;
pub mod error;
pub mod event_stream;
pub mod proxy_service;
pub mod rate_limiter;
pub mod route_cache;
pub mod route_store;
pub mod server;

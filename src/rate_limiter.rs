//! Distributed token-bucket rate limiting backed by Redis.
//!
//! Each `(clientIp, routePath)` pair gets its own bucket stored as a Redis
//! hash with two fields: `tokens` (current count, fractional) and
//! `lastRefill` (epoch millis). Atomicity is guaranteed by running the
//! entire check-and-consume inside a Lua script: Redis executes scripts as
//! a single command, so concurrent requests from the same client cannot
//! interleave and double-spend a token. This holds across all gateway
//! instances sharing the store.
//!
//! The limiter **fails open**: when Redis is unreachable, times out, or the
//! script errors, traffic is allowed through and the failure is logged at
//! WARN. Degraded rate limiting is preferable to a hard outage of every
//! routed service.

use async_trait::async_trait;
use redis::aio::{ConnectionLike, ConnectionManager};
use redis::Script;
use std::time::Duration;
use tracing::warn;

use crate::route_store::Route;

/// The result of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Tokens left in the bucket after this check; `-1` when rate limiting
    /// was skipped (route has no limit, or the store was unavailable).
    pub remaining: i64,
}

impl RateLimitDecision {
    /// Allowed without consulting the store.
    pub const fn unlimited() -> Self {
        Self {
            allowed: true,
            remaining: -1,
        }
    }
}

/// Per-`(clientIp, routePath)` rate limiting.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Check whether the given client is within the rate limit for the
    /// given route. Never fails: store errors degrade to an allow.
    async fn check(&self, client_ip: &str, route: &Route) -> RateLimitDecision;
}

/// Token-bucket algorithm, executed atomically server-side.
///
/// KEYS[1] — bucket key for this (client, route) pair
/// ARGV[1] — capacity (max tokens)
/// ARGV[2] — refill rate per second
/// ARGV[3] — current time in milliseconds
/// ARGV[4] — TTL in seconds (auto-expires idle buckets)
///
/// Returns `{ allowed (1 or 0), floor(remaining tokens) }`. Accrual is
/// fractional: a request 100 ms after the last one adds 0.1 × rate tokens;
/// only the consume step requires a whole token.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local key  = KEYS[1]
local cap  = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local now  = tonumber(ARGV[3])
local ttl  = tonumber(ARGV[4])

local data = redis.call('HMGET', key, 'tokens', 'lastRefill')
local tokens     = tonumber(data[1])
local lastRefill = tonumber(data[2])

if tokens == nil then
    tokens     = cap
    lastRefill = now
end

local elapsed = (now - lastRefill) / 1000.0
local newTokens = math.min(cap, tokens + elapsed * rate)

local allowed = 0
if newTokens >= 1.0 then
    newTokens = newTokens - 1.0
    allowed = 1
end

redis.call('HMSET', key, 'tokens', tostring(newTokens), 'lastRefill', tostring(now))
redis.call('EXPIRE', key, ttl)

return { allowed, math.floor(newTokens) }
"#;

/// TTL for a bucket key: the time an empty bucket takes to fully refill,
/// doubled for a safety margin. Keeps the store scaling with *active*
/// clients — idle buckets expire on their own.
fn bucket_ttl_secs(capacity: i32, refill_rate: i32) -> i64 {
    let capacity = i64::from(capacity);
    let refill_rate = i64::from(refill_rate);
    ((capacity + refill_rate - 1) / refill_rate) * 2
}

/// Redis-backed [`RateLimiter`].
///
/// Generic over the connection so tests can inject a failing connection;
/// production uses [`ConnectionManager`], which reconnects on its own and
/// is cheap to clone per call.
pub struct RedisRateLimiter<C = ConnectionManager> {
    conn: C,
    script: Script,
    call_timeout: Duration,
}

impl RedisRateLimiter<ConnectionManager> {
    /// Connect to Redis and prepare the bucket script. The script's SHA is
    /// cached so all calls after the first use `EVALSHA`.
    pub async fn connect(url: &str, call_timeout: Duration) -> redis::RedisResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::with_connection(conn, call_timeout))
    }
}

impl<C> RedisRateLimiter<C>
where
    C: ConnectionLike + Clone + Send + Sync,
{
    pub fn with_connection(conn: C, call_timeout: Duration) -> Self {
        Self {
            conn,
            script: Script::new(TOKEN_BUCKET_SCRIPT),
            call_timeout,
        }
    }
}

#[async_trait]
impl<C> RateLimiter for RedisRateLimiter<C>
where
    C: ConnectionLike + Clone + Send + Sync,
{
    async fn check(&self, client_ip: &str, route: &Route) -> RateLimitDecision {
        // Rate limiting disabled for this route: no store interaction.
        let (Some(capacity), Some(refill_rate)) = (route.capacity, route.refill_rate_per_second)
        else {
            return RateLimitDecision::unlimited();
        };

        let key = format!("rl:{}:{}", route.path, client_ip);
        let now_ms = chrono::Utc::now().timestamp_millis();
        let ttl_secs = bucket_ttl_secs(capacity, refill_rate);

        let mut conn = self.conn.clone();
        let mut invocation = self.script.key(key);
        invocation
            .arg(capacity)
            .arg(refill_rate)
            .arg(now_ms)
            .arg(ttl_secs);

        let result: Result<redis::RedisResult<(i64, i64)>, _> =
            tokio::time::timeout(self.call_timeout, invocation.invoke_async(&mut conn)).await;

        match result {
            Ok(Ok((allowed, remaining))) => RateLimitDecision {
                allowed: allowed == 1,
                remaining,
            },
            Ok(Err(e)) => {
                warn!(
                    client_ip,
                    route_path = %route.path,
                    error = %e,
                    "rate limit store error, failing open"
                );
                RateLimitDecision::unlimited()
            }
            Err(_) => {
                warn!(
                    client_ip,
                    route_path = %route.path,
                    timeout_ms = self.call_timeout.as_millis() as u64,
                    "rate limit store call timed out, failing open"
                );
                RateLimitDecision::unlimited()
            }
        }
    }
}

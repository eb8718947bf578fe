//! The proxy pipeline: match → limit → forward → relay → log.
//!
//! Mounted as the router's fallback so every request that no explicit
//! endpoint claims lands here. The inbound body is forwarded as a stream
//! (never buffered in full) through a shared connection-pooled client,
//! and the downstream response is streamed back the same way.
//!
//! Exactly one access-log event is emitted per request on every path —
//! 404, 429, success, dispatch failure, and mid-flight cancellation — via
//! an emit-on-drop guard.

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::Utc;
use futures_util::StreamExt;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, BodyStream, StreamBody};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};

use crate::access_log::{AccessLogEvent, AccessLogSink};
use crate::error::GatewayError;
use crate::rate_limiter::RateLimitDecision;
use crate::route_store::Route;
use crate::server::AppState;

/// Streaming body type handed to the upstream client.
pub type ProxyBody = BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>;

/// Shared upstream client owning the connection pool. Constructed once at
/// startup and cloned (cheaply) into every request task.
pub type UpstreamClient = Client<HttpsConnector<HttpConnector>, ProxyBody>;

/// Hop-by-hop headers must not be forwarded between proxies. They are
/// connection-level and only make sense for a single transport hop;
/// forwarding them confuses the downstream service or breaks framing.
const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "host",
    "connection",
    "transfer-encoding",
    "te",
    "upgrade",
    "proxy-authorization",
    "proxy-authenticate",
    "keep-alive",
    "trailer",
];

pub fn is_hop_by_hop_header(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|hop| hop.eq_ignore_ascii_case(name))
}

/// Whether a downstream response header may be relayed to the caller.
/// Besides hop-by-hop headers this drops HTTP/2 pseudo-headers
/// (`:status`, `:path`, …) — framing metadata that must never appear on
/// the wire to an HTTP/1.1 client.
fn should_relay_response_header(name: &str) -> bool {
    !name.starts_with(':') && !is_hop_by_hop_header(name)
}

/// Originating client IP.
///
/// Behind a reverse proxy or load balancer the actual client IP arrives in
/// `X-Forwarded-For`, possibly as a comma-separated chain — the first
/// entry is the original client. Falls back to the transport peer address
/// for direct connections.
pub fn extract_client_ip(headers: &axum::http::HeaderMap, peer: SocketAddr) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for") {
        if let Ok(value) = forwarded.to_str() {
            let first = value.split(',').next().unwrap_or("").trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    peer.ip().to_string()
}

/// Downstream URL: base target + original path + verbatim query string.
/// No rewriting.
pub fn build_target_url(target_url: &str, path: &str, query: Option<&str>) -> String {
    match query {
        Some(query) => format!("{target_url}{path}?{query}"),
        None => format!("{target_url}{path}"),
    }
}

/// Inbound body failure marker, used to tell a severed client apart from
/// an upstream failure when the dispatch errors.
#[derive(Debug)]
struct InboundBodyError(axum::Error);

impl std::fmt::Display for InboundBodyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "inbound body error: {}", self.0)
    }
}

impl std::error::Error for InboundBodyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

fn is_inbound_interrupt(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        if e.downcast_ref::<InboundBodyError>().is_some() {
            return true;
        }
        source = e.source();
    }
    false
}

/// Emit-on-drop access log guard.
///
/// The happy and error paths record their outcome explicitly; if the
/// request task is dropped mid-flight (client disconnected during
/// dispatch), the guard still fires with status 500, so every inbound
/// request produces exactly one event.
struct AccessLogGuard {
    sink: Arc<dyn AccessLogSink>,
    client_ip: String,
    method: String,
    path: String,
    target_url: Option<String>,
    start: Instant,
    outcome: Option<(u16, bool)>,
}

impl AccessLogGuard {
    fn new(
        sink: Arc<dyn AccessLogSink>,
        client_ip: String,
        method: String,
        path: String,
    ) -> Self {
        Self {
            sink,
            client_ip,
            method,
            path,
            target_url: None,
            start: Instant::now(),
            outcome: None,
        }
    }

    fn set_target(&mut self, target_url: String) {
        self.target_url = Some(target_url);
    }

    fn complete(&mut self, status: StatusCode, rate_limited: bool) {
        self.outcome = Some((status.as_u16(), rate_limited));
    }
}

impl Drop for AccessLogGuard {
    fn drop(&mut self) {
        let (status_code, rate_limited) = self
            .outcome
            .unwrap_or((StatusCode::INTERNAL_SERVER_ERROR.as_u16(), false));
        self.sink.publish(AccessLogEvent {
            timestamp: Utc::now(),
            client_ip: std::mem::take(&mut self.client_ip),
            method: std::mem::take(&mut self.method),
            path: std::mem::take(&mut self.path),
            target_url: self.target_url.take(),
            status_code,
            latency_ms: self.start.elapsed().as_millis() as u64,
            rate_limited,
        });
    }
}

/// Build the shared upstream client.
pub fn build_client(pool_max_idle_per_host: usize) -> Result<UpstreamClient, GatewayError> {
    // rustls needs a process-wide crypto provider before the first TLS
    // handshake; installing twice is harmless.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let mut http_connector = HttpConnector::new();
    http_connector.set_nodelay(true);

    let https_connector = HttpsConnectorBuilder::new()
        .with_native_roots()
        .map_err(|e| GatewayError::Upstream(format!("failed to load native TLS roots: {e}")))?
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(http_connector);

    Ok(Client::builder(TokioExecutor::new())
        .pool_max_idle_per_host(pool_max_idle_per_host)
        .pool_idle_timeout(std::time::Duration::from_secs(90))
        .build(https_connector))
}

/// Catch-all handler: every request that no explicit endpoint matched.
pub async fn proxy_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: axum::extract::Request,
) -> Response {
    let method = req.method().as_str().to_uppercase();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);
    let client_ip = extract_client_ip(req.headers(), peer);

    let mut log = AccessLogGuard::new(
        Arc::clone(&state.sink),
        client_ip.clone(),
        method,
        path.clone(),
    );

    // Step 1: route lookup.
    let Some(route) = state.cache.find_match(&path) else {
        log.complete(StatusCode::NOT_FOUND, false);
        return GatewayError::RouteNotFound(path).into_response();
    };
    log.set_target(route.target_url.clone());

    // Step 2: rate limit. Client identity is the IP address; each
    // (IP, route) pair has its own token bucket.
    let decision = state.limiter.check(&client_ip, &route).await;
    if !decision.allowed {
        log.complete(StatusCode::TOO_MANY_REQUESTS, true);
        return GatewayError::RateLimited {
            limit: route.capacity.unwrap_or(0),
        }
        .into_response();
    }

    // Steps 3-5: build, dispatch, relay.
    match forward(&state, &route, req, &path, query.as_deref(), decision).await {
        Ok(response) => {
            log.complete(response.status(), false);
            response
        }
        Err(err) => {
            log.complete(err.status(), false);
            err.into_response()
        }
    }
}

async fn forward(
    state: &AppState,
    route: &Route,
    req: axum::extract::Request,
    path: &str,
    query: Option<&str>,
    decision: RateLimitDecision,
) -> Result<Response, GatewayError> {
    let target = build_target_url(&route.target_url, path, query);
    let uri: Uri = target
        .parse()
        .map_err(|e| GatewayError::Upstream(format!("invalid target URL {target}: {e}")))?;

    debug!(method = %req.method(), path, target = %target, "proxying request");

    let (parts, body) = req.into_parts();

    let mut outbound = hyper::Request::builder().method(parts.method).uri(uri);
    let headers = outbound
        .headers_mut()
        .ok_or_else(|| GatewayError::Upstream("request builder in invalid state".to_string()))?;
    for (name, value) in parts.headers.iter() {
        if !is_hop_by_hop_header(name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }

    // The inbound body is piped through as-is; a failure mid-stream is
    // tagged so the dispatch error can be told apart from an upstream one.
    let body_stream = BodyStream::new(body).map(|result| {
        result.map_err(|e| -> Box<dyn std::error::Error + Send + Sync> {
            Box::new(InboundBodyError(e))
        })
    });
    let outbound = outbound
        .body(BodyExt::boxed(StreamBody::new(body_stream)))
        .map_err(|e| GatewayError::Upstream(format!("failed to build request: {e}")))?;

    let response = match tokio::time::timeout(state.upstream_timeout, state.client.request(outbound))
        .await
    {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            if is_inbound_interrupt(&e) {
                return Err(GatewayError::Interrupted);
            }
            error!(path, target = %target, error = %e, "upstream dispatch failed");
            return Err(GatewayError::Upstream(e.to_string()));
        }
        Err(_) => {
            error!(
                path,
                target = %target,
                timeout_secs = state.upstream_timeout.as_secs(),
                "upstream dispatch timed out"
            );
            return Err(GatewayError::Upstream(format!(
                "upstream request timed out after {}s",
                state.upstream_timeout.as_secs()
            )));
        }
    };

    // Relay the downstream response: status as-is, headers minus
    // hop-by-hop and pseudo-headers, body streamed through.
    let (parts, body) = response.into_parts();
    let mut relayed = hyper::Response::builder().status(parts.status);
    let headers = relayed
        .headers_mut()
        .ok_or_else(|| GatewayError::Upstream("response builder in invalid state".to_string()))?;
    for (name, value) in parts.headers.iter() {
        if should_relay_response_header(name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }

    // Informational rate-limit headers on allowed requests. Skipped when
    // the route is unlimited or the limiter failed open (remaining = -1).
    if let Some(capacity) = route.capacity {
        if decision.remaining >= 0 {
            let limit = HeaderValue::from_str(&capacity.to_string())
                .map_err(|e| GatewayError::Upstream(format!("failed to build response: {e}")))?;
            let remaining = HeaderValue::from_str(&decision.remaining.to_string())
                .map_err(|e| GatewayError::Upstream(format!("failed to build response: {e}")))?;
            headers.insert("x-ratelimit-limit", limit);
            headers.insert("x-ratelimit-remaining", remaining);
        }
    }

    relayed
        .body(Body::new(body))
        .map_err(|e| GatewayError::Upstream(format!("failed to build response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;

    fn peer() -> SocketAddr {
        "192.168.1.50:34567".parse().unwrap()
    }

    #[test]
    fn test_hop_by_hop_headers_filtered() {
        assert!(is_hop_by_hop_header("connection"));
        assert!(is_hop_by_hop_header("Connection"));
        assert!(is_hop_by_hop_header("host"));
        assert!(is_hop_by_hop_header("Transfer-Encoding"));
        assert!(is_hop_by_hop_header("keep-alive"));
        assert!(is_hop_by_hop_header("proxy-authorization"));
        assert!(is_hop_by_hop_header("trailer"));

        assert!(!is_hop_by_hop_header("content-type"));
        assert!(!is_hop_by_hop_header("authorization"));
        assert!(!is_hop_by_hop_header("x-request-id"));
    }

    #[test]
    fn test_pseudo_headers_not_relayed() {
        assert!(!should_relay_response_header(":status"));
        assert!(!should_relay_response_header(":path"));
        assert!(!should_relay_response_header("connection"));
        assert!(should_relay_response_header("content-type"));
        assert!(should_relay_response_header("x-upstream-id"));
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "10.1.2.3, 172.16.0.1".parse().unwrap());
        assert_eq!(extract_client_ip(&headers, peer()), "10.1.2.3");
    }

    #[test]
    fn test_client_ip_trims_forwarded_entry() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "  10.1.2.3 ,172.16.0.1".parse().unwrap());
        assert_eq!(extract_client_ip(&headers, peer()), "10.1.2.3");
    }

    #[test]
    fn test_client_ip_falls_back_to_peer() {
        let headers = HeaderMap::new();
        assert_eq!(extract_client_ip(&headers, peer()), "192.168.1.50");

        // A blank header also falls back.
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "   ".parse().unwrap());
        assert_eq!(extract_client_ip(&headers, peer()), "192.168.1.50");
    }

    #[test]
    fn test_target_url_preserves_path_and_query() {
        assert_eq!(
            build_target_url("http://u", "/a/b", Some("q=1")),
            "http://u/a/b?q=1"
        );
        assert_eq!(build_target_url("http://u", "/a/b", None), "http://u/a/b");
        assert_eq!(
            build_target_url("http://u:8081/base", "/a", Some("x=1&y=2")),
            "http://u:8081/base/a?x=1&y=2"
        );
    }

    #[test]
    fn test_inbound_interrupt_detected_through_chain() {
        #[derive(Debug)]
        struct Wrapper(Box<dyn std::error::Error + Send + Sync>);
        impl std::fmt::Display for Wrapper {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "wrapper: {}", self.0)
            }
        }
        impl std::error::Error for Wrapper {
            fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
                Some(self.0.as_ref())
            }
        }

        let inner = InboundBodyError(axum::Error::new(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "peer gone",
        )));
        let wrapped = Wrapper(Box::new(inner));
        assert!(is_inbound_interrupt(&wrapped));

        let unrelated = Wrapper(Box::new(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        )));
        assert!(!is_inbound_interrupt(&unrelated));
    }
}

//! Shared fixtures for the integration suites.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::Request;
use axum::response::Response;
use axum::Router;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceExt;

use routegate::access_log::{AccessLogEvent, AccessLogSink};
use routegate::rate_limiter::{RateLimitDecision, RateLimiter};
use routegate::route_cache::RouteCache;
use routegate::route_store::{MemoryRouteStore, Route, RouteDraft, RouteStore};
use routegate::server::{self, AppState};
use routegate::{event_stream::SseRegistry, proxy_service};

/// Sink that captures events for assertions instead of publishing them.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<AccessLogEvent>>,
}

impl CaptureSink {
    pub fn events(&self) -> Vec<AccessLogEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

impl AccessLogSink for CaptureSink {
    fn publish(&self, event: AccessLogEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Limiter that replays a scripted sequence of decisions, then allows
/// unlimited.
#[derive(Default)]
pub struct StubLimiter {
    decisions: Mutex<VecDeque<RateLimitDecision>>,
}

impl StubLimiter {
    pub fn scripted(decisions: Vec<RateLimitDecision>) -> Self {
        Self {
            decisions: Mutex::new(decisions.into()),
        }
    }
}

#[async_trait]
impl RateLimiter for StubLimiter {
    async fn check(&self, _client_ip: &str, _route: &Route) -> RateLimitDecision {
        self.decisions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(RateLimitDecision::unlimited())
    }
}

pub fn draft(path: &str, target: &str) -> RouteDraft {
    RouteDraft {
        path: path.to_string(),
        target_url: target.to_string(),
        capacity: None,
        refill_rate_per_second: None,
    }
}

pub fn limited_draft(path: &str, target: &str, capacity: i32, refill: i32) -> RouteDraft {
    RouteDraft {
        path: path.to_string(),
        target_url: target.to_string(),
        capacity: Some(capacity),
        refill_rate_per_second: Some(refill),
    }
}

/// Fully wired gateway over in-memory collaborators.
pub struct TestGateway {
    pub router: Router,
    pub sink: Arc<CaptureSink>,
    pub registry: Arc<SseRegistry>,
    pub store: Arc<MemoryRouteStore>,
    pub cache: Arc<RouteCache>,
}

pub async fn gateway(routes: Vec<RouteDraft>, limiter: Arc<dyn RateLimiter>) -> TestGateway {
    let store = Arc::new(MemoryRouteStore::new());
    for route in routes {
        store.insert(route).await.unwrap();
    }

    let cache = Arc::new(RouteCache::new(
        Arc::clone(&store) as Arc<dyn RouteStore>
    ));
    cache.refresh().await.unwrap();

    let sink = Arc::new(CaptureSink::default());
    let registry = Arc::new(SseRegistry::new());
    let client = proxy_service::build_client(4).unwrap();

    let state = AppState {
        store: Arc::clone(&store) as Arc<dyn RouteStore>,
        cache: Arc::clone(&cache),
        limiter,
        sink: Arc::clone(&sink) as Arc<dyn AccessLogSink>,
        registry: Arc::clone(&registry),
        client,
        upstream_timeout: Duration::from_secs(5),
    };

    TestGateway {
        router: server::router(state),
        sink,
        registry,
        store,
        cache,
    }
}

/// Dispatch a request through the router, supplying the connect info the
/// proxy handler reads the peer address from.
pub async fn send(router: &Router, mut request: Request<Body>) -> Response {
    request
        .extensions_mut()
        .insert(ConnectInfo::<SocketAddr>("127.0.0.1:40000".parse().unwrap()));
    router.clone().oneshot(request).await.unwrap()
}

/// Downstream echo service on an ephemeral port.
///
/// Responds to any request with a JSON body describing what it received
/// (method, uri, headers), plus one relayable header and one hop-by-hop
/// header to exercise response hygiene.
pub async fn spawn_downstream() -> SocketAddr {
    use axum::http::HeaderMap;
    use axum::response::IntoResponse;

    async fn echo(req: Request<Body>) -> Response {
        let headers: serde_json::Map<String, serde_json::Value> = req
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    serde_json::Value::from(value.to_str().unwrap_or("")),
                )
            })
            .collect();
        let body = serde_json::json!({
            "method": req.method().as_str(),
            "uri": req.uri().to_string(),
            "headers": headers,
        });

        let mut response_headers = HeaderMap::new();
        response_headers.insert("x-upstream", "echo".parse().unwrap());
        response_headers.insert("keep-alive", "timeout=5".parse().unwrap());
        (response_headers, axum::Json(body)).into_response()
    }

    let app = Router::new().fallback(echo);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

pub async fn body_json(response: Response) -> serde_json::Value {
    use http_body_util::BodyExt;
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn body_string(response: Response) -> String {
    use http_body_util::BodyExt;
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

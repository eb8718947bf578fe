//! Error types for the proxy pipeline.
//!
//! Every error a request can hit maps to a gateway-generated HTTP response
//! with a JSON `{"error": "..."}` body. Admin API errors live in
//! [`crate::admin`]; store errors in [`crate::route_store`].

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Errors raised while proxying a single request.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// No configured route prefix matches the request path (maps to 404).
    #[error("No route found for path: {0}")]
    RouteNotFound(String),

    /// The client exhausted its token bucket (maps to 429).
    #[error("Rate limit exceeded")]
    RateLimited {
        /// Bucket capacity of the matched route, echoed in `X-RateLimit-Limit`.
        limit: i32,
    },

    /// The request was cancelled or the inbound stream broke mid-flight
    /// (maps to 500).
    #[error("Proxy request interrupted")]
    Interrupted,

    /// Any other dispatch or relay failure, including upstream timeouts
    /// (maps to 502).
    #[error("Bad gateway: {0}")]
    Upstream(String),
}

impl GatewayError {
    /// HTTP status code this error renders as.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::RouteNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Interrupted => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = serde_json::json!({ "error": self.to_string() });

        let mut response = (status, axum::Json(body)).into_response();

        // 429 responses carry the rate-limit metadata the client needs to
        // back off correctly.
        if let GatewayError::RateLimited { limit } = self {
            let headers = response.headers_mut();
            if let Ok(value) = HeaderValue::from_str(&limit.to_string()) {
                headers.insert("x-ratelimit-limit", value);
            }
            headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
            headers.insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_string(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_route_not_found_renders_404_json() {
        let response = GatewayError::RouteNotFound("/api/x".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        let body = body_string(response).await;
        assert_eq!(body, r#"{"error":"No route found for path: /api/x"}"#);
    }

    #[tokio::test]
    async fn test_rate_limited_sets_headers() {
        let response = GatewayError::RateLimited { limit: 100 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("x-ratelimit-limit").unwrap(), "100");
        assert_eq!(response.headers().get("x-ratelimit-remaining").unwrap(), "0");
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "1");
        let body = body_string(response).await;
        assert_eq!(body, r#"{"error":"Rate limit exceeded"}"#);
    }

    #[tokio::test]
    async fn test_interrupted_renders_500() {
        let response = GatewayError::Interrupted.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_string(response).await;
        assert_eq!(body, r#"{"error":"Proxy request interrupted"}"#);
    }

    #[tokio::test]
    async fn test_upstream_renders_502_with_message() {
        let response =
            GatewayError::Upstream("connection refused".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = body_string(response).await;
        assert_eq!(body, r#"{"error":"Bad gateway: connection refused"}"#);
    }
}

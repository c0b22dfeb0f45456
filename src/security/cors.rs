//! CORS preflight handling.
//!
//! The local runtime answers every preflight for a known route with the same
//! fixed header set the hosted environment uses; there is no per-origin
//! allow-list.

use std::sync::Arc;

use crate::http::{Method, Request, Response, StatusCode};
use crate::middleware::{Middleware, Next, ResponseFuture};
use crate::server::RuntimeState;

/// Headers sent, in order, on every preflight response.
pub const CORS_HEADERS: [(&str, &str); 6] = [
    ("access-control-allow-origin", "*"),
    (
        "access-control-allow-headers",
        "Accept, Authorization, Content-Type, If-Match, If-Modified-Since, If-None-Match, If-Unmodified-Since, User-Agent",
    ),
    ("access-control-allow-methods", "GET, POST, OPTIONS"),
    ("access-control-expose-headers", "ETag"),
    ("access-control-max-age", "86400"),
    ("access-control-allow-credentials", "true"),
];

/// `204 No Content` carrying exactly [`CORS_HEADERS`].
pub fn preflight_response() -> Response {
    CORS_HEADERS
        .iter()
        .fold(Response::new(StatusCode::NO_CONTENT), |response, (name, value)| {
            response.header(*name, *value)
        })
}

/// Short-circuits `OPTIONS` requests whose path resolves to a route.
///
/// Requests for unknown paths fall through so they get the regular 404.
pub struct CorsPreflight {
    state: Arc<RuntimeState>,
}

impl CorsPreflight {
    pub fn new(state: Arc<RuntimeState>) -> Self {
        Self { state }
    }
}

impl Middleware for CorsPreflight {
    fn handle(&self, request: Request, next: Next) -> ResponseFuture {
        let is_preflight =
            request.method() == &Method::Options && self.state.resolve(request.path()).is_some();

        Box::pin(async move {
            if is_preflight {
                tracing::debug!(path = %request.path(), "answering CORS preflight");
                return preflight_response();
            }
            next.run(request).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preflight_has_exactly_the_fixed_headers() {
        let response = preflight_response();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(response.body_ref().is_empty());
        assert_eq!(response.headers().len(), CORS_HEADERS.len());
        for (name, value) in CORS_HEADERS {
            assert_eq!(response.headers().get(name), Some(value));
        }
    }
}

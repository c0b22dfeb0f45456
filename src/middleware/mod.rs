//! Middleware pipeline: composable before/after request handler logic.
//!
//! Each middleware wraps the next layer, enabling request inspection,
//! short-circuit responses, and response decoration. The last entry of a
//! [`Pipeline`] is expected to always produce a response.
//!
//! ## Core types
//!
//! - [`Middleware`]: trait implemented by all middleware.
//! - [`Next`]: cursor into the remaining chain; call [`Next::run`] to advance.
//! - [`MiddlewareHandler`]: type-erased, cheaply-cloneable middleware function.
//! - [`Pipeline`]: an ordered, shareable stack of handlers.
//! - [`LoggerMiddleware`]: request/response logger.

use std::{future::Future, pin::Pin, sync::Arc};

use tokio::time::Instant;

use crate::http::{Request, Response, StatusCode};

/// A boxed, sendable response future.
pub type ResponseFuture = Pin<Box<dyn Future<Output = Response> + Send>>;

/// A type-erased, reference-counted middleware function.
pub type MiddlewareHandler = Arc<dyn Fn(Request, Next) -> ResponseFuture + Send + Sync + 'static>;

/// Converts a [`Middleware`] implementation into a [`MiddlewareHandler`].
pub fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(move |request: Request, next: Next| middleware.handle(request, next))
}

/// A cursor into the remaining middleware chain for a single request.
///
/// `Next` is consumed by [`run`](Self::run), so a middleware can forward a
/// request at most once.
pub struct Next {
    middlewares: Arc<[MiddlewareHandler]>,
    index: usize,
}

impl Next {
    /// Invokes the next middleware in the chain and returns its response.
    ///
    /// If the chain is exhausted without producing a response, a
    /// `500 Internal Server Error` is returned.
    pub async fn run(mut self, request: Request) -> Response {
        match self.middlewares.get(self.index).cloned() {
            Some(handler) => {
                self.index += 1;
                handler(request, self).await
            }
            None => Response::new(StatusCode::INTERNAL_SERVER_ERROR)
                .body("No response generated by middleware pipeline"),
        }
    }
}

/// An ordered middleware stack, built once and shared by every connection.
#[derive(Clone)]
pub struct Pipeline {
    middlewares: Arc<[MiddlewareHandler]>,
}

impl Pipeline {
    pub fn new(middlewares: Vec<MiddlewareHandler>) -> Self {
        Self {
            middlewares: middlewares.into(),
        }
    }

    /// Runs `request` through the whole stack.
    pub async fn run(&self, request: Request) -> Response {
        Next {
            middlewares: Arc::clone(&self.middlewares),
            index: 0,
        }
        .run(request)
        .await
    }
}

/// The core trait for all middleware.
///
/// Implementors may pass the request through (`next.run(request).await`),
/// short-circuit with their own [`Response`], or decorate the downstream
/// response.
pub trait Middleware: Send + Sync {
    fn handle(&self, request: Request, next: Next) -> ResponseFuture;
}

/// Logs each request's method, path, status, and duration.
///
/// Emits one `tracing::info!` line after the downstream handler completes:
///
/// ```text
/// METHOD /path - STATUS (duration)
/// ```
pub struct LoggerMiddleware;

impl Middleware for LoggerMiddleware {
    fn handle(&self, request: Request, next: Next) -> ResponseFuture {
        Box::pin(async move {
            let start = Instant::now();
            let method = request.method().as_str().to_owned();
            let path = request.path().to_owned();

            let response = next.run(request).await;

            let duration = start.elapsed();
            let status = response.status().as_u16();
            tracing::info!(%method, %path, status, ?duration, "{method} {path} - {status} ({duration:?})");

            response
        })
    }
}

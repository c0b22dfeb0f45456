//! Invocation dispatcher: from a matched function route to an HTTP response.
//!
//! One invocation walks through these states, each traced inside the
//! `dispatch` span:
//!
//! ```text
//! Idle -> EventBuilt -> ContextBuilt -> HandlerInvoked -> Succeeded | Failed -> ResponseWritten
//! ```
//!
//! [`invoke`] is the part shared with worker processes: it runs a loaded
//! handler and waits for its single completion.

mod error;
mod handler;
mod loader;

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use tracing::{Instrument, debug, info_span, warn};

pub use error::{CallbackError, HandlerError, error_response, filter_stack, is_browser};
pub use handler::{AsyncHandler, Callback, Completion, Handler, Payload, callback_fn, handler_fn};
pub use loader::{CachedLoader, HandlerLoader, LoadError, ProgramHandler, ProgramLoader, RegistryLoader, ReloadPolicy};

pub(crate) use error::panic_message;

use crate::config::ServerConfig;
use crate::context::{Event, ExecutionContext, construct_context, event_from_request};
use crate::http::{Request, Response, StatusCode};
use crate::router::RouteEntry;
use crate::runtime::PendingResponse;

/// Body of every `404` for an unknown route or a missing function file.
pub const RESOURCE_NOT_FOUND: &str = "Could not find requested resource";

/// `404 Could not find requested resource`.
pub fn not_found() -> Response {
    Response::new(StatusCode::NOT_FOUND).body(RESOURCE_NOT_FOUND)
}

/// Runs `handler` and waits for its completion.
///
/// A synchronous `Err` return and a panic inside `handle` complete the
/// callback with that error, so they are indistinguishable from an
/// asynchronous failure. If every callback clone is dropped without a
/// completion the result is a `CallbackDropped` error, and if `timeout`
/// elapses first a `TimeoutError`.
pub async fn invoke(
    handler: Arc<dyn Handler>,
    context: ExecutionContext,
    event: Event,
    timeout: Option<Duration>,
) -> Completion {
    let (callback, receiver) = Callback::channel();

    let returned = catch_unwind(AssertUnwindSafe(|| {
        handler.handle(context, event, callback.clone())
    }));
    let thrown = match returned {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(err),
        Err(panic) => Some(HandlerError::from_panic(panic)),
    };
    if let Some(err) = thrown {
        if callback.err(err).is_err() {
            warn!("handler failed after completing its callback");
        }
    }
    drop(callback);
    debug!("handler invoked");

    let completion = async {
        receiver
            .await
            .unwrap_or_else(|_| Err(HandlerError::callback_dropped()))
    };
    match timeout {
        Some(limit) => tokio::time::timeout(limit, completion)
            .await
            .unwrap_or_else(|_| Err(HandlerError::timeout(limit))),
        None => completion.await,
    }
}

/// Turns a completion into the response sent to the client.
pub fn respond(completion: Completion, user_agent: Option<&str>, full_stack_traces: bool) -> Response {
    match completion {
        Ok(payload) => PendingResponse::from(payload).into_response(),
        Err(err) => error_response(err, user_agent, full_stack_traces),
    }
}

/// Serves function routes in-process.
#[derive(Clone)]
pub struct Dispatcher {
    loader: Arc<CachedLoader>,
}

impl Dispatcher {
    pub fn new(loader: Arc<CachedLoader>) -> Self {
        Self { loader }
    }

    /// The handler cache, for invalidation on reload.
    pub fn loader(&self) -> &Arc<CachedLoader> {
        &self.loader
    }

    /// Invokes the function behind `entry` for `request`.
    pub async fn dispatch(&self, entry: &RouteEntry, request: &Request, config: &ServerConfig) -> Response {
        let span = info_span!("dispatch", path = %entry.path());
        async move {
            let user_agent = request.headers().get("user-agent");

            let event = event_from_request(request);
            debug!(fields = event.len(), "event built");
            let context = construct_context(config, entry.path());
            debug!("context built");

            let handler = match self.loader.load(&entry.resource.file_path) {
                Ok(handler) => handler,
                Err(LoadError::NotFound(file)) => {
                    warn!(file = %file.display(), "function file missing");
                    return not_found();
                }
                Err(err) => {
                    warn!(error = %err, "failed to load handler");
                    return error_response(err.into(), user_agent, config.full_stack_traces);
                }
            };

            let timeout = config.handler_timeout_ms.map(Duration::from_millis);
            let completion = invoke(handler, context, event, timeout).await;
            match &completion {
                Ok(_) => debug!("handler succeeded"),
                Err(err) => debug!(error = %err, "handler failed"),
            }

            let response = respond(completion, user_agent, config.full_stack_traces);
            debug!(status = response.status().as_u16(), "response written");
            response
        }
        .instrument(span)
        .await
    }
}

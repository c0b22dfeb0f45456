//! The handler contract: `(context, event, callback)`.
//!
//! A handler reports its outcome exactly once through its [`Callback`],
//! either right away or later from a spawned task. The callback can be
//! cloned and moved freely; the first completion wins and every later one
//! is rejected with [`CallbackError::AlreadyCompleted`].

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::warn;

use super::error::{CallbackError, HandlerError};
use crate::context::{Event, ExecutionContext};
use crate::runtime::response::CONTENT_TYPE_TEXT;
use crate::runtime::twiml::{FaxResponse, MessagingResponse, Twiml, VoiceResponse};
use crate::runtime::PendingResponse;

/// What a handler completes with on success.
///
/// The variants are tried in this order when a result is classified, and
/// only [`Payload::Twiml`] is ever treated as markup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Payload {
    Text(String),
    Twiml(Twiml),
    Response(PendingResponse),
    Json(Value),
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Twiml> for Payload {
    fn from(twiml: Twiml) -> Self {
        Self::Twiml(twiml)
    }
}

impl From<VoiceResponse> for Payload {
    fn from(twiml: VoiceResponse) -> Self {
        Self::Twiml(twiml.into())
    }
}

impl From<MessagingResponse> for Payload {
    fn from(twiml: MessagingResponse) -> Self {
        Self::Twiml(twiml.into())
    }
}

impl From<FaxResponse> for Payload {
    fn from(twiml: FaxResponse) -> Self {
        Self::Twiml(twiml.into())
    }
}

impl From<PendingResponse> for Payload {
    fn from(response: PendingResponse) -> Self {
        Self::Response(response)
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

/// The single conversion from a successful result to a response, used by
/// both the in-process and the worker path.
impl From<Payload> for PendingResponse {
    fn from(payload: Payload) -> Self {
        let mut response = PendingResponse::new();
        match payload {
            Payload::Text(text) => {
                response
                    .append_header("Content-Type", CONTENT_TYPE_TEXT)
                    .set_body(text);
            }
            Payload::Twiml(twiml) => {
                response.set_body(twiml);
            }
            Payload::Response(custom) => return custom,
            Payload::Json(value) => {
                response.set_body(value);
            }
        }
        response
    }
}

/// Result delivered through a [`Callback`].
pub type Completion = Result<Payload, HandlerError>;

/// Error-first completion callback.
#[derive(Debug, Clone)]
pub struct Callback {
    slot: Arc<Mutex<Option<oneshot::Sender<Completion>>>>,
}

impl Callback {
    pub(crate) fn channel() -> (Self, oneshot::Receiver<Completion>) {
        let (sender, receiver) = oneshot::channel();
        let callback = Self {
            slot: Arc::new(Mutex::new(Some(sender))),
        };
        (callback, receiver)
    }

    /// Completes the invocation.
    ///
    /// # Errors
    ///
    /// [`CallbackError::AlreadyCompleted`] on any call after the first, and
    /// [`CallbackError::Abandoned`] if the invocation stopped waiting (for
    /// example after a timeout).
    pub fn done<P: Into<Payload>>(&self, result: Result<P, HandlerError>) -> Result<(), CallbackError> {
        let sender = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(sender) = sender else {
            warn!("handler completed its callback more than once; ignoring");
            return Err(CallbackError::AlreadyCompleted);
        };
        sender
            .send(result.map(Into::into))
            .map_err(|_| CallbackError::Abandoned)
    }

    /// Shorthand for `done(Ok(payload))`.
    pub fn ok(&self, payload: impl Into<Payload>) -> Result<(), CallbackError> {
        self.done(Ok(payload.into()))
    }

    /// Shorthand for `done(Err(error))`.
    pub fn err(&self, error: impl Into<HandlerError>) -> Result<(), CallbackError> {
        self.done::<Payload>(Err(error.into()))
    }

    pub fn is_completed(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

/// A function handler.
///
/// Returning `Err` (or panicking) is equivalent to completing the callback
/// with that error.
pub trait Handler: Send + Sync {
    fn handle(&self, context: ExecutionContext, event: Event, callback: Callback) -> Result<(), HandlerError>;
}

impl<F> Handler for F
where
    F: Fn(ExecutionContext, Event, Callback) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, context: ExecutionContext, event: Event, callback: Callback) -> Result<(), HandlerError> {
        self(context, event, callback)
    }
}

/// Pins a closure to the callback-style handler signature.
///
/// ```
/// use twilio_run::dispatch::callback_fn;
///
/// let handler = callback_fn(|_context, _event, callback| {
///     let _ = callback.ok("Ahoy!");
///     Ok(())
/// });
/// # let _ = handler;
/// ```
pub fn callback_fn<F>(f: F) -> F
where
    F: Fn(ExecutionContext, Event, Callback) -> Result<(), HandlerError> + Send + Sync,
{
    f
}

/// Adapts an `async` function returning a [`Completion`] into a [`Handler`].
///
/// ```
/// use twilio_run::dispatch::{Payload, handler_fn};
///
/// let handler = handler_fn(|_context, event| async move {
///     let name = event.get("name").and_then(|v| v.as_str()).unwrap_or("world");
///     Ok(Payload::from(format!("Hello {name}")))
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> AsyncHandler<F>
where
    F: Fn(ExecutionContext, Event) -> Fut + Send + Sync,
    Fut: Future<Output = Completion> + Send + 'static,
{
    AsyncHandler { f }
}

/// See [`handler_fn`].
#[derive(Clone)]
pub struct AsyncHandler<F> {
    f: F,
}

impl<F, Fut> Handler for AsyncHandler<F>
where
    F: Fn(ExecutionContext, Event) -> Fut + Send + Sync,
    Fut: Future<Output = Completion> + Send + 'static,
{
    fn handle(&self, context: ExecutionContext, event: Event, callback: Callback) -> Result<(), HandlerError> {
        let task = tokio::spawn((self.f)(context, event));
        tokio::spawn(async move {
            let completion = match task.await {
                Ok(completion) => completion,
                Err(join_error) if join_error.is_panic() => {
                    Err(HandlerError::from_panic(join_error.into_panic()))
                }
                Err(join_error) => Err(HandlerError::named("Cancelled", join_error.to_string())),
            };
            let _ = callback.done(completion);
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::response::{CONTENT_TYPE_JSON, CONTENT_TYPE_XML};
    use crate::http::HeaderValue;
    use serde_json::json;

    #[test]
    fn second_completion_is_rejected() {
        let (callback, mut receiver) = Callback::channel();
        let clone = callback.clone();
        assert_eq!(callback.ok("first"), Ok(()));
        assert_eq!(clone.ok("second"), Err(CallbackError::AlreadyCompleted));
        assert!(clone.is_completed());
        assert_eq!(receiver.try_recv().unwrap(), Ok(Payload::from("first")));
    }

    #[test]
    fn abandoned_invocation() {
        let (callback, receiver) = Callback::channel();
        drop(receiver);
        assert_eq!(callback.err("late"), Err(CallbackError::Abandoned));
    }

    #[test]
    fn text_payload_is_plain_text() {
        let response = PendingResponse::from(Payload::from("Yay")).serialize();
        assert_eq!(response.status_code, 200);
        assert_eq!(response.headers["Content-Type"], HeaderValue::from(CONTENT_TYPE_TEXT));
        assert_eq!(response.body, "Yay");
    }

    #[test]
    fn markup_payload_never_falls_through_to_json() {
        let payload = Payload::from(VoiceResponse::new().say("hi"));
        let response = PendingResponse::from(payload).serialize();
        assert_eq!(response.headers["Content-Type"], HeaderValue::from(CONTENT_TYPE_XML));
        assert!(response.body.starts_with("<?xml"));
    }

    #[test]
    fn custom_response_overrides_defaults() {
        let mut custom = PendingResponse::new();
        custom.set_status_code(418).set_body("teapot");
        let response = PendingResponse::from(Payload::from(custom)).serialize();
        assert_eq!(response.status_code, 418);
        assert!(response.headers.is_empty());
        assert_eq!(response.body, "teapot");
    }

    #[test]
    fn json_payload() {
        let response = PendingResponse::from(Payload::from(json!({"ok": true}))).serialize();
        assert_eq!(response.headers["Content-Type"], HeaderValue::from(CONTENT_TYPE_JSON));
        assert_eq!(response.body, r#"{"ok":true}"#);
    }

    #[test]
    fn markup_lookalike_json_stays_json() {
        let payload: Payload =
            serde_json::from_value(json!({"type": "json", "value": {"twiml": "voice", "verbs": []}})).unwrap();
        assert!(matches!(payload, Payload::Json(_)));
        let response = PendingResponse::from(payload).serialize();
        assert_eq!(response.headers["Content-Type"], HeaderValue::from(CONTENT_TYPE_JSON));
    }

    #[test]
    fn markup_lookalike_response_body_stays_json() {
        let payload: Payload = serde_json::from_value(json!({
            "type": "response",
            "value": {"statusCode": 201, "body": {"twiml": "voice", "note": "keep me"}}
        }))
        .unwrap();
        let response = PendingResponse::from(payload).serialize();
        assert_eq!(response.status_code, 201);
        assert_eq!(response.headers["Content-Type"], HeaderValue::from(CONTENT_TYPE_JSON));
        assert!(response.body.contains("keep me"));
    }

    #[test]
    fn payload_wire_format() {
        let value = serde_json::to_value(Payload::from("Yay")).unwrap();
        assert_eq!(value, json!({"type": "text", "value": "Yay"}));
    }
}

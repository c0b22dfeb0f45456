//! Handler errors and how they reach the client.
//!
//! Every failure of an invocation ends up as a [`HandlerError`] and is sent
//! with status 500 by [`error_response`]. Exceptions get their stacks
//! trimmed of runtime frames so the client only sees the handler's own code,
//! unless full traces were asked for.

use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt::Write as _;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use crate::http::{Response, StatusCode};
use crate::security::CredentialError;

/// Frames containing any of these belong to the runtime, not to handler code.
const INTERNAL_FRAME_MARKERS: [&str; 8] = [
    "twilio_run::",
    "std::backtrace",
    "tokio::",
    "std::panic",
    "core::ops::function",
    "std::rt",
    "std::sys",
    "__rust_begin_short_backtrace",
];

const DEFAULT_ERROR_NAME: &str = "Error";

/// The error value a handler completes with.
///
/// An `Exception` is an error object with a name, a message and possibly a
/// stack. Anything else a handler reports is carried as a raw `Value` and
/// sent back unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[serde(untagged)]
pub enum HandlerError {
    #[error("{name}: {message}")]
    Exception {
        message: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
    },
    #[error("{0}")]
    Value(Value),
}

impl HandlerError {
    /// An `Error` with the current backtrace as its stack.
    pub fn new(message: impl Into<String>) -> Self {
        Self::named(DEFAULT_ERROR_NAME, message)
    }

    /// An exception called `name`, with the current backtrace as its stack.
    pub fn named(name: impl Into<String>, message: impl Into<String>) -> Self {
        let name = name.into();
        let message = message.into();
        let stack = capture_stack(&name, &message);
        Self::Exception {
            message,
            name,
            stack: Some(stack),
        }
    }

    /// Converts a caught panic payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Self::named("Panic", panic_message(payload.as_ref()))
    }

    /// Every callback clone went away before anything completed the invocation.
    pub fn callback_dropped() -> Self {
        Self::named(
            "CallbackDropped",
            "handler finished without calling its callback",
        )
    }

    pub fn timeout(limit: Duration) -> Self {
        Self::named(
            "TimeoutError",
            format!("handler did not complete within {}ms", limit.as_millis()),
        )
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Exception { name, .. } => Some(name),
            Self::Value(_) => None,
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Exception { message, .. } => Some(message),
            Self::Value(_) => None,
        }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<Value> for HandlerError {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<CredentialError> for HandlerError {
    fn from(err: CredentialError) -> Self {
        Self::named(err.kind, err.to_string())
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(err: std::io::Error) -> Self {
        Self::named("IoError", err.to_string())
    }
}

/// Returned when a [`Callback`](super::Callback) cannot deliver a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CallbackError {
    #[error("callback was already completed")]
    AlreadyCompleted,

    #[error("invocation is no longer waiting for a result")]
    Abandoned,
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_owned()
    }
}

fn capture_stack(name: &str, message: &str) -> String {
    let backtrace = Backtrace::capture();
    match backtrace.status() {
        BacktraceStatus::Captured => format!("{name}: {message}\n{backtrace}"),
        _ => format!("{name}: {message}"),
    }
}

/// Removes runtime frames from a rendered backtrace.
///
/// A frame starts at a line of the form `  N: symbol` and owns the
/// `at file:line` lines that follow it. Lines before the first frame are
/// kept as they are.
///
/// ```
/// use twilio_run::dispatch::filter_stack;
///
/// let stack = "Error: boom\n   0: twilio_run::dispatch::invoke\n             at src/dispatch/mod.rs:1:1\n   1: my_project::handler\n             at src/main.rs:9:5";
/// assert_eq!(
///     filter_stack(stack),
///     "Error: boom\n   1: my_project::handler\n             at src/main.rs:9:5"
/// );
/// ```
pub fn filter_stack(stack: &str) -> String {
    let mut kept: Vec<&str> = Vec::new();
    let mut keep_frame = true;
    for line in stack.lines() {
        if is_frame_start(line) {
            keep_frame = !INTERNAL_FRAME_MARKERS
                .iter()
                .any(|marker| line.contains(marker));
        }
        if keep_frame {
            kept.push(line);
        }
    }
    kept.join("\n")
}

fn is_frame_start(line: &str) -> bool {
    let trimmed = line.trim_start();
    let digits = trimmed.chars().take_while(char::is_ascii_digit).count();
    digits > 0 && trimmed[digits..].starts_with(':')
}

/// Product tokens that open the `User-Agent` of desktop and mobile browsers.
///
/// Chrome, Safari, Firefox and Edge on every platform (iOS and Android
/// included) send `Mozilla/`; the rest cover older Opera builds and mobile
/// browsers that drop the compatibility token.
const BROWSER_PRODUCTS: [&str; 4] = ["Mozilla/", "Opera/", "Opera Mini/", "UCWEB/"];

/// Whether a `User-Agent` belongs to a desktop or mobile browser.
pub fn is_browser(user_agent: Option<&str>) -> bool {
    user_agent.is_some_and(|ua| BROWSER_PRODUCTS.iter().any(|product| ua.starts_with(product)))
}

/// Renders a failed invocation as a `500` response.
///
/// Browsers get an HTML page; other clients get `{message, name, stack}`
/// as JSON. Raw error values are sent as they are.
pub fn error_response(error: HandlerError, user_agent: Option<&str>, full_stack_traces: bool) -> Response {
    let response = Response::new(StatusCode::INTERNAL_SERVER_ERROR);
    match error {
        HandlerError::Exception {
            message,
            name,
            stack,
        } => {
            let stack = stack.map(|stack| {
                if full_stack_traces {
                    stack
                } else {
                    filter_stack(&stack)
                }
            });
            if is_browser(user_agent) {
                response
                    .header("Content-Type", "text/html; charset=utf-8")
                    .body(error_page(&name, &message, stack.as_deref()))
            } else {
                response
                    .header("Content-Type", "application/json")
                    .body(json!({"message": message, "name": name, "stack": stack}).to_string())
            }
        }
        HandlerError::Value(Value::String(text)) => response
            .header("Content-Type", "text/plain")
            .body(text),
        HandlerError::Value(value) => response
            .header("Content-Type", "application/json")
            .body(value.to_string()),
    }
}

const ERROR_PAGE_STYLE: &str = "body{font-family:-apple-system,BlinkMacSystemFont,'Segoe UI',Helvetica,Arial,sans-serif;margin:2rem;color:#121c2d}h1{font-size:1.4rem;color:#d61f1f}pre{background:#f4f4f6;padding:1rem;overflow:auto}";

fn error_page(name: &str, message: &str, stack: Option<&str>) -> String {
    let mut page = String::new();
    let _ = write!(
        page,
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>{}</title><style>{ERROR_PAGE_STYLE}</style></head><body><h1>{}: {}</h1>",
        escape_html(name),
        escape_html(name),
        escape_html(message),
    );
    if let Some(stack) = stack {
        let _ = write!(page, "<pre>{}</pre>", escape_html(stack));
    }
    page.push_str("</body></html>");
    page
}

fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    const STACK: &str = "Error: boom\n   0: std::backtrace::Backtrace::capture\n             at /rustc/library/std/src/backtrace.rs:1:1\n   1: twilio_run::dispatch::error::HandlerError::new\n   2: my_project::functions::sms\n             at src/sms.rs:12:9\n   3: tokio::runtime::task::core::Core<T,S>::poll\n  10: core::ops::function::FnOnce::call_once";

    fn exception() -> HandlerError {
        HandlerError::Exception {
            message: "boom".into(),
            name: "Error".into(),
            stack: Some(STACK.into()),
        }
    }

    #[test]
    fn filter_keeps_user_frames_only() {
        assert_eq!(
            filter_stack(STACK),
            "Error: boom\n   2: my_project::functions::sms\n             at src/sms.rs:12:9"
        );
    }

    #[test]
    fn browser_detection_covers_mobile() {
        assert!(is_browser(Some(
            "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 Mobile/15E148"
        )));
        assert!(is_browser(Some("Opera/9.80 (Android; Opera Mini/7.5.33361/31.1448; U; en) Presto/2.8.119")));
        assert!(is_browser(Some("UCWEB/2.0 (MIDP-2.0; U; Adr 9.0.0) UCBrowser/13.4.0.1306")));
        assert!(!is_browser(Some("curl/8.4.0")));
        assert!(!is_browser(Some("TwilioProxy/1.1")));
        assert!(!is_browser(None));
    }

    #[test]
    fn frame_detection() {
        assert!(is_frame_start("   12: foo"));
        assert!(!is_frame_start("             at src/a.rs:1:1"));
        assert!(!is_frame_start("Error: 12: nope"));
    }

    #[test]
    fn json_error_for_api_clients() {
        let response = error_response(exception(), Some("curl/8.0"), false);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = serde_json::from_str(&response.body_text()).unwrap();
        assert_eq!(body["message"], "boom");
        assert_eq!(body["name"], "Error");
        assert!(!body["stack"].as_str().unwrap().contains("tokio::"));
    }

    #[test]
    fn full_stack_traces_keep_runtime_frames() {
        let response = error_response(exception(), None, true);
        let body: Value = serde_json::from_str(&response.body_text()).unwrap();
        assert_eq!(body["stack"], STACK);
    }

    #[test]
    fn html_error_for_browsers() {
        let ua = "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_0) AppleWebKit/605.1.15";
        let response = error_response(HandlerError::named("TypeError", "<bad>"), Some(ua), false);
        assert_eq!(response.headers().get("content-type"), Some("text/html; charset=utf-8"));
        let body = response.body_text();
        assert!(body.contains("<h1>TypeError: &lt;bad&gt;</h1>"));
        assert!(body.contains("<style>"));
    }

    #[test]
    fn raw_values_are_sent_as_is() {
        let response = error_response(HandlerError::Value(json!({"code": 42})), None, false);
        assert_eq!(response.status().as_u16(), 500);
        assert_eq!(response.body_text(), r#"{"code":42}"#);

        let response = error_response(HandlerError::Value(json!("nope")), None, false);
        assert_eq!(response.body_text(), "nope");
    }

    #[test]
    fn panic_payloads_become_messages() {
        let err = HandlerError::from_panic(Box::new("kaboom"));
        assert_eq!(err.name(), Some("Panic"));
        assert_eq!(err.message(), Some("kaboom"));
        let err = HandlerError::from_panic(Box::new(String::from("owned")));
        assert_eq!(err.message(), Some("owned"));
    }

    #[test]
    fn untagged_serde() {
        let err: HandlerError = serde_json::from_value(json!({"message": "m", "name": "N"})).unwrap();
        assert_eq!(err.name(), Some("N"));
        let err: HandlerError = serde_json::from_value(json!(17)).unwrap();
        assert_eq!(err, HandlerError::Value(json!(17)));
    }
}

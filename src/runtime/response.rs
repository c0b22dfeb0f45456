//! The response object handler code builds and hands back.
//!
//! [`PendingResponse`] is a plain value: status, headers and body, mutated
//! only through its setters. It leaves a process in one of two ways:
//!
//! - [`PendingResponse::into_response`] writes it onto an HTTP [`Response`]
//!   (in-process dispatch).
//! - [`PendingResponse::serialize`] flattens it into a [`SerializedResponse`]
//!   whose body is always a string, so it can cross the worker boundary.
//!
//! Both paths apply the same default `Content-Type` for structured and
//! markup bodies, so a reply looks the same whichever way it travelled.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::twiml::Twiml;
use crate::http::{HeaderValue, Response, StatusCode};

pub const CONTENT_TYPE_TEXT: &str = "text/plain";
pub const CONTENT_TYPE_XML: &str = "text/xml";
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Header map of a [`PendingResponse`].
pub type HeaderMap = BTreeMap<String, HeaderValue>;

/// A response body of unconstrained shape.
///
/// Markup is only ever set from a [`Twiml`] value. Deserialized bodies are
/// text when they are a JSON string and JSON otherwise, whatever keys they
/// carry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Body {
    Text(String),
    Markup(Twiml),
    Json(Value),
}

impl<'de> Deserialize<'de> for Body {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match Value::deserialize(deserializer)? {
            Value::String(text) => Self::Text(text),
            value => Self::Json(value),
        })
    }
}

impl Body {
    /// The string form sent on the wire.
    pub fn render(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Markup(twiml) => twiml.to_string(),
            Self::Json(value) => value.to_string(),
        }
    }

    fn default_content_type(&self) -> Option<&'static str> {
        match self {
            Self::Text(_) => None,
            Self::Markup(_) => Some(CONTENT_TYPE_XML),
            Self::Json(_) => Some(CONTENT_TYPE_JSON),
        }
    }
}

impl From<&str> for Body {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Value> for Body {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl From<Twiml> for Body {
    fn from(twiml: Twiml) -> Self {
        Self::Markup(twiml)
    }
}

/// A mutable, pending HTTP response.
///
/// # Examples
///
/// ```
/// use twilio_run::runtime::PendingResponse;
///
/// let mut response = PendingResponse::new();
/// response.set_status_code(418);
/// response.append_header("X-Tea", "earl grey");
/// response.set_body(serde_json::json!({"brewing": true}));
///
/// let wire = response.serialize();
/// assert_eq!(wire.status_code, 418);
/// assert_eq!(wire.body, r#"{"brewing":true}"#);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingResponse {
    #[serde(default = "default_status")]
    status_code: u16,
    #[serde(default)]
    headers: HeaderMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    body: Option<Body>,
}

fn default_status() -> u16 {
    200
}

impl Default for PendingResponse {
    fn default() -> Self {
        Self {
            status_code: default_status(),
            headers: HeaderMap::new(),
            body: None,
        }
    }
}

impl PendingResponse {
    /// Status 200, no headers, no body.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    pub fn set_status_code(&mut self, status_code: u16) -> &mut Self {
        self.status_code = status_code;
        self
    }

    pub fn set_body(&mut self, body: impl Into<Body>) -> &mut Self {
        self.body = Some(body.into());
        self
    }

    /// Replaces the whole header map.
    pub fn set_headers(&mut self, headers: HeaderMap) -> &mut Self {
        self.headers = headers;
        self
    }

    /// Sets a single header, overwriting any previous value under that name.
    pub fn append_header(&mut self, name: impl Into<String>, value: impl Into<HeaderValue>) -> &mut Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    fn has_content_type(&self) -> bool {
        self.headers
            .keys()
            .any(|name| name.eq_ignore_ascii_case("content-type"))
    }

    fn resolved_headers(&self) -> HeaderMap {
        let mut headers = self.headers.clone();
        if !self.has_content_type() {
            if let Some(content_type) = self.body.as_ref().and_then(Body::default_content_type) {
                headers.insert("Content-Type".to_owned(), content_type.into());
            }
        }
        headers
    }

    /// Writes status, headers and body onto an HTTP response.
    pub fn into_response(self) -> Response {
        self.serialize().into_response()
    }

    /// Flattens the response into a transport-safe record.
    pub fn serialize(&self) -> SerializedResponse {
        SerializedResponse {
            status_code: self.status_code,
            headers: self.resolved_headers(),
            body: self.body.as_ref().map(Body::render).unwrap_or_default(),
        }
    }
}

/// The flat `{statusCode, headers, body}` record exchanged with workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedResponse {
    pub status_code: u16,
    #[serde(default)]
    pub headers: HeaderMap,
    #[serde(default)]
    pub body: String,
}

impl SerializedResponse {
    /// Writes the record onto an HTTP response verbatim.
    pub fn into_response(self) -> Response {
        let mut response = Response::new(StatusCode::from_u16(self.status_code));
        for (name, value) in &self.headers {
            for value in value.values() {
                response.add_header(name.as_str(), value);
            }
        }
        response.body(self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::twiml::MessagingResponse;
    use serde_json::json;

    #[test]
    fn defaults() {
        let response = PendingResponse::new();
        assert_eq!(response.status_code(), 200);
        assert!(response.headers().is_empty());
        assert!(response.body().is_none());
        assert_eq!(response.serialize().body, "");
    }

    #[test]
    fn append_header_overwrites_single_name() {
        let mut response = PendingResponse::new();
        response.append_header("X-A", "1").append_header("X-A", "2");
        assert_eq!(response.headers()["X-A"], HeaderValue::from("2"));
    }

    #[test]
    fn set_headers_replaces_map() {
        let mut response = PendingResponse::new();
        response.append_header("X-Old", "1");
        let mut headers = HeaderMap::new();
        headers.insert("X-New".into(), "2".into());
        response.set_headers(headers);
        assert!(!response.headers().contains_key("X-Old"));
        assert!(response.headers().contains_key("X-New"));
    }

    #[test]
    fn serialize_renders_markup_and_stringifies_json() {
        let mut response = PendingResponse::new();
        response.set_body(Twiml::from(MessagingResponse::new().message("hi")));
        let wire = response.serialize();
        assert!(wire.body.contains("<Message>hi</Message>"));
        assert_eq!(wire.headers["Content-Type"], HeaderValue::from(CONTENT_TYPE_XML));

        response.set_body(json!([1, 2]));
        let wire = response.serialize();
        assert_eq!(wire.body, "[1,2]");
        assert_eq!(wire.headers["Content-Type"], HeaderValue::from(CONTENT_TYPE_JSON));
    }

    #[test]
    fn caller_content_type_is_kept() {
        let mut response = PendingResponse::new();
        response
            .append_header("content-type", "application/vnd.api+json")
            .set_body(json!({"a": 1}));
        let wire = response.serialize();
        assert_eq!(wire.headers.len(), 1);
        assert_eq!(
            wire.headers["content-type"],
            HeaderValue::from("application/vnd.api+json")
        );
    }

    #[test]
    fn into_response_keeps_custom_status_and_repeated_headers() {
        let mut response = PendingResponse::new();
        response
            .set_status_code(418)
            .append_header("Set-Cookie", vec!["a=1".to_owned(), "b=2".to_owned()])
            .set_body("short and stout");
        let http = response.into_response();
        assert_eq!(http.status().as_u16(), 418);
        let cookies: Vec<_> = http.headers().get_all("set-cookie").collect();
        assert_eq!(cookies, vec!["a=1", "b=2"]);
        assert_eq!(http.body_text(), "short and stout");
    }

    #[test]
    fn serialized_record_uses_camel_case() {
        let mut response = PendingResponse::new();
        response.set_status_code(201).set_body("made");
        let value = serde_json::to_value(response.serialize()).unwrap();
        assert_eq!(value, json!({"statusCode": 201, "headers": {}, "body": "made"}));
    }

    #[test]
    fn deserializes_response_with_text_body() {
        let response: PendingResponse =
            serde_json::from_value(json!({"statusCode": 302, "headers": {"Location": "/x"}})).unwrap();
        assert_eq!(response.status_code(), 302);
        assert!(response.body().is_none());

        let response: PendingResponse = serde_json::from_value(json!({"body": "hi"})).unwrap();
        assert_eq!(response.status_code(), 200);
        assert_eq!(response.body(), Some(&Body::Text("hi".into())));
    }

    #[test]
    fn deserialized_body_shaped_like_markup_stays_json() {
        let body = json!({"twiml": "voice", "verbs": [], "note": "keep me"});
        let response: PendingResponse =
            serde_json::from_value(json!({"statusCode": 200, "body": body.clone()})).unwrap();
        assert_eq!(response.body(), Some(&Body::Json(body.clone())));

        let wire = response.serialize();
        assert_eq!(wire.headers["Content-Type"], HeaderValue::from(CONTENT_TYPE_JSON));
        let sent: Value = serde_json::from_str(&wire.body).unwrap();
        assert_eq!(sent, body);
    }
}

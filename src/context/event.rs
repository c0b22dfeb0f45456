//! The event object: request parameters as handler input.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::http::{HeaderValue, Headers, Request};
use crate::security::is_restricted_header;

/// Flat key/value input of a handler invocation.
pub type Event = Map<String, Value>;

const REQUEST_KEY: &str = "request";

/// Merges query and body fields and attaches request metadata.
///
/// Body fields win over query fields with the same key. Unless the merged
/// fields already contain a `request` key, a `request` object with the
/// normalized headers and the parsed cookies is added.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use twilio_run::context::construct_event;
/// use twilio_run::http::Headers;
///
/// let query = json!({"Body": "Hello", "From": "+1"});
/// let body = json!({"Body": "Bye"});
/// let event = construct_event(
///     query.as_object().unwrap().clone(),
///     body.as_object().unwrap().clone(),
///     &Headers::new(),
/// );
/// assert_eq!(
///     serde_json::Value::Object(event),
///     json!({"Body": "Bye", "From": "+1", "request": {"headers": {}, "cookies": {}}})
/// );
/// ```
pub fn construct_event(query: Map<String, Value>, body: Map<String, Value>, headers: &Headers) -> Event {
    let mut event = query;
    event.extend(body);

    if !event.contains_key(REQUEST_KEY) {
        let headers_value = construct_headers(headers)
            .into_iter()
            .map(|(name, value)| (name, header_to_json(value)))
            .collect::<Map<_, _>>();
        let cookies = parse_cookies(headers)
            .into_iter()
            .map(|(name, value)| (name, Value::String(value)))
            .collect::<Map<_, _>>();

        let mut request = Map::new();
        request.insert("headers".to_owned(), Value::Object(headers_value));
        request.insert("cookies".to_owned(), Value::Object(cookies));
        event.insert(REQUEST_KEY.to_owned(), Value::Object(request));
    }
    event
}

/// The [`Event`] for an HTTP request.
pub fn event_from_request(request: &Request) -> Event {
    construct_event(request.query(), request.body_fields(), request.headers())
}

/// Normalizes inbound headers for handler code.
///
/// Names are lowercased, restricted headers are dropped and repeated names
/// collapse into a [`HeaderValue::Many`] in arrival order.
pub fn construct_headers(headers: &Headers) -> BTreeMap<String, HeaderValue> {
    let mut normalized: BTreeMap<String, HeaderValue> = BTreeMap::new();
    for (name, value) in headers.iter() {
        let name = name.to_ascii_lowercase();
        if is_restricted_header(&name) {
            continue;
        }
        match normalized.get_mut(&name) {
            Some(existing) => existing.push(value),
            None => {
                normalized.insert(name, HeaderValue::from(value));
            }
        }
    }
    normalized
}

/// Parses every `Cookie` header into name/value pairs. Later duplicates win.
pub fn parse_cookies(headers: &Headers) -> BTreeMap<String, String> {
    headers
        .get_all("cookie")
        .flat_map(|header| header.split(';'))
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            (!name.is_empty()).then(|| (name.to_owned(), value.trim().trim_matches('"').to_owned()))
        })
        .collect()
}

fn header_to_json(value: HeaderValue) -> Value {
    match value {
        HeaderValue::One(value) => Value::String(value),
        HeaderValue::Many(values) => Value::Array(values.into_iter().map(Value::String).collect()),
    }
}

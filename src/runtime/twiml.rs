//! Markup responses for voice, messaging and fax webhooks.
//!
//! Each document type is a builder over a list of verbs that renders to the
//! XML the platform expects:
//!
//! ```
//! use twilio_run::runtime::twiml::{Element, VoiceResponse};
//!
//! let twiml = VoiceResponse::new()
//!     .say("Hello & welcome")
//!     .verb(Element::new("Dial").attr("timeout", "10").text("+15550100"));
//!
//! assert_eq!(
//!     twiml.to_string(),
//!     r#"<?xml version="1.0" encoding="UTF-8"?><Response><Say>Hello &amp; welcome</Say><Dial timeout="10">+15550100</Dial></Response>"#
//! );
//! ```
//!
//! [`Twiml`] is the closed set of document types. Classification of a
//! handler result as markup goes through this enum only; an arbitrary JSON
//! object that happens to look like a document is never treated as one.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

/// A single XML element: a verb or a noun nested inside one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Element>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    #[must_use]
    pub fn child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}", self.name)?;
        for (name, value) in &self.attributes {
            write!(f, " {name}=\"{}\"", escape(value))?;
        }
        if self.text.is_none() && self.children.is_empty() {
            return f.write_str("/>");
        }
        f.write_str(">")?;
        if let Some(text) = &self.text {
            f.write_str(&escape(text))?;
        }
        for child in &self.children {
            write!(f, "{child}")?;
        }
        write!(f, "</{}>", self.name)
    }
}

fn escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

fn render_document(verbs: &[Element], f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(XML_DECLARATION)?;
    if verbs.is_empty() {
        return f.write_str("<Response/>");
    }
    f.write_str("<Response>")?;
    for verb in verbs {
        write!(f, "{verb}")?;
    }
    f.write_str("</Response>")
}

macro_rules! markup_document {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
        pub struct $name {
            #[serde(default)]
            verbs: Vec<Element>,
        }

        impl $name {
            pub fn new() -> Self {
                Self::default()
            }

            /// Appends an arbitrary verb.
            #[must_use]
            pub fn verb(mut self, verb: Element) -> Self {
                self.verbs.push(verb);
                self
            }

            pub fn verbs(&self) -> &[Element] {
                &self.verbs
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                render_document(&self.verbs, f)
            }
        }
    };
}

markup_document!(
    /// Voice call instructions.
    VoiceResponse
);
markup_document!(
    /// Messaging (SMS, chat) replies.
    MessagingResponse
);
markup_document!(
    /// Fax receive instructions.
    FaxResponse
);

impl VoiceResponse {
    #[must_use]
    pub fn say(self, text: impl Into<String>) -> Self {
        self.verb(Element::new("Say").text(text))
    }

    #[must_use]
    pub fn play(self, url: impl Into<String>) -> Self {
        self.verb(Element::new("Play").text(url))
    }

    #[must_use]
    pub fn pause(self, seconds: u32) -> Self {
        self.verb(Element::new("Pause").attr("length", seconds.to_string()))
    }

    #[must_use]
    pub fn dial(self, number: impl Into<String>) -> Self {
        self.verb(Element::new("Dial").text(number))
    }

    #[must_use]
    pub fn redirect(self, url: impl Into<String>) -> Self {
        self.verb(Element::new("Redirect").text(url))
    }

    #[must_use]
    pub fn reject(self) -> Self {
        self.verb(Element::new("Reject"))
    }

    #[must_use]
    pub fn hangup(self) -> Self {
        self.verb(Element::new("Hangup"))
    }
}

impl MessagingResponse {
    #[must_use]
    pub fn message(self, body: impl Into<String>) -> Self {
        self.verb(Element::new("Message").text(body))
    }

    #[must_use]
    pub fn redirect(self, url: impl Into<String>) -> Self {
        self.verb(Element::new("Redirect").text(url))
    }
}

impl FaxResponse {
    /// Accepts the incoming fax, optionally posting the result to `action`.
    #[must_use]
    pub fn receive(self, action: Option<&str>) -> Self {
        let receive = Element::new("Receive");
        self.verb(match action {
            Some(action) => receive.attr("action", action),
            None => receive,
        })
    }

    #[must_use]
    pub fn reject(self) -> Self {
        self.verb(Element::new("Reject"))
    }
}

/// The closed set of markup document types.
///
/// New document kinds must be added here explicitly; nothing else is ever
/// classified as markup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "twiml", rename_all = "lowercase")]
pub enum Twiml {
    Voice(VoiceResponse),
    Messaging(MessagingResponse),
    Fax(FaxResponse),
}

impl fmt::Display for Twiml {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Voice(doc) => fmt::Display::fmt(doc, f),
            Self::Messaging(doc) => fmt::Display::fmt(doc, f),
            Self::Fax(doc) => fmt::Display::fmt(doc, f),
        }
    }
}

impl From<VoiceResponse> for Twiml {
    fn from(doc: VoiceResponse) -> Self {
        Self::Voice(doc)
    }
}

impl From<MessagingResponse> for Twiml {
    fn from(doc: MessagingResponse) -> Self {
        Self::Messaging(doc)
    }
}

impl From<FaxResponse> for Twiml {
    fn from(doc: FaxResponse) -> Self {
        Self::Fax(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_document_is_self_closing() {
        assert_eq!(
            MessagingResponse::new().to_string(),
            r#"<?xml version="1.0" encoding="UTF-8"?><Response/>"#
        );
    }

    #[test]
    fn messaging_reply() {
        let twiml = MessagingResponse::new().message("Ahoy <3");
        assert_eq!(
            twiml.to_string(),
            r#"<?xml version="1.0" encoding="UTF-8"?><Response><Message>Ahoy &lt;3</Message></Response>"#
        );
    }

    #[test]
    fn nested_elements_and_attributes() {
        let twiml = VoiceResponse::new().verb(
            Element::new("Gather")
                .attr("input", "speech")
                .child(Element::new("Say").text("Speak now")),
        );
        assert!(twiml
            .to_string()
            .ends_with(r#"<Gather input="speech"><Say>Speak now</Say></Gather></Response>"#));
    }

    #[test]
    fn fax_receive() {
        let twiml = FaxResponse::new().receive(Some("/fax/received"));
        assert!(twiml
            .to_string()
            .contains(r#"<Receive action="/fax/received"/>"#));
    }

    #[test]
    fn twiml_serde_is_tagged_by_kind() {
        let twiml = Twiml::from(VoiceResponse::new().hangup());
        let value = serde_json::to_value(&twiml).unwrap();
        assert_eq!(value, json!({"twiml": "voice", "verbs": [{"name": "Hangup"}]}));
        let back: Twiml = serde_json::from_value(value).unwrap();
        assert_eq!(back, twiml);
    }

    #[test]
    fn untagged_lookalike_is_not_markup() {
        let lookalike = json!({"verbs": [{"name": "Say", "text": "hi"}]});
        assert!(serde_json::from_value::<Twiml>(lookalike).is_err());
    }
}

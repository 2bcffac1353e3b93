// packages/engine/src/discrimination/session.rs
//! Session documents
//!
//! A session is the JSON trace of one inbound call:
//!
//! ```json
//! {
//!   "CallFromInbound": { "Request": "..." },
//!   "ReturnInbound":   { "Response": "..." },
//!   "Actions": [ { "ServiceName": "...", "Request": "...", "Response": "..." } ]
//! }
//! ```
//!
//! Only these fields are read; everything else is skipped. Strings borrow from
//! the input unless they contain escapes.

use crate::utils::errors::{EngineError, Result};
use serde::Deserialize;
use std::borrow::Cow;

/// Borrowed view of a session document
#[derive(Debug, Default, Deserialize)]
pub struct SessionDoc<'a> {
    #[serde(rename = "CallFromInbound", default, borrow)]
    pub call_from_inbound: Option<InboundCall<'a>>,

    #[serde(rename = "ReturnInbound", default, borrow)]
    pub return_inbound: Option<InboundReturn<'a>>,

    #[serde(rename = "Actions", default, borrow)]
    pub actions: Vec<Action<'a>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct InboundCall<'a> {
    #[serde(rename = "Request", default, borrow)]
    pub request: Cow<'a, str>,
}

#[derive(Debug, Default, Deserialize)]
pub struct InboundReturn<'a> {
    #[serde(rename = "Response", default, borrow)]
    pub response: Cow<'a, str>,
}

/// One outbound action of the session
#[derive(Debug, Default, Deserialize)]
pub struct Action<'a> {
    #[serde(rename = "ServiceName", default, borrow)]
    pub service_name: Cow<'a, str>,

    #[serde(rename = "Request", default, borrow)]
    pub request: Cow<'a, str>,

    #[serde(rename = "Response", default, borrow)]
    pub response: Cow<'a, str>,
}

impl<'a> SessionDoc<'a> {
    pub fn parse(body: &'a [u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }

    pub fn inbound_request(&self) -> &str {
        self.call_from_inbound
            .as_ref()
            .map_or("", |call| call.request.as_ref())
    }

    pub fn inbound_response(&self) -> &str {
        self.return_inbound
            .as_ref()
            .map_or("", |ret| ret.response.as_ref())
    }
}

/// Markers around the session type inside the inbound request.
///
/// The instrumentation layer writes them as literal text, e.g.
/// `\x0bQREQUEST_URI/path\x0c2DOCUMENT_URI` with real backslashes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTypeMarkers {
    pub start: String,
    pub end: String,
}

impl Default for SessionTypeMarkers {
    fn default() -> Self {
        Self {
            start: r"\x0bQREQUEST_URI".to_string(),
            end: r"\x".to_string(),
        }
    }
}

impl SessionTypeMarkers {
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    /// Session type between the markers, without any `?query` suffix
    pub fn extract<'r>(&self, request: &'r str) -> Result<&'r str> {
        let start = request
            .find(self.start.as_str())
            .ok_or(EngineError::DelimiterNotFound("session type start"))?;
        let rest = &request[start + self.start.len()..];
        let end = rest
            .find(self.end.as_str())
            .ok_or(EngineError::DelimiterNotFound("session type end"))?;
        let session_type = &rest[..end];
        Ok(session_type
            .split_once('?')
            .map_or(session_type, |(path, _)| path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SESSION: &str = r#"{
        "CallFromInbound": {"Request": "\\x0bQREQUEST_URI/test?a=1\\x0c2DOCUMENT_URI"},
        "ReturnInbound": {"Response": "product_id=3&combo_type=1"},
        "Actions": [
            {"ActionType": "CallOutbound", "ServiceName": "passport", "Request": "{}", "Response": "{}"},
            {"ActionType": "ReturnInbound"}
        ],
        "Extra": [1, 2, 3]
    }"#;

    #[test]
    fn test_parse_session() {
        let doc = SessionDoc::parse(SESSION.as_bytes()).unwrap();

        assert_eq!(doc.inbound_response(), "product_id=3&combo_type=1");
        assert_eq!(doc.actions.len(), 2);
        assert_eq!(doc.actions[0].service_name, "passport");
        assert!(doc.actions[1].service_name.is_empty());
    }

    #[test]
    fn test_extract_session_type_strips_query() {
        let doc = SessionDoc::parse(SESSION.as_bytes()).unwrap();
        let markers = SessionTypeMarkers::default();

        assert_eq!(markers.extract(doc.inbound_request()).unwrap(), "/test");
    }

    #[test]
    fn test_missing_markers() {
        let markers = SessionTypeMarkers::default();

        assert!(matches!(
            markers.extract("GET /test"),
            Err(EngineError::DelimiterNotFound("session type start"))
        ));
        assert!(matches!(
            markers.extract(r"\x0bQREQUEST_URI/test"),
            Err(EngineError::DelimiterNotFound("session type end"))
        ));
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            SessionDoc::parse(b"{\"CallFromInbound\":"),
            Err(EngineError::Parse(_))
        ));
    }

    #[test]
    fn test_missing_sections_default_empty() {
        let doc = SessionDoc::parse(b"{}").unwrap();
        assert_eq!(doc.inbound_request(), "");
        assert!(doc.actions.is_empty());
    }
}

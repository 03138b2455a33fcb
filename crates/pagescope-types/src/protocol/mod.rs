//! Control-channel wire protocol.
//!
//! Text frames on `/__devtool_metrics` are UTF-8 JSON objects with a
//! required `type` field. Inbound messages carry telemetry and results
//! from the instrumented page; outbound messages carry directives and
//! broadcasts from the proxy. Unknown inbound types are ignored by the
//! router.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Inbound message envelope from the instrumented page.
///
/// `data` stays opaque here; the router parses it per `type` so that a
/// malformed payload of one kind never poisons the whole connection.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClientMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// `{type:"execute", id, code}` — run JavaScript in the page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecuteDirective {
    #[serde(rename = "type")]
    pub message_type: String,
    pub id: String,
    pub code: String,
}

impl ExecuteDirective {
    pub fn new(id: impl Into<String>, code: impl Into<String>) -> Self {
        Self { message_type: "execute".to_string(), id: id.into(), code: code.into() }
    }
}

/// `{type:"activity", payload:{active}}` broadcast.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityBroadcast {
    #[serde(rename = "type")]
    pub message_type: String,
    pub payload: ActivityPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityPayload {
    pub active: bool,
}

impl ActivityBroadcast {
    pub fn new(active: bool) -> Self {
        Self { message_type: "activity".to_string(), payload: ActivityPayload { active } }
    }
}

/// `{type:"toast", payload:{type,title,message,duration?}}` broadcast.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToastBroadcast {
    #[serde(rename = "type")]
    pub message_type: String,
    pub payload: ToastPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToastPayload {
    #[serde(rename = "type")]
    pub toast_type: String,
    pub title: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
}

impl ToastBroadcast {
    pub fn new(
        toast_type: impl Into<String>,
        title: impl Into<String>,
        message: impl Into<String>,
        duration: Option<u64>,
    ) -> Self {
        Self {
            message_type: "toast".to_string(),
            payload: ToastPayload {
                toast_type: toast_type.into(),
                title: title.into(),
                message: message.into(),
                duration,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_parses_with_unknown_type() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"error","data":{"message":"boom"},"url":"http://host/page"}"#,
        )
        .unwrap();
        assert_eq!(msg.message_type, "error");
        assert_eq!(msg.url.as_deref(), Some("http://host/page"));

        // A type the router has never heard of still parses
        let unknown: ClientMessage =
            serde_json::from_str(r#"{"type":"mystery","data":{}}"#).unwrap();
        assert_eq!(unknown.message_type, "mystery");
    }

    #[test]
    fn test_execute_directive_shape() {
        let directive = ExecuteDirective::new("exec-42", "1+1");
        let json = serde_json::to_string(&directive).unwrap();
        assert!(json.contains(r#""type":"execute""#));
        assert!(json.contains(r#""id":"exec-42""#));
        assert!(json.contains(r#""code":"1+1""#));
    }
}

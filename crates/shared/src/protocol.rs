//! Authentication socket protocol.
//!
//! Every frame in both directions is an [`Envelope`]. Requests carry a
//! `requestId` inside `data`; the server echoes it back in the reply so the
//! client can match replies to the call that produced them.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Key under `data` that carries the correlation id.
pub const REQUEST_ID_KEY: &str = "requestId";

/// Envelope type names used by the auth flow
pub const KIND_LOGIN: &str = "login";
pub const KIND_REGISTER: &str = "register";
pub const KIND_LOGOUT: &str = "logout";

/// Returns true for a 2xx acknowledgment.
pub fn is_success_status(code: u16) -> bool {
    (200..300).contains(&code)
}

/// A socket frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Envelope {
    /// Build an outbound request. The payload's fields are merged into `data`
    /// next to the correlation id; a non-object payload is nested under
    /// `payload`.
    pub fn request(kind: impl Into<String>, payload: Value, request_id: &str) -> Self {
        let mut data = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("payload".to_string(), other);
                map
            }
        };
        data.insert(
            REQUEST_ID_KEY.to_string(),
            Value::String(request_id.to_string()),
        );

        Self {
            kind: kind.into(),
            data: Some(Value::Object(data)),
            session_id: None,
            status_code: None,
            message: None,
        }
    }

    /// Build a reply to `request_id` (used by servers and test fixtures).
    pub fn reply(
        kind: impl Into<String>,
        request_id: &str,
        status_code: u16,
        message: impl Into<String>,
        payload: Value,
    ) -> Self {
        let mut envelope = Self::request(kind, payload, request_id);
        envelope.status_code = Some(status_code);
        envelope.message = Some(message.into());
        envelope
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// The correlation id echoed in `data`, if any.
    pub fn request_id(&self) -> Option<&str> {
        self.data.as_ref()?.get(REQUEST_ID_KEY)?.as_str()
    }

    /// A missing status code is not a success.
    pub fn is_success(&self) -> bool {
        self.status_code.is_some_and(is_success_status)
    }
}

// --- Auth payloads ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegisterRequest {
    pub name: String,
    pub email: String,
    pub password: String,
}

/// User record as the auth server sends it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireUser {
    #[serde(deserialize_with = "string_or_number")]
    pub user_id: String,
    pub username: String,
    pub email: String,
}

/// Payload of a successful login acknowledgment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthAck {
    pub session_id: String,
    pub user: WireUser,
}

/// The auth server has used both numeric and string user ids.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number user id, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_merges_payload_and_request_id() {
        let env = Envelope::request(KIND_LOGIN, json!({"email": "a@b.c"}), "login_1");
        assert_eq!(env.kind, "login");
        assert_eq!(env.request_id(), Some("login_1"));
        assert_eq!(env.data.as_ref().unwrap()["email"], "a@b.c");
    }

    #[test]
    fn request_wraps_scalar_payload() {
        let env = Envelope::request("ping", json!(42), "p1");
        let data = env.data.unwrap();
        assert_eq!(data["payload"], 42);
        assert_eq!(data[REQUEST_ID_KEY], "p1");
    }

    #[test]
    fn serialized_envelope_uses_type_and_omits_empty_fields() {
        let env = Envelope::request(KIND_LOGOUT, Value::Null, "l1").with_session("tok");
        let text = serde_json::to_string(&env).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "logout");
        assert_eq!(value["session_id"], "tok");
        assert!(value.get("status_code").is_none());
        assert!(value.get("message").is_none());
    }

    #[test]
    fn success_classification() {
        let mut env = Envelope::reply("login", "x", 200, "ok", Value::Null);
        assert!(env.is_success());
        env.status_code = Some(299);
        assert!(env.is_success());
        env.status_code = Some(300);
        assert!(!env.is_success());
        env.status_code = Some(401);
        assert!(!env.is_success());
        env.status_code = None;
        assert!(!env.is_success());
    }

    #[test]
    fn auth_ack_accepts_numeric_user_id() {
        let ack: AuthAck = serde_json::from_value(json!({
            "session_id": "s-1",
            "user": {"user_id": 7, "username": "ana", "email": "ana@example.com"},
            "requestId": "login_1"
        }))
        .unwrap();
        assert_eq!(ack.user.user_id, "7");
        assert_eq!(ack.session_id, "s-1");
    }
}

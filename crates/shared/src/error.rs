//! Client error taxonomy and error-body parsing.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Errors surfaced by the socket channel, the session store and the REST client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// Transport unreachable, or the channel was torn down while a request
    /// was pending.
    #[error("Network error: {0}")]
    Network(String),
    /// Rejected credential or unauthorized privileged call.
    #[error("Auth error ({status}): {message}")]
    Auth { status: u16, message: String },
    /// Malformed local input, rejected before any network call.
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("Deserialization error: {0}")]
    Deserialize(String),
    #[error("Not authenticated")]
    NotAuthenticated,
}

impl ClientError {
    /// True when the server refused the credential. A restored session must
    /// be dropped when this happens.
    pub fn is_unauthorized(&self) -> bool {
        match self {
            ClientError::Auth { status, .. } | ClientError::Http { status, .. } => {
                *status == 401 || *status == 403
            }
            _ => false,
        }
    }

    pub fn is_network(&self) -> bool {
        matches!(self, ClientError::Network(_))
    }

    /// Map a non-2xx HTTP response to an error, extracting the server's
    /// message where the body carries one.
    pub fn from_http(status: u16, body: String) -> Self {
        if status == 401 || status == 403 {
            let message = try_error_detail(&body).unwrap_or(body);
            return ClientError::Auth { status, message };
        }
        ClientError::Http { status, body }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Attempt to pull a user-facing message out of a JSON error body.
/// Prefers `error`, falls back to `message`.
pub fn try_error_detail(body: &str) -> Option<String> {
    let parsed = serde_json::from_str::<ErrorBody>(body).ok()?;
    [parsed.error, parsed.message]
        .into_iter()
        .flatten()
        .find(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthorized_statuses() {
        assert!(ClientError::Auth { status: 401, message: String::new() }.is_unauthorized());
        assert!(ClientError::Http { status: 403, body: String::new() }.is_unauthorized());
        assert!(!ClientError::Auth { status: 400, message: String::new() }.is_unauthorized());
        assert!(!ClientError::Network("down".into()).is_unauthorized());
    }

    #[test]
    fn from_http_maps_401_to_auth_with_detail() {
        let err = ClientError::from_http(401, r#"{"error":"Invalid token"}"#.to_string());
        assert_eq!(
            err,
            ClientError::Auth { status: 401, message: "Invalid token".to_string() }
        );
    }

    #[test]
    fn from_http_keeps_other_statuses() {
        let err = ClientError::from_http(500, "boom".to_string());
        assert_eq!(err, ClientError::Http { status: 500, body: "boom".to_string() });
    }

    #[test]
    fn error_detail_prefers_error_field() {
        assert_eq!(
            try_error_detail(r#"{"error":"bad","message":"worse"}"#).as_deref(),
            Some("bad")
        );
        assert_eq!(try_error_detail(r#"{"message":"only"}"#).as_deref(), Some("only"));
        assert_eq!(try_error_detail(r#"{"error":"  "}"#), None);
        assert_eq!(try_error_detail("not json"), None);
    }
}

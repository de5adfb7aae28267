//! Shared data models for account linking and bulk messaging.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// --- Identity ---

/// The authenticated user as the client keeps it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: String,
    pub display_name: String,
    pub email: String,
}

impl From<crate::protocol::WireUser> for Identity {
    fn from(user: crate::protocol::WireUser) -> Self {
        Self {
            id: user.user_id,
            display_name: user.username,
            email: user.email,
        }
    }
}

// --- Contacts & batches ---

/// A recipient handed over by the import collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Contact {
    pub phone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Contact {
    pub fn new(phone: impl Into<String>) -> Self {
        Self {
            phone: phone.into(),
            name: None,
            message: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// One message of a batch, with its offset from submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledMessage {
    pub recipient: String,
    pub body: String,
    pub delay_seconds: u64,
    pub sequence_number: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub batch_id: String,
    pub messages: Vec<ScheduledMessage>,
    pub submitted_at: DateTime<Utc>,
}

// --- Handshake ---

/// Account-linking handshake status. Everything but `Pending` is terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HandshakeStatus {
    Pending,
    Authenticated,
    Failed,
    Expired,
}

impl HandshakeStatus {
    /// Parse the server's status string. Unknown values return `None`.
    pub fn from_wire(status: &str) -> Option<Self> {
        match status {
            "pending" => Some(Self::Pending),
            "authenticated" => Some(Self::Authenticated),
            "failed" => Some(Self::Failed),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QrCodeResponse {
    pub session_id: String,
    pub qr_code: String,
    pub status: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionStatusResponse {
    pub session_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkedAccount {
    pub id: String,
    pub phone_number: String,
    #[serde(default)]
    pub name: Option<String>,
    pub session_id: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountsResponse {
    pub accounts: Vec<LinkedAccount>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeleteAccountResponse {
    pub message: String,
    pub id: String,
}

// --- Sending ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BulkMessage {
    pub recipient: String,
    pub message: String,
    pub delay_seconds: u64,
}

impl From<&ScheduledMessage> for BulkMessage {
    fn from(msg: &ScheduledMessage) -> Self {
        Self {
            recipient: msg.recipient.clone(),
            message: msg.body.clone(),
            delay_seconds: msg.delay_seconds,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SendBulkRequest {
    pub session_name: String,
    pub messages: Vec<BulkMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SendBulkResponse {
    pub batch_id: String,
    #[serde(default)]
    pub scheduled: bool,
    #[serde(default)]
    pub total: usize,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SendMessageRequest {
    pub session_id: String,
    pub phone: String,
    pub message: String,
    pub reply: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SendMessageResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// --- Message logs ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageLog {
    pub id: String,
    pub session_id: String,
    pub recipient_phone: String,
    #[serde(default)]
    pub recipient_name: Option<String>,
    pub message: String,
    pub message_type: String,
    pub status: String,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub batch_id: String,
    pub sequence_number: u32,
    pub delay_seconds: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageLogPage {
    pub logs: Vec<MessageLog>,
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
}

/// Filters for the message-log read path. Unset fields are omitted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageLogQuery {
    pub status: Option<String>,
    pub batch_id: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl MessageLogQuery {
    pub fn for_batch(batch_id: impl Into<String>) -> Self {
        Self {
            batch_id: Some(batch_id.into()),
            ..Default::default()
        }
    }

    /// Query pairs in a stable order.
    pub fn pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(status) = &self.status {
            pairs.push(("status", status.clone()));
        }
        if let Some(batch_id) = &self.batch_id {
            pairs.push(("batch_id", batch_id.clone()));
        }
        if let Some(limit) = self.limit {
            pairs.push(("limit", limit.to_string()));
        }
        if let Some(offset) = self.offset {
            pairs.push(("offset", offset.to_string()));
        }
        pairs
    }
}

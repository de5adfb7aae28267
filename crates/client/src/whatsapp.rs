//! REST endpoints for linked messaging accounts and outbound messages.

use async_trait::async_trait;
use connectsuite_shared::{
    AccountsResponse, ClientError, DeleteAccountResponse, MessageLogPage, MessageLogQuery,
    QrCodeResponse, SendBulkRequest, SendBulkResponse, SendMessageRequest, SendMessageResponse,
    SessionStatusResponse,
};

use crate::api_client::ApiClient;
use crate::dispatch::DispatchApi;
use crate::handshake::HandshakeApi;

const BASE: &str = "/whatsapp";

/// Typed wrapper over the `/whatsapp/*` routes.
#[derive(Debug, Clone)]
pub struct WhatsAppApi {
    client: ApiClient,
}

impl WhatsAppApi {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }

    /// Start a QR-code linking handshake.
    pub async fn generate_qr(&self) -> Result<QrCodeResponse, ClientError> {
        self.client.post_empty(&format!("{BASE}/generate-qr")).await
    }

    pub async fn session_status(&self, session_id: &str) -> Result<SessionStatusResponse, ClientError> {
        self.client
            .get_json(
                &format!("{BASE}/session-status/{}", urlencoding::encode(session_id)),
                &[],
            )
            .await
    }

    /// Accounts already linked to the user.
    pub async fn accounts(&self) -> Result<AccountsResponse, ClientError> {
        self.client.get_json(&format!("{BASE}/"), &[]).await
    }

    pub async fn delete_account(&self, account_id: &str) -> Result<DeleteAccountResponse, ClientError> {
        self.client
            .delete_json(&format!("{BASE}/account/{}", urlencoding::encode(account_id)))
            .await
    }

    pub async fn send_message(&self, req: &SendMessageRequest) -> Result<SendMessageResponse, ClientError> {
        self.client
            .post_json(&format!("{BASE}/send-message"), req)
            .await
    }

    pub async fn send_bulk(&self, req: &SendBulkRequest) -> Result<SendBulkResponse, ClientError> {
        self.client.post_json(&format!("{BASE}/send-bulk"), req).await
    }

    /// Read path for delivery progress of scheduled batches.
    pub async fn message_logs(&self, query: &MessageLogQuery) -> Result<MessageLogPage, ClientError> {
        self.client
            .get_json(&format!("{BASE}/message-logs"), &query.pairs())
            .await
    }
}

#[async_trait]
impl HandshakeApi for WhatsAppApi {
    async fn generate_qr(&self) -> Result<QrCodeResponse, ClientError> {
        WhatsAppApi::generate_qr(self).await
    }

    async fn session_status(&self, session_id: &str) -> Result<SessionStatusResponse, ClientError> {
        WhatsAppApi::session_status(self, session_id).await
    }
}

#[async_trait]
impl DispatchApi for WhatsAppApi {
    async fn send_bulk(&self, req: &SendBulkRequest) -> Result<SendBulkResponse, ClientError> {
        WhatsAppApi::send_bulk(self, req).await
    }

    async fn send_message(&self, req: &SendMessageRequest) -> Result<SendMessageResponse, ClientError> {
        WhatsAppApi::send_message(self, req).await
    }
}

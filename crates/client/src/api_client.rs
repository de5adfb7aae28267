//! HTTP API client with bearer-token auth.

use connectsuite_shared::ClientError;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// HTTP client for the REST API.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    /// Create a new API client
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            base_url: String::new(),
            token: None,
        }
    }

    /// Set the base URL for API requests
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Attach the session token sent as `Authorization: Bearer`
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    pub(crate) fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        if self.base_url.is_empty() {
            if path.starts_with('/') {
                path.to_string()
            } else {
                format!("/{path}")
            }
        } else {
            let base = self.base_url.trim_end_matches('/');
            let path = path.trim_start_matches('/');
            format!("{base}/{path}")
        }
    }

    fn authorize(&self, rb: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => rb.bearer_auth(token),
            None => rb,
        }
    }

    /// Send the request and decode a JSON body. Non-2xx responses become
    /// errors; an empty body decodes as `null`.
    async fn execute<TRes: DeserializeOwned>(&self, rb: RequestBuilder) -> Result<TRes, ClientError> {
        let resp = self
            .authorize(rb)
            .send()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;

        let status = resp.status().as_u16();
        let is_success = resp.status().is_success();
        let text = resp
            .text()
            .await
            .map_err(|e| ClientError::Network(format!("failed to read body: {e}")))?;

        if !is_success {
            return Err(ClientError::from_http(status, text));
        }

        let body = if text.trim().is_empty() { "null" } else { text.as_str() };
        serde_json::from_str(body).map_err(|e| ClientError::Deserialize(e.to_string()))
    }

    /// GET with optional query pairs
    pub async fn get_json<TRes: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<TRes, ClientError> {
        let mut rb = self.client.get(self.url(path));
        if !query.is_empty() {
            rb = rb.query(query);
        }
        self.execute(rb).await
    }

    /// POST with JSON body
    pub async fn post_json<TReq: Serialize, TRes: DeserializeOwned>(
        &self,
        path: &str,
        body: &TReq,
    ) -> Result<TRes, ClientError> {
        self.execute(self.client.post(self.url(path)).json(body)).await
    }

    /// POST without a body
    pub async fn post_empty<TRes: DeserializeOwned>(&self, path: &str) -> Result<TRes, ClientError> {
        self.execute(self.client.post(self.url(path))).await
    }

    pub async fn delete_json<TRes: DeserializeOwned>(&self, path: &str) -> Result<TRes, ClientError> {
        self.execute(self.client.delete(self.url(path))).await
    }
}

impl Default for ApiClient {
    fn default() -> Self {
        Self::new()
    }
}

//! Authentication session management with file persistence.

use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use connectsuite_shared::{
    AuthAck, ClientError, Identity, LoginRequest, RegisterRequest, KIND_LOGIN, KIND_LOGOUT,
    KIND_REGISTER,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api_client::ApiClient;
use crate::storage::Storage;
use crate::whatsapp::WhatsAppApi;
use crate::ws::{RequestOptions, Requester};

const STORAGE_KEY: &str = "connectsuite_session";

/// Upper bound on the logout notice; the local clear never waits longer.
pub const LOGOUT_TIMEOUT: Duration = Duration::from_secs(5);

/// Stored session data
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub token: String,
    pub identity: Identity,
}

/// Single source of truth for who is signed in.
///
/// The store exclusively owns the [`Session`]; everything else reads a
/// clone. A session restored from disk is trusted until a privileged call
/// comes back unauthorized.
pub struct SessionStore {
    requester: Arc<dyn Requester>,
    storage: Option<Storage>,
    api_base_url: String,
    session: RwLock<Option<Session>>,
}

impl SessionStore {
    /// Create the store, adopting a previously persisted session if any.
    pub fn new(requester: Arc<dyn Requester>, storage: Option<Storage>) -> Self {
        let restored = storage
            .as_ref()
            .and_then(|s| s.load::<Session>(STORAGE_KEY));
        if let Some(sess) = &restored {
            crate::log_info!("Restored session for {}", sess.identity.email);
        }

        Self {
            requester,
            storage,
            api_base_url: String::new(),
            session: RwLock::new(restored),
        }
    }

    pub fn with_api_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.api_base_url = base_url.into();
        self
    }

    pub fn session(&self) -> Option<Session> {
        self.session
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Check if user is authenticated
    pub fn is_authenticated(&self) -> bool {
        self.session().is_some()
    }

    pub fn token(&self) -> Option<String> {
        self.session().map(|s| s.token)
    }

    pub fn identity(&self) -> Option<Identity> {
        self.session().map(|s| s.identity)
    }

    /// Exchange credentials for a session. On failure the current state is
    /// left as it was.
    pub async fn login(&self, credentials: &LoginRequest) -> Result<Session, ClientError> {
        let payload = to_payload(credentials)?;
        let data = self
            .requester
            .request_with(KIND_LOGIN, payload, RequestOptions::default())
            .await?;
        let ack: AuthAck =
            serde_json::from_value(data).map_err(|e| ClientError::Deserialize(e.to_string()))?;

        let session = Session {
            token: ack.session_id,
            identity: ack.user.into(),
        };
        self.set(Some(session.clone()));
        crate::log_info!("Logged in as {}", session.identity.email);
        Ok(session)
    }

    /// Create an account. Registration does not sign the user in.
    pub async fn register(&self, profile: &RegisterRequest) -> Result<(), ClientError> {
        let payload = to_payload(profile)?;
        self.requester
            .request_with(KIND_REGISTER, payload, RequestOptions::default())
            .await?;
        crate::log_info!("Registered {}", profile.email);
        Ok(())
    }

    /// Tell the server the session is over, then clear it locally no matter
    /// what the server said.
    pub async fn logout(&self) {
        if let Some(token) = self.token() {
            let options = RequestOptions::default()
                .with_session(token)
                .with_timeout(LOGOUT_TIMEOUT);
            match self
                .requester
                .request_with(KIND_LOGOUT, Value::Null, options)
                .await
            {
                Ok(_) => crate::log_info!("Server acknowledged logout"),
                Err(e) => crate::log_warn!("Logout request failed, clearing session anyway: {}", e),
            }
        }
        self.invalidate();
    }

    /// Drop the session from memory and disk.
    pub fn invalidate(&self) {
        self.set(None);
    }

    /// Clear the session if `error` says the credential is no longer accepted.
    /// Returns true when the session was cleared.
    pub fn observe_error(&self, error: &ClientError) -> bool {
        if error.is_unauthorized() && self.is_authenticated() {
            crate::log_warn!("Credential rejected ({}), clearing session", error);
            self.invalidate();
            return true;
        }
        false
    }

    /// Run a privileged REST operation with the current credential.
    ///
    /// Fails fast without a session; clears the session when the operation
    /// is rejected as unauthorized.
    pub async fn authorized<T, F, Fut>(&self, op: F) -> Result<T, ClientError>
    where
        F: FnOnce(ApiClient) -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        if !self.is_authenticated() {
            return Err(ClientError::NotAuthenticated);
        }
        let result = op(self.api()).await;
        if let Err(e) = &result {
            self.observe_error(e);
        }
        result
    }

    /// Create an API client configured for the current session
    pub fn api(&self) -> ApiClient {
        ApiClient::new()
            .with_base_url(self.api_base_url.clone())
            .with_token(self.token())
    }

    /// Messaging API bound to the current session.
    pub fn whatsapp(&self) -> Result<WhatsAppApi, ClientError> {
        if !self.is_authenticated() {
            return Err(ClientError::NotAuthenticated);
        }
        Ok(WhatsAppApi::new(self.api()))
    }

    fn set(&self, session: Option<Session>) {
        if let Some(storage) = &self.storage {
            match &session {
                Some(sess) => {
                    if !storage.save(STORAGE_KEY, sess) {
                        crate::log_warn!("Failed to persist session");
                    }
                }
                None => {
                    if !storage.remove(STORAGE_KEY) {
                        crate::log_warn!(
                            "Stored session in {} could not be removed",
                            storage.dir().display()
                        );
                    }
                }
            }
        }
        *self
            .session
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = session;
    }
}

fn to_payload<T: Serialize>(value: &T) -> Result<Value, ClientError> {
    serde_json::to_value(value).map_err(|e| ClientError::Validation(e.to_string()))
}

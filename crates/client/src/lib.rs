//! ConnectSuite client core
//!
//! Socket-based sign-in, the QR-code account-linking handshake and bulk
//! message dispatch for the ConnectSuite messaging service.

pub mod logging;

pub mod api_client;
pub mod auth_session;
pub mod config;
pub mod dispatch;
pub mod handshake;
pub mod storage;
pub mod whatsapp;
pub mod ws;

pub use api_client::ApiClient;
pub use auth_session::{Session, SessionStore};
pub use config::ClientConfig;
pub use dispatch::{
    BulkDispatchScheduler, DelayRange, DispatchApi, DispatchMode, DispatchOutcome, DispatchRequest,
    DispatchSummary,
};
pub use handshake::{AuthPoller, HandshakeApi, HandshakeOutcome, HandshakeSubscription};
pub use storage::Storage;
pub use whatsapp::WhatsAppApi;
pub use ws::{ConnectionChannel, ConnectionState};

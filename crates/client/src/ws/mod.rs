//! Socket module for the auth server connection.
//!
//! This module provides:
//! - One shared, lazily (re)opened socket per [`ConnectionChannel`]
//! - Request/reply correlation over that socket
//! - Routing of unsolicited envelopes to handlers keyed by envelope type
//!
//! # Architecture
//!
//! ```text
//!   caller A        caller B        caller C
//!      │ request()     │ request()     │ on("notice", ..)
//!      ▼               ▼               ▼
//! ┌─────────────────────────────────────────────┐
//! │               ConnectionChannel             │
//! │  RequestCorrelator: requestId → waiter      │
//! │  handlers:          type → callback         │
//! └─────────────────────────────────────────────┘
//!      │ write task                  ▲ read task
//!      ▼                             │
//!              ┌──────────────┐
//!              │ auth socket  │
//!              └──────────────┘
//! ```
//!
//! Replies can arrive in any order; only the `requestId` echoed in `data`
//! decides which caller a reply belongs to.
//!
//! # Usage
//!
//! ```rust,ignore
//! let channel = ConnectionChannel::new("ws://localhost:8080/ws");
//! channel.on("notice", |envelope| println!("{:?}", envelope.message));
//! let data = channel.request("login", json!({"email": e, "password": p})).await?;
//! ```

mod connection;
mod correlator;

pub use connection::{
    ConnectionChannel, ConnectionState, ReconnectConfig, RequestOptions, Requester,
    UnsolicitedHandler,
};
pub use correlator::{Reply, RequestCorrelator};

//! Realtime Connection
//!
//! Client side of the realtime link: one managed WebSocket connection with
//! heartbeat, bounded exponential-backoff reconnection and an id-keyed
//! listener registry.
//!
//! ## Architecture
//!
//! - **ConnectionManager**: lifecycle, send, listener dispatch
//! - **Connector**: opens transports; [`WsConnector`] in production
//! - **ConnectionConfig**: endpoint, intervals, limits
//!
//! ## Example
//!
//! ```rust,no_run
//! use fieldsync::connection::{ConnectionConfig, ConnectionManager, WsConnector};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), fieldsync::connection::ConnectionError> {
//! let config = ConnectionConfig::new("wss://ops.example.com/realtime").with_token("session-token");
//! let manager = ConnectionManager::new(config, Arc::new(WsConnector));
//!
//! manager.add_listener("log", |msg| {
//!     println!("{} {}", msg.kind, msg.data);
//!     Ok(())
//! }, None);
//!
//! manager.connect().await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod manager;
mod transport;

pub use config::{ConnectionConfig, HEARTBEAT_TIMEOUT_CLOSURE, NORMAL_CLOSURE};
pub use error::{ConnectionError, ConnectionResult};
pub use manager::{ConnectionManager, ListenerCallback};
pub use transport::{Connector, InboundFrame, OutboundFrame, TransportLink, WsConnector};

#[cfg(test)]
pub(crate) use transport::mock;

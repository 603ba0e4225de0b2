//! # fieldsync
//!
//! Real-time event distribution for a field-operations platform: keeps
//! connected clients informed of task completions, worker status, building
//! updates and inventory alerts.
//!
//! ## Features
//!
//! - **Resilient connection**: heartbeat, bounded exponential-backoff reconnect
//! - **Permissioned routing**: role table, building scope, ordered single-worker dispatch
//! - **Change detection**: snapshot diffing so unchanged state is never re-broadcast
//! - **Local events**: in-process pub/sub for dashboards and notifiers
//!
//! ## Modules
//!
//! - [`connection`]: connection lifecycle and WebSocket transport
//! - [`router`]: permission checks and prioritized handlers
//! - [`broadcast`]: change-detection broadcaster and state sources
//! - [`events`]: local event bus
//! - [`service`]: composition point wiring all of the above
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fieldsync::broadcast::MemorySource;
//! use fieldsync::connection::{ConnectionConfig, WsConnector};
//! use fieldsync::events::EventBus;
//! use fieldsync::router::{RecipientContext, UserRole};
//! use fieldsync::service::{RealtimeService, ServiceOptions};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = ServiceOptions::new(ConnectionConfig::new("wss://ops.example.com/realtime"))
//!         .with_context(RecipientContext::new("worker-17", UserRole::Worker));
//!
//!     let service = RealtimeService::new(
//!         options,
//!         Arc::new(WsConnector),
//!         Arc::new(MemorySource::default()),
//!         Arc::new(EventBus::new()),
//!     )?;
//!
//!     service.on("task_completed", |event| {
//!         println!("completed: {}", event.data);
//!         Ok(())
//!     });
//!
//!     service.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     service.destroy();
//!     Ok(())
//! }
//! ```

pub mod broadcast;
pub mod config;
pub mod connection;
pub mod events;
pub mod logging;
pub mod protocol;
pub mod router;
pub mod service;

// Re-export top-level types for convenience
pub use protocol::{Category, ConnectionState, EventType, Message};

pub use events::{EventBus, LocalEvent};

pub use connection::{ConnectionConfig, ConnectionError, ConnectionManager, WsConnector};

pub use router::{MessageRouter, RecipientContext, RouterError, UserRole};

pub use broadcast::{
    BroadcastError, ChangeBroadcaster, JsonFileSource, MemorySource, StateSource,
};

pub use service::{RealtimeService, ServiceError, ServiceOptions};

pub use config::{Config, ConfigError, LoggingConfig};

//! Realtime Protocol
//!
//! Types shared by every component: the wire [`Message`], the event
//! taxonomy, and the observable [`ConnectionState`].
//!
//! ## Wire shape
//!
//! ```json
//! {"id": "3f6c...", "type": "worker_status", "data": {"workerId": "w-7"}, "timestamp": 1699000000000}
//! ```

mod messages;
mod state;

pub use messages::{Category, EventType, Message, UnknownEventType, PING, PONG};
pub use state::ConnectionState;

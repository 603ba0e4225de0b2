//! Message Router
//!
//! Permission-filtered, priority-ordered dispatch of inbound messages.
//!
//! ## Architecture
//!
//! - **MessageRouter**: single-worker queue; owns routes and the recipient context
//! - **Route**: `(type, handler, priority, retryable)` registration
//! - **RecipientContext**: user id, role, optional building scope and grants
//!
//! A handler's failure never prevents lower-priority handlers from running.
//! Retryable handlers get exactly one more attempt after a fixed delay.

mod context;
mod dispatcher;
mod error;
mod route;

pub use context::{
    allowed_roles, check, Denial, RecipientContext, UserRole, EVENT_PERMISSION_PREFIX,
};
pub use dispatcher::{MessageRouter, RouterConfig, RouterStats};
pub use error::{RouterError, RouterResult};
pub use route::{Route, RouteHandler};

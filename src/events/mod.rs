//! Local Events
//!
//! In-process publish/subscribe that decouples producers (the change
//! broadcaster, the message router) from consumers such as dashboards and
//! notification systems.

mod bus;

pub use bus::{CallbackId, EventBus, EventCallback, EventOrigin, LocalEvent, ANY_EVENT};

use std::panic::{catch_unwind, AssertUnwindSafe};

/// Run a consumer-supplied callback, turning a panic into an error
///
/// Every dispatch loop in the crate goes through this so one misbehaving
/// consumer cannot take down delivery to the others.
pub(crate) fn isolate<F>(callback: F) -> anyhow::Result<()>
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match catch_unwind(AssertUnwindSafe(callback)) {
        Ok(result) => result,
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(anyhow::anyhow!("callback panicked: {}", reason))
        }
    }
}

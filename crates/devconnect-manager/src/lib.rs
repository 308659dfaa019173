/*!
 * Device Connect Manager
 *
 * This crate hosts Device Connect plugins under one domain: composite
 * service addressing, request routing to plugins and client event
 * sessions.
 */

#![warn(missing_docs)]

// Re-export core types
pub use devconnect_core::prelude;

pub mod address;
pub mod error;
pub mod manager;
pub mod session;

// Re-export main types for convenience
pub use address::ServiceAddress;
pub use error::{Error, Result};
pub use manager::Manager;
pub use session::{Delivery, EventSession, SessionId, SessionTable};

/// Device Connect manager crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the manager
pub fn init() -> Result<()> {
    tracing::info!("Device Connect Manager {} initialized", VERSION);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}

/*!
 * Device Connect Core
 *
 * This crate provides the shared vocabulary of the Device Connect system:
 * request/response envelopes, events, configuration, logging and async
 * helpers used by plugins and the manager.
 */

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod message;
pub mod prelude;
pub mod types;
pub mod utils;

/// Re-export of dependencies that are part of the public API
pub mod deps {
    pub use anyhow;
    pub use chrono;
    pub use futures;
    pub use serde;
    pub use serde_json;
    pub use tokio;
    pub use tracing;
    pub use uuid;
}

/// Device Connect core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library initialization
pub fn init() -> Result<(), error::Error> {
    logging::init()?;
    tracing::info!("Device Connect Core {} initialized", VERSION);
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

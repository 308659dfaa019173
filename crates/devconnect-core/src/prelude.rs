/*!
 * Prelude module for Device Connect core.
 *
 * Re-exports the types most code touching requests, events and
 * configuration needs.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export core types
pub use crate::types::{Id, Metadata, Params, ServiceId, Value};

// Re-export message types
pub use crate::message::{Action, ErrorCode, RecoveryHint, Request, Response, ResultCode};

// Re-export event types
pub use crate::event::{Capability, Detection, Event, EventBus, EventPayload, SharedEventBus};

// Re-export config types
pub use crate::config::{Config, ConfigBuilder, SharedConfig};

// Re-export utility functions
pub use crate::utils::{spawn_and_log, with_retry, with_timeout};

// Re-export logging macros
pub use tracing::{debug, error, info, trace, warn};

// Re-export core initialization
pub use crate::init;

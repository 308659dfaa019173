/*!
 * Error types for the Device Connect manager crate.
 */
use thiserror::Error;

use devconnect_core::message::{ErrorCode, Response};
use devconnect_devices::DeviceError;

/// Error type for manager operations
#[derive(Error, Debug)]
pub enum Error {
    /// No service id in the request
    #[error("Service id is empty")]
    EmptyServiceId,

    /// The service id is not a composite id of this manager
    #[error("Invalid service id: {0}")]
    InvalidServiceId(String),

    /// No plugin with the addressed id
    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    /// A plugin with the same id is already registered
    #[error("Plugin already registered: {0}")]
    PluginExists(String),

    /// No event session matches an unregistration
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Device error
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] devconnect_core::error::Error),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for manager operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new invalid service id error
    pub fn invalid_service_id<S: AsRef<str>>(msg: S) -> Self {
        Error::InvalidServiceId(msg.as_ref().to_string())
    }

    /// Create a new plugin not found error
    pub fn plugin_not_found<S: AsRef<str>>(id: S) -> Self {
        Error::PluginNotFound(id.as_ref().to_string())
    }

    /// Create a new other error
    pub fn other<S: AsRef<str>>(msg: S) -> Self {
        Error::Other(msg.as_ref().to_string())
    }

    /// Numeric code reported to clients
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Error::EmptyServiceId => ErrorCode::EmptyServiceId,
            Error::InvalidServiceId(_) | Error::PluginNotFound(_) => ErrorCode::NotFoundService,
            Error::SessionNotFound(_) => ErrorCode::InvalidRequestParameter,
            Error::Device(e) => e.error_code(),
            Error::PluginExists(_) | Error::Core(_) | Error::Other(_) => ErrorCode::Unknown,
        }
    }

    /// Convert into an error response
    pub fn to_response(&self) -> Response {
        match self {
            Error::Device(e) => e.to_response(),
            other => Response::error(other.error_code(), other.to_string()),
        }
    }
}

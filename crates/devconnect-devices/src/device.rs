/*!
 * Device abstractions: errors, connection state, descriptive info and the
 * driver seam wrapping a vendor handle.
 */
use std::fmt::Debug;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use devconnect_core::{
    error::Error as CoreError,
    event::{Capability, EventPayload},
    message::{ErrorCode, RecoveryHint, Response},
    types::{params_from_json, Metadata, Params, ServiceId, Value},
};

use crate::transport::FramePayload;

/// Error type for device operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    /// No service id in the request
    #[error("Service id is empty")]
    EmptyServiceId,

    /// No device with the requested id
    #[error("Service not found: {0}")]
    NotFoundService(String),

    /// A parameter is missing or out of range
    #[error("Invalid request parameter: {0}")]
    InvalidRequestParameter(String),

    /// The profile is not provided
    #[error("Profile not supported: {0}")]
    NotSupportProfile(String),

    /// The action is not supported for the attribute
    #[error("Action not supported: {0}")]
    NotSupportAction(String),

    /// The attribute is not provided by the profile
    #[error("Attribute not supported: {0}")]
    NotSupportAttribute(String),

    /// The device is registered but not online
    #[error("Device not connected: {0}")]
    NotConnected(String),

    /// The transport failed or the device refused the command
    #[error("Connection error: {0}")]
    Connection(String),

    /// No reply within the response window
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The device was removed while the request was in flight
    #[error("Device removed: {0}")]
    Removed(String),

    /// Credentials were rejected by the vendor service
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// The device cannot serve the request in its current state
    #[error("Illegal device state: {0}")]
    IllegalDeviceState(String),

    /// Anything else
    #[error("Unknown error: {0}")]
    Unknown(String),
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

/// Broad error classes surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Service id empty or unknown, never retried
    NotFoundService,
    /// Bad parameters, rejected before touching the device
    InvalidRequestParameter,
    /// Routing miss on profile, interface, attribute or action
    NotSupported,
    /// Transport failure, timeout or device offline
    Connection,
    /// Vendor credentials rejected
    Authentication,
    /// Anything else
    Unknown,
}

impl DeviceError {
    /// Create a not-found error
    pub fn not_found<S: AsRef<str>>(id: S) -> Self {
        DeviceError::NotFoundService(id.as_ref().to_string())
    }

    /// Create an invalid parameter error
    pub fn invalid_parameter<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::InvalidRequestParameter(msg.as_ref().to_string())
    }

    /// Create a connection error
    pub fn connection<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::Connection(msg.as_ref().to_string())
    }

    /// Create an illegal state error
    pub fn illegal_state<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::IllegalDeviceState(msg.as_ref().to_string())
    }

    /// Create an unknown error
    pub fn unknown<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::Unknown(msg.as_ref().to_string())
    }

    /// The broad class of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeviceError::EmptyServiceId
            | DeviceError::NotFoundService(_)
            | DeviceError::Removed(_) => ErrorKind::NotFoundService,
            DeviceError::InvalidRequestParameter(_) => ErrorKind::InvalidRequestParameter,
            DeviceError::NotSupportProfile(_)
            | DeviceError::NotSupportAction(_)
            | DeviceError::NotSupportAttribute(_) => ErrorKind::NotSupported,
            DeviceError::NotConnected(_)
            | DeviceError::Connection(_)
            | DeviceError::Timeout(_)
            | DeviceError::IllegalDeviceState(_) => ErrorKind::Connection,
            DeviceError::Authentication(_) => ErrorKind::Authentication,
            DeviceError::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// The numeric code reported to clients
    pub fn error_code(&self) -> ErrorCode {
        match self {
            DeviceError::EmptyServiceId => ErrorCode::EmptyServiceId,
            DeviceError::NotFoundService(_) | DeviceError::Removed(_) => ErrorCode::NotFoundService,
            DeviceError::InvalidRequestParameter(_) => ErrorCode::InvalidRequestParameter,
            DeviceError::NotSupportProfile(_) => ErrorCode::NotSupportProfile,
            DeviceError::NotSupportAction(_) => ErrorCode::NotSupportAction,
            DeviceError::NotSupportAttribute(_) => ErrorCode::NotSupportAttribute,
            DeviceError::NotConnected(_)
            | DeviceError::Connection(_)
            | DeviceError::IllegalDeviceState(_) => ErrorCode::IllegalDeviceState,
            DeviceError::Timeout(_) => ErrorCode::Timeout,
            DeviceError::Authentication(_) => ErrorCode::Authorization,
            DeviceError::Unknown(_) => ErrorCode::Unknown,
        }
    }

    /// Suggested recovery for a user interface
    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            DeviceError::Timeout(_) | DeviceError::Connection(_) => RecoveryHint::Retry,
            DeviceError::NotConnected(_) | DeviceError::IllegalDeviceState(_) => {
                RecoveryHint::CheckConnectivity
            }
            DeviceError::Authentication(_) => RecoveryHint::ReenterCredentials,
            _ => RecoveryHint::None,
        }
    }

    /// Build the error response for this error
    pub fn to_response(&self) -> Response {
        Response::error(self.error_code(), self.to_string()).with_recovery(self.recovery_hint())
    }
}

impl From<CoreError> for DeviceError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Timeout(msg) => DeviceError::Timeout(msg),
            CoreError::InvalidArgument(msg) => DeviceError::InvalidRequestParameter(msg),
            other => DeviceError::Unknown(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for DeviceError {
    fn from(err: serde_json::Error) -> Self {
        DeviceError::Unknown(format!("malformed payload: {}", err))
    }
}

/// Connectivity of a registered device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Registered but not reachable
    #[default]
    Offline,
    /// A connect is in progress
    Connecting,
    /// Connected and able to take commands
    Online,
}

/// Descriptive information about a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// The device ID
    pub id: ServiceId,
    /// The device name
    pub name: String,
    /// The device type, e.g. `hue-light`
    pub device_type: String,
    /// Profiles this device supports
    pub profiles: Vec<String>,
    /// Additional device metadata
    #[serde(default)]
    pub metadata: Metadata,
}

impl DeviceInfo {
    /// Create device info without profiles
    pub fn new<I: Into<ServiceId>, N: AsRef<str>, T: AsRef<str>>(id: I, name: N, device_type: T) -> Self {
        Self {
            id: id.into(),
            name: name.as_ref().to_string(),
            device_type: device_type.as_ref().to_string(),
            profiles: Vec::new(),
            metadata: Metadata::new(),
        }
    }

    /// Add a supported profile
    pub fn with_profile<S: AsRef<str>>(mut self, profile: S) -> Self {
        self.profiles.push(profile.as_ref().to_string());
        self
    }

    /// Add a metadata entry
    pub fn with_metadata<K: AsRef<str>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.metadata.insert(key.as_ref().to_string(), value.into());
        self
    }

    /// Whether the device supports a profile, ignoring case
    pub fn supports_profile(&self, profile: &str) -> bool {
        self.profiles.iter().any(|p| p.eq_ignore_ascii_case(profile))
    }
}

/// The vendor handle behind one registered device
///
/// A driver is owned by its registry entry and only ever reached through
/// the entry's lock, so methods take `&mut self`. Operation names come from
/// the profile tables, e.g. `light.on` or `drive.move`.
#[async_trait]
pub trait DeviceDriver: Send + Sync + Debug {
    /// Short driver name for logging
    fn driver_name(&self) -> &'static str;

    /// Open the vendor connection
    async fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    /// Close the vendor connection
    async fn disconnect(&mut self) -> Result<()> {
        Ok(())
    }

    /// Apply a fire-and-forget mutation
    async fn apply(&mut self, operation: &str, _params: &Params) -> Result<()> {
        Err(DeviceError::NotSupportAction(operation.to_string()))
    }

    /// Read state held by the handle
    async fn query(&mut self, operation: &str, _params: &Params) -> Result<Params> {
        Err(DeviceError::NotSupportAction(operation.to_string()))
    }

    /// Encode a command whose answer arrives later over the transport
    fn encode(&mut self, operation: &str, _params: &Params) -> Result<FramePayload> {
        Err(DeviceError::NotSupportAction(operation.to_string()))
    }

    /// Decode the reply to an encoded command
    fn decode(&mut self, _operation: &str, body: &FramePayload) -> Result<Params> {
        match body {
            FramePayload::Json(json) => Ok(params_from_json(json.clone())),
            FramePayload::Empty => Ok(Params::new()),
            FramePayload::Binary(_) => Err(DeviceError::unknown("binary reply without a decoder")),
        }
    }

    /// Prepare the device to produce events for a capability
    async fn start_stream(&mut self, _capability: &Capability, _params: &Params) -> Result<()> {
        Ok(())
    }

    /// Stop producing events for a capability
    async fn stop_stream(&mut self, _capability: &Capability) -> Result<()> {
        Ok(())
    }

    /// Command sent on every polling tick, for devices that must be polled
    fn poll_command(&self, _capability: &Capability, _params: &Params) -> Option<FramePayload> {
        None
    }

    /// Turn the answer to a polling command into an event, if it holds one
    fn decode_event(&mut self, _capability: &Capability, _body: &FramePayload) -> Result<Option<EventPayload>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert_eq!(DeviceError::not_found("x").kind(), ErrorKind::NotFoundService);
        assert_eq!(DeviceError::Removed("x".into()).kind(), ErrorKind::NotFoundService);
        assert_eq!(DeviceError::Timeout("x".into()).kind(), ErrorKind::Connection);
        assert_eq!(DeviceError::Timeout("x".into()).error_code(), ErrorCode::Timeout);
        assert_eq!(DeviceError::NotConnected("x".into()).error_code(), ErrorCode::IllegalDeviceState);
        assert_eq!(DeviceError::EmptyServiceId.error_code(), ErrorCode::EmptyServiceId);
        assert_eq!(
            DeviceError::Authentication("token".into()).recovery_hint(),
            RecoveryHint::ReenterCredentials
        );
        assert_eq!(DeviceError::invalid_parameter("speed").recovery_hint(), RecoveryHint::None);
    }

    #[test]
    fn test_error_response() {
        let response = DeviceError::not_found("hue:9").to_response();
        assert!(!response.is_ok());
        assert_eq!(response.code(), Some(ErrorCode::NotFoundService));
        assert_eq!(response.error_message.as_deref(), Some("Service not found: hue:9"));
        assert_eq!(response.recovery, None);

        let response = DeviceError::Timeout("no reply".into()).to_response();
        assert_eq!(response.code(), Some(ErrorCode::Timeout));
        assert_eq!(response.recovery, Some(RecoveryHint::Retry));

        let response = DeviceError::NotConnected("bb8".into()).to_response();
        assert_eq!(response.recovery, Some(RecoveryHint::CheckConnectivity));
    }

    #[test]
    fn test_core_error_conversion() {
        let err: DeviceError = CoreError::timeout("slow").into();
        assert_eq!(err, DeviceError::Timeout("slow".into()));
        let err: DeviceError = CoreError::other("boom").into();
        assert_eq!(err.kind(), ErrorKind::Unknown);
    }

    #[test]
    fn test_device_info() {
        let info = DeviceInfo::new("192.168.0.2:1", "Desk", "hue-light")
            .with_profile("light")
            .with_metadata("bridge", "192.168.0.2");
        assert!(info.supports_profile("Light"));
        assert!(!info.supports_profile("driveController"));
        assert_eq!(info.metadata.get("bridge").and_then(Value::as_str), Some("192.168.0.2"));

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["deviceType"], "hue-light");
    }
}

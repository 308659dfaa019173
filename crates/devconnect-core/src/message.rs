/*!
 * Request and response envelopes.
 *
 * A request addresses one service and one operation through the
 * `profile / interface / attribute` path plus an HTTP-like action. The
 * response carries an explicit result code and, on failure, a numeric error
 * code and a human readable message.
 */
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;
use crate::types::{Params, ServiceId, Value};

/// Request action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    /// Read state or request a one-shot value
    Get,
    /// Create or trigger
    Post,
    /// Update state or register for events
    Put,
    /// Remove state or unregister from events
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Get => "GET",
            Action::Post => "POST",
            Action::Put => "PUT",
            Action::Delete => "DELETE",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Action::Get),
            "POST" => Ok(Action::Post),
            "PUT" => Ok(Action::Put),
            "DELETE" => Ok(Action::Delete),
            other => Err(Error::invalid_argument(format!("unknown action '{}'", other))),
        }
    }
}

/// A generic client request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    /// Target service
    pub service_id: ServiceId,
    /// Profile name, e.g. `light`
    pub profile: String,
    /// Optional interface name, e.g. `quaternion`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    /// Attribute name, absent for profile-level operations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
    /// Action
    pub action: Action,
    /// Parameters
    #[serde(default)]
    pub params: Params,
}

impl Request {
    /// Create a profile-level request
    pub fn new<S: Into<ServiceId>, P: AsRef<str>>(action: Action, service_id: S, profile: P) -> Self {
        Self {
            service_id: service_id.into(),
            profile: profile.as_ref().to_string(),
            interface: None,
            attribute: None,
            action,
            params: Params::new(),
        }
    }

    /// Set the interface
    pub fn with_interface<S: AsRef<str>>(mut self, interface: S) -> Self {
        self.interface = Some(interface.as_ref().to_string());
        self
    }

    /// Set the attribute
    pub fn with_attribute<S: AsRef<str>>(mut self, attribute: S) -> Self {
        self.attribute = Some(attribute.as_ref().to_string());
        self
    }

    /// Add a parameter
    pub fn with_param<K: AsRef<str>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.params.insert(key.as_ref().to_string(), value.into());
        self
    }

    /// Replace the target service, keeping everything else
    pub fn with_service_id<S: Into<ServiceId>>(mut self, service_id: S) -> Self {
        self.service_id = service_id.into();
        self
    }

    /// Look up a parameter
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// The request path, `/profile[/interface][/attribute]`
    pub fn path(&self) -> String {
        let mut path = format!("/{}", self.profile);
        if let Some(interface) = &self.interface {
            path.push('/');
            path.push_str(interface);
        }
        if let Some(attribute) = &self.attribute {
            path.push('/');
            path.push_str(attribute);
        }
        path
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.action, self.path(), self.service_id)
    }
}

/// Numeric error codes reported to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// Unclassified failure
    Unknown = 1,
    /// The profile is not provided by the service
    NotSupportProfile = 2,
    /// The action is not supported for the attribute
    NotSupportAction = 3,
    /// The attribute is not provided by the profile
    NotSupportAttribute = 4,
    /// No service id in the request
    EmptyServiceId = 5,
    /// No service with the requested id
    NotFoundService = 6,
    /// The device did not answer in time
    Timeout = 7,
    /// Unknown attribute in an event registration
    UnknownAttribute = 8,
    /// A parameter is missing or out of range
    InvalidRequestParameter = 10,
    /// Authorization with the vendor service failed
    Authorization = 11,
    /// The device is not in a state that allows the operation
    IllegalDeviceState = 16,
}

impl ErrorCode {
    /// The wire value
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Map a wire value back to a code
    pub fn from_code(code: i32) -> Option<Self> {
        let code = match code {
            1 => ErrorCode::Unknown,
            2 => ErrorCode::NotSupportProfile,
            3 => ErrorCode::NotSupportAction,
            4 => ErrorCode::NotSupportAttribute,
            5 => ErrorCode::EmptyServiceId,
            6 => ErrorCode::NotFoundService,
            7 => ErrorCode::Timeout,
            8 => ErrorCode::UnknownAttribute,
            10 => ErrorCode::InvalidRequestParameter,
            11 => ErrorCode::Authorization,
            16 => ErrorCode::IllegalDeviceState,
            _ => return None,
        };
        Some(code)
    }

    /// Default human readable message
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::Unknown => "Unknown error.",
            ErrorCode::NotSupportProfile => "Profile is not supported.",
            ErrorCode::NotSupportAction => "Action is not supported.",
            ErrorCode::NotSupportAttribute => "Attribute is not supported.",
            ErrorCode::EmptyServiceId => "Service ID is empty.",
            ErrorCode::NotFoundService => "Service is not found.",
            ErrorCode::Timeout => "Response timeout.",
            ErrorCode::UnknownAttribute => "Unknown attribute.",
            ErrorCode::InvalidRequestParameter => "Invalid request parameter.",
            ErrorCode::Authorization => "Authorization failed.",
            ErrorCode::IllegalDeviceState => "Illegal device state.",
        }
    }
}

/// Outcome of a request, `0` for OK and `1` for ERROR on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    /// Success
    Ok,
    /// Failure
    Error,
}

impl Serialize for ResultCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(match self {
            ResultCode::Ok => 0,
            ResultCode::Error => 1,
        })
    }
}

impl<'de> Deserialize<'de> for ResultCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match i32::deserialize(deserializer)? {
            0 => Ok(ResultCode::Ok),
            1 => Ok(ResultCode::Error),
            other => Err(serde::de::Error::custom(format!("invalid result code {}", other))),
        }
    }
}

/// What a user interface should offer after an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecoveryHint {
    /// Nothing useful to offer
    None,
    /// Trying again may succeed
    Retry,
    /// Check that the device is powered and reachable
    CheckConnectivity,
    /// Re-enter credentials
    ReenterCredentials,
}

/// Response to a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    /// Result code
    pub result: ResultCode,
    /// Numeric error code when `result` is an error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i32>,
    /// Error message when `result` is an error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Suggested recovery when `result` is an error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery: Option<RecoveryHint>,
    /// Payload fields
    #[serde(default, skip_serializing_if = "Params::is_empty")]
    pub payload: Params,
}

impl Response {
    /// An empty success response
    pub fn ok() -> Self {
        Self::ok_with(Params::new())
    }

    /// A success response carrying a payload
    pub fn ok_with(payload: Params) -> Self {
        Self {
            result: ResultCode::Ok,
            error_code: None,
            error_message: None,
            recovery: None,
            payload,
        }
    }

    /// An error response
    pub fn error<S: AsRef<str>>(code: ErrorCode, message: S) -> Self {
        Self {
            result: ResultCode::Error,
            error_code: Some(code.code()),
            error_message: Some(message.as_ref().to_string()),
            recovery: None,
            payload: Params::new(),
        }
    }

    /// Attach a recovery suggestion; [`RecoveryHint::None`] clears it
    pub fn with_recovery(mut self, hint: RecoveryHint) -> Self {
        self.recovery = match hint {
            RecoveryHint::None => None,
            hint => Some(hint),
        };
        self
    }

    /// An error response with the code's default message
    pub fn error_default(code: ErrorCode) -> Self {
        Self::error(code, code.message())
    }

    /// Whether the request succeeded
    pub fn is_ok(&self) -> bool {
        self.result == ResultCode::Ok
    }

    /// The typed error code, if any
    pub fn code(&self) -> Option<ErrorCode> {
        self.error_code.and_then(ErrorCode::from_code)
    }

    /// Look up a payload field
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }
}

/*!
 * Event envelopes and the event bus.
 *
 * Every asynchronous notification a device produces is an [`Event`] carrying
 * one tagged [`EventPayload`]. Listeners are keyed by [`Capability`], the
 * `profile / interface / attribute` triple the event is published under.
 */
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::types::{Params, ServiceId};

/// Maximum number of events that can be buffered in a channel
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Key of an event stream: `profile / interface / attribute`
///
/// Names compare case-insensitively but keep their original spelling for
/// display and for the events built from them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    /// Profile name
    pub profile: String,
    /// Interface name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    /// Attribute name
    pub attribute: String,
}

impl Capability {
    /// Create a capability key
    pub fn new<P: AsRef<str>, A: AsRef<str>>(profile: P, interface: Option<&str>, attribute: A) -> Self {
        Self {
            profile: profile.as_ref().to_string(),
            interface: interface.map(str::to_string),
            attribute: attribute.as_ref().to_string(),
        }
    }

    /// The connection status stream every plugin publishes
    pub fn connection() -> Self {
        Self::new("connection", None, "onConnectionChange")
    }

    /// Case-insensitive match against raw request names
    pub fn matches(&self, profile: &str, interface: Option<&str>, attribute: &str) -> bool {
        self.profile.eq_ignore_ascii_case(profile)
            && same_name(self.interface.as_deref(), interface)
            && self.attribute.eq_ignore_ascii_case(attribute)
    }
}

/// Case-insensitive equality of optional names
pub fn same_name(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        _ => false,
    }
}

impl PartialEq for Capability {
    fn eq(&self, other: &Self) -> bool {
        self.matches(&other.profile, other.interface.as_deref(), &other.attribute)
    }
}

impl Eq for Capability {}

impl Hash for Capability {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.profile.to_ascii_lowercase().hash(state);
        self.interface.as_ref().map(|i| i.to_ascii_lowercase()).hash(state);
        self.attribute.to_ascii_lowercase().hash(state);
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.interface {
            Some(interface) => write!(f, "{}/{}/{}", self.profile, interface, self.attribute),
            None => write!(f, "{}/{}", self.profile, self.attribute),
        }
    }
}

/// A detected body, hand or face
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Detection {
    /// Center x in sensor pixels
    pub x: i32,
    /// Center y in sensor pixels
    pub y: i32,
    /// Size in sensor pixels
    pub size: i32,
    /// Confidence, 0..1000
    pub confidence: i32,
}

/// Payload of an event, one variant per kind of notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EventPayload {
    /// Human bodies detected
    BodyDetected {
        /// Detections
        detections: Vec<Detection>,
    },
    /// Hands detected
    HandDetected {
        /// Detections
        detections: Vec<Detection>,
    },
    /// Faces detected
    FaceDetected {
        /// Detections
        detections: Vec<Detection>,
    },
    /// Orientation quaternion sample
    #[serde(rename_all = "camelCase")]
    Quaternion {
        /// q0
        q0: f64,
        /// q1
        q1: f64,
        /// q2
        q2: f64,
        /// q3
        q3: f64,
        /// Sampling interval in milliseconds
        interval_ms: u64,
    },
    /// Collision reported by a robot
    #[serde(rename_all = "camelCase")]
    Collision {
        /// Impact acceleration x
        impact_x: f64,
        /// Impact acceleration y
        impact_y: f64,
        /// Impact acceleration z
        impact_z: f64,
        /// Speed at impact
        impact_speed: f64,
    },
    /// Device connected or disconnected
    ConnectionChanged {
        /// Whether the device is now connected
        connected: bool,
    },
    /// Message posted on a chat channel
    ChannelMessage {
        /// Channel name or id
        channel: String,
        /// Sender
        user: String,
        /// Message text
        text: String,
    },
    /// Anything else, as loose fields
    Custom {
        /// Fields
        data: Params,
    },
}

impl EventPayload {
    /// Short kind name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::BodyDetected { .. } => "bodyDetected",
            EventPayload::HandDetected { .. } => "handDetected",
            EventPayload::FaceDetected { .. } => "faceDetected",
            EventPayload::Quaternion { .. } => "quaternion",
            EventPayload::Collision { .. } => "collision",
            EventPayload::ConnectionChanged { .. } => "connectionChanged",
            EventPayload::ChannelMessage { .. } => "channelMessage",
            EventPayload::Custom { .. } => "custom",
        }
    }
}

/// An event delivered to listeners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Originating service
    pub service_id: ServiceId,
    /// Profile name
    pub profile: String,
    /// Interface name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    /// Attribute name
    pub attribute: String,
    /// Payload
    pub payload: EventPayload,
    /// Time the event was produced
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Create an event for a capability
    pub fn new(service_id: ServiceId, capability: &Capability, payload: EventPayload) -> Self {
        Self {
            service_id,
            profile: capability.profile.clone(),
            interface: capability.interface.clone(),
            attribute: capability.attribute.clone(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// The capability this event is published under
    pub fn capability(&self) -> Capability {
        Capability::new(&self.profile, self.interface.as_deref(), &self.attribute)
    }
}

/// A broadcast bus
///
/// Slow receivers lag and lose the oldest items; publishing never blocks.
#[derive(Debug)]
pub struct EventBus<T: Clone = Event> {
    sender: broadcast::Sender<T>,
}

impl<T: Clone + Send + 'static> EventBus<T> {
    /// Create a new bus with the default capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new bus with a specific capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an item, returning the number of receivers it reached
    pub fn publish(&self, item: T) -> usize {
        match self.sender.send(item) {
            Ok(receivers) => receivers,
            Err(_) => {
                trace!("No receivers on event bus");
                0
            }
        }
    }

    /// Subscribe to the bus
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }

    /// Number of live receivers
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<T: Clone + Send + 'static> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A shared reference to an event bus
pub type SharedEventBus<T = Event> = Arc<EventBus<T>>;

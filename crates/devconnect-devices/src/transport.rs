/*!
 * Transport seam.
 *
 * A transport carries encoded commands to a device and is treated as an
 * opaque channel with ack/nack/timeout semantics. Whatever comes back
 * (acknowledgements, replies, events, connection changes) is pushed into
 * the owning plugin's inbound queue as [`Inbound`] values.
 */
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use devconnect_core::{
    event::{Capability, EventPayload},
    types::ServiceId,
};

use crate::correlator::RequestId;
use crate::device::{DeviceError, Result};

/// Body of a frame or reply
#[derive(Debug, Clone, PartialEq)]
pub enum FramePayload {
    /// Raw vendor bytes
    Binary(Bytes),
    /// JSON document
    Json(serde_json::Value),
    /// No body
    Empty,
}

impl FramePayload {
    /// Length of the body in bytes, JSON rendered compactly
    pub fn len(&self) -> usize {
        match self {
            FramePayload::Binary(bytes) => bytes.len(),
            FramePayload::Json(json) => json.to_string().len(),
            FramePayload::Empty => 0,
        }
    }

    /// Whether the body is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One outbound command
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Correlation id, absent for polling commands answered with events
    pub request_id: Option<RequestId>,
    /// Target device
    pub service_id: ServiceId,
    /// Operation name the frame was built for
    pub command: String,
    /// Encoded body
    pub payload: FramePayload,
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.request_id {
            Some(id) => write!(f, "{}#{} -> {}", self.command, id, self.service_id),
            None => write!(f, "{} -> {}", self.command, self.service_id),
        }
    }
}

/// Traffic arriving from devices
#[derive(Debug, Clone)]
pub enum Inbound {
    /// The device accepted a command
    Ack {
        /// Correlation id
        request_id: RequestId,
    },
    /// The device refused a command
    Nack {
        /// Correlation id
        request_id: RequestId,
    },
    /// The answer to a command
    Reply {
        /// Correlation id
        request_id: RequestId,
        /// Encoded answer
        body: FramePayload,
    },
    /// The device reported an error for a command
    Rejected {
        /// Correlation id
        request_id: RequestId,
        /// Reason given by the device
        reason: String,
    },
    /// An unsolicited event
    Event {
        /// Originating device
        service_id: ServiceId,
        /// Stream the event belongs to
        capability: Capability,
        /// Event body
        payload: EventPayload,
    },
    /// The answer to a polling command, decoded by the device's driver
    Sample {
        /// Originating device
        service_id: ServiceId,
        /// Stream the sample belongs to
        capability: Capability,
        /// Encoded answer
        body: FramePayload,
    },
    /// The device link went up or down
    Connection {
        /// Device
        service_id: ServiceId,
        /// Whether the link is up
        connected: bool,
    },
}

/// Outbound side of a device link
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Transport name for logging
    fn name(&self) -> &str;

    /// Whether the far end acknowledges each command before replying
    fn acknowledges(&self) -> bool {
        false
    }

    /// Send one frame
    async fn send(&self, frame: &Frame) -> Result<()>;

    /// Recovery side channel run after a NACK, e.g. relaunching the
    /// companion application on the device
    async fn recover(&self) -> Result<()> {
        Ok(())
    }
}

/// A transport backed by an in-process channel
///
/// Used by simulators and tests: every sent frame is forwarded to the
/// receiver returned by [`ChannelTransport::new`].
#[derive(Debug)]
pub struct ChannelTransport {
    name: String,
    acknowledges: bool,
    frames: mpsc::UnboundedSender<Frame>,
    sent: AtomicUsize,
    recoveries: AtomicUsize,
    failing: AtomicBool,
}

impl ChannelTransport {
    /// Create a transport and the receiver observing its frames
    pub fn new<S: AsRef<str>>(name: S, acknowledges: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            name: name.as_ref().to_string(),
            acknowledges,
            frames: tx,
            sent: AtomicUsize::new(0),
            recoveries: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        });
        (transport, rx)
    }

    /// Number of frames sent so far
    pub fn sent_count(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }

    /// Number of recovery actions run so far
    pub fn recovery_count(&self) -> usize {
        self.recoveries.load(Ordering::SeqCst)
    }

    /// Make subsequent sends fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn acknowledges(&self) -> bool {
        self.acknowledges
    }

    async fn send(&self, frame: &Frame) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DeviceError::connection(format!("{}: link down", self.name)));
        }
        self.sent.fetch_add(1, Ordering::SeqCst);
        self.frames
            .send(frame.clone())
            .map_err(|_| DeviceError::connection(format!("{}: receiver closed", self.name)))
    }

    async fn recover(&self) -> Result<()> {
        self.recoveries.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_transport_forwards_frames() {
        let (transport, mut rx) = ChannelTransport::new("sim", true);
        let frame = Frame {
            request_id: Some(RequestId::from(7)),
            service_id: ServiceId::new("pebble-1"),
            command: "notification.show".into(),
            payload: FramePayload::Json(serde_json::json!({"title": "hi"})),
        };

        transport.send(&frame).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), frame);
        assert_eq!(transport.sent_count(), 1);
        assert!(transport.acknowledges());
        assert_eq!(format!("{}", frame), "notification.show#7 -> pebble-1");

        transport.recover().await.unwrap();
        assert_eq!(transport.recovery_count(), 1);
    }

    #[tokio::test]
    async fn test_channel_transport_failing() {
        let (transport, _rx) = ChannelTransport::new("sim", false);
        transport.set_failing(true);
        let frame = Frame {
            request_id: None,
            service_id: ServiceId::new("x"),
            command: "poll".into(),
            payload: FramePayload::Empty,
        };
        let err = transport.send(&frame).await.unwrap_err();
        assert!(matches!(err, DeviceError::Connection(_)));
        assert_eq!(transport.sent_count(), 0);
        assert!(frame.payload.is_empty());
    }
}

/*!
 * Human detection sensor driver.
 *
 * The sensor speaks a small binary protocol. Every command starts with
 * `0xFE`, a command byte and a little-endian payload length:
 *
 * | command   | bytes                                                   |
 * |-----------|---------------------------------------------------------|
 * | threshold | `FE 05 08 00` body hand face recognition (u16 LE each)  |
 * | detect    | `FE 04 03 00` flags `00 00` (body = 1, hand = 2, face = 4) |
 *
 * Replies start with `0xFE`, a status byte and a u32 LE length. A detect
 * reply carries the body, hand and face counts and a reserved byte, then
 * eight bytes per detection: x, y, size and confidence as i16 LE.
 *
 * Detection streams are polled; a one-shot GET sends a single detect.
 */
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::debug;

use devconnect_core::{
    event::{Capability, Detection, EventPayload},
    message::Action,
    types::{Params, ServiceId, Value},
};

use crate::device::{DeviceDriver, DeviceError, DeviceInfo, Result};
use crate::profile::{Operation, OperationKind, ParamRule, ProfileSet, ProfileSpec, RetryBudget};
use crate::transport::FramePayload;

/// Profile name
pub const PROFILE: &str = "humanDetection";
/// Device type reported in device info
pub const DEVICE_TYPE: &str = "hvc";

const HEADER: u8 = 0xFE;
const CMD_DETECT: u8 = 0x04;
const CMD_THRESHOLD: u8 = 0x05;
const STATUS_OK: u8 = 0x00;
const RECOGNITION_THRESHOLD: u16 = 500;
const DEFAULT_THRESHOLD: u16 = 500;
const DETECTION_LEN: usize = 8;

/// What a detect command looks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Human bodies
    Body,
    /// Hands
    Hand,
    /// Faces
    Face,
}

impl Target {
    /// Detect flag bit
    pub fn flag(self) -> u8 {
        match self {
            Target::Body => 0x01,
            Target::Hand => 0x02,
            Target::Face => 0x04,
        }
    }

    fn from_attribute(attribute: &str) -> Option<Self> {
        match attribute.to_ascii_lowercase().as_str() {
            "onbodydetection" => Some(Target::Body),
            "onhanddetection" => Some(Target::Hand),
            "onfacedetection" => Some(Target::Face),
            _ => None,
        }
    }

    fn from_operation(operation: &str) -> Option<Self> {
        match operation {
            "detect.body" => Some(Target::Body),
            "detect.hand" => Some(Target::Hand),
            "detect.face" => Some(Target::Face),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Target::Body => "bodyDetects",
            Target::Hand => "handDetects",
            Target::Face => "faceDetects",
        }
    }
}

/// Routes of the `humanDetection` profile
pub fn profiles() -> ProfileSet {
    let mut spec = ProfileSpec::new(PROFILE).route(
        Operation::new(Action::Put, "threshold.set", OperationKind::OneShot(RetryBudget::Parameter))
            .attribute("threshold")
            .rule(ParamRule::optional_range("body", 1.0, 1000.0))
            .rule(ParamRule::optional_range("hand", 1.0, 1000.0))
            .rule(ParamRule::optional_range("face", 1.0, 1000.0)),
    );
    for (attribute, read) in [
        ("onBodyDetection", "detect.body"),
        ("onHandDetection", "detect.hand"),
        ("onFaceDetection", "detect.face"),
    ] {
        spec = spec
            .route(
                Operation::new(Action::Get, read, OperationKind::OneShot(RetryBudget::Default))
                    .attribute(attribute)
                    .rule(ParamRule::optional_range("threshold", 1.0, 1000.0)),
            )
            .route(
                Operation::new(Action::Put, "detect.subscribe", OperationKind::Subscribe)
                    .attribute(attribute)
                    .rule(ParamRule::optional_range("interval", 3000.0, 60000.0))
                    .rule(ParamRule::optional_range("threshold", 1.0, 1000.0)),
            )
            .route(
                Operation::new(Action::Delete, "detect.unsubscribe", OperationKind::Unsubscribe)
                    .attribute(attribute),
            );
    }
    ProfileSet::new().with(spec)
}

/// Device info for a sensor
pub fn device_info<I: Into<ServiceId>, N: AsRef<str>>(id: I, name: N) -> DeviceInfo {
    DeviceInfo::new(id, name, DEVICE_TYPE).with_profile(PROFILE)
}

/// Detection thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    /// Body detection threshold
    pub body: u16,
    /// Hand detection threshold
    pub hand: u16,
    /// Face detection threshold
    pub face: u16,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            body: DEFAULT_THRESHOLD,
            hand: DEFAULT_THRESHOLD,
            face: DEFAULT_THRESHOLD,
        }
    }
}

impl Thresholds {
    fn get(&self, target: Target) -> u16 {
        match target {
            Target::Body => self.body,
            Target::Hand => self.hand,
            Target::Face => self.face,
        }
    }

    fn merged(self, params: &Params) -> Self {
        let read = |key: &str, current: u16| {
            params
                .get(key)
                .and_then(Value::as_number)
                .map(|v| v as u16)
                .unwrap_or(current)
        };
        Self {
            body: read("body", self.body),
            hand: read("hand", self.hand),
            face: read("face", self.face),
        }
    }
}

/// Parsed detect reply
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetectionResult {
    /// Bodies
    pub bodies: Vec<Detection>,
    /// Hands
    pub hands: Vec<Detection>,
    /// Faces
    pub faces: Vec<Detection>,
}

impl DetectionResult {
    fn of(&self, target: Target) -> &[Detection] {
        match target {
            Target::Body => &self.bodies,
            Target::Hand => &self.hands,
            Target::Face => &self.faces,
        }
    }

    /// Encode as a sensor reply, as sent by the device
    pub fn to_reply(&self) -> Bytes {
        let count = self.bodies.len() + self.hands.len() + self.faces.len();
        let len = 4 + count * DETECTION_LEN;
        let mut buf = BytesMut::with_capacity(6 + len);
        buf.put_u8(HEADER);
        buf.put_u8(STATUS_OK);
        buf.put_u32_le(len as u32);
        buf.put_u8(self.bodies.len() as u8);
        buf.put_u8(self.hands.len() as u8);
        buf.put_u8(self.faces.len() as u8);
        buf.put_u8(0);
        for d in self.bodies.iter().chain(&self.hands).chain(&self.faces) {
            buf.put_i16_le(d.x as i16);
            buf.put_i16_le(d.y as i16);
            buf.put_i16_le(d.size as i16);
            buf.put_i16_le(d.confidence as i16);
        }
        buf.freeze()
    }
}

/// Build a detect command
pub fn detect_command(flags: u8) -> Bytes {
    let mut buf = BytesMut::with_capacity(7);
    buf.put_u8(HEADER);
    buf.put_u8(CMD_DETECT);
    buf.put_u16_le(3);
    buf.put_u8(flags);
    buf.put_u8(0);
    buf.put_u8(0);
    buf.freeze()
}

/// Build a threshold command
pub fn threshold_command(thresholds: Thresholds) -> Bytes {
    let mut buf = BytesMut::with_capacity(12);
    buf.put_u8(HEADER);
    buf.put_u8(CMD_THRESHOLD);
    buf.put_u16_le(8);
    buf.put_u16_le(thresholds.body);
    buf.put_u16_le(thresholds.hand);
    buf.put_u16_le(thresholds.face);
    buf.put_u16_le(RECOGNITION_THRESHOLD);
    buf.freeze()
}

/// Check the reply header, returning the reply body
fn reply_body(payload: &FramePayload) -> Result<Bytes> {
    let FramePayload::Binary(bytes) = payload else {
        return Err(DeviceError::unknown("expected a binary reply"));
    };
    let mut buf = bytes.clone();
    if buf.remaining() < 6 {
        return Err(DeviceError::unknown(format!("reply too short: {} bytes", buf.remaining())));
    }
    if buf.get_u8() != HEADER {
        return Err(DeviceError::unknown("reply header missing"));
    }
    let status = buf.get_u8();
    if status != STATUS_OK {
        return Err(DeviceError::connection(format!("sensor status {:#04x}", status)));
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return Err(DeviceError::unknown(format!(
            "reply truncated: {} of {} bytes",
            buf.remaining(),
            len
        )));
    }
    Ok(buf.copy_to_bytes(len))
}

/// Parse a detect reply
pub fn parse_detection(payload: &FramePayload) -> Result<DetectionResult> {
    let mut body = reply_body(payload)?;
    if body.remaining() < 4 {
        return Err(DeviceError::unknown("detect reply without counts"));
    }
    let counts = [body.get_u8() as usize, body.get_u8() as usize, body.get_u8() as usize];
    body.advance(1);
    if body.remaining() < counts.iter().sum::<usize>() * DETECTION_LEN {
        return Err(DeviceError::unknown("detect reply truncated"));
    }

    let mut read = |n: usize| -> Vec<Detection> {
        (0..n)
            .map(|_| Detection {
                x: body.get_i16_le() as i32,
                y: body.get_i16_le() as i32,
                size: body.get_i16_le() as i32,
                confidence: body.get_i16_le() as i32,
            })
            .collect()
    };
    let bodies = read(counts[0]);
    let hands = read(counts[1]);
    let faces = read(counts[2]);
    Ok(DetectionResult { bodies, hands, faces })
}

fn detections_json(detections: &[Detection]) -> Value {
    Value::Array(
        detections
            .iter()
            .map(|d| {
                let mut item = Params::new();
                item.insert("x".into(), Value::Integer(d.x as i64));
                item.insert("y".into(), Value::Integer(d.y as i64));
                item.insert("size".into(), Value::Integer(d.size as i64));
                item.insert("confidence".into(), Value::Integer(d.confidence as i64));
                Value::Object(item)
            })
            .collect(),
    )
}

/// Driver for one sensor
#[derive(Debug, Default)]
pub struct HumanDetectDriver {
    thresholds: Thresholds,
    requested: Option<Thresholds>,
    stream_thresholds: Vec<(Target, u16)>,
}

impl HumanDetectDriver {
    /// Create a driver with default thresholds
    pub fn new() -> Self {
        Self::default()
    }

    /// Thresholds confirmed by the sensor
    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    fn stream_threshold(&self, target: Target) -> u16 {
        self.stream_thresholds
            .iter()
            .find(|(t, _)| *t == target)
            .map(|(_, threshold)| *threshold)
            .unwrap_or_else(|| self.thresholds.get(target))
    }

    fn filtered(detections: &[Detection], threshold: u16) -> Vec<Detection> {
        detections
            .iter()
            .filter(|d| d.confidence >= threshold as i32)
            .copied()
            .collect()
    }
}

#[async_trait]
impl DeviceDriver for HumanDetectDriver {
    fn driver_name(&self) -> &'static str {
        "human-detect"
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.requested = None;
        self.stream_thresholds.clear();
        Ok(())
    }

    fn encode(&mut self, operation: &str, params: &Params) -> Result<FramePayload> {
        if operation == "threshold.set" {
            let thresholds = self.thresholds.merged(params);
            self.requested = Some(thresholds);
            return Ok(FramePayload::Binary(threshold_command(thresholds)));
        }
        let target = Target::from_operation(operation)
            .ok_or_else(|| DeviceError::NotSupportAction(operation.to_string()))?;
        Ok(FramePayload::Binary(detect_command(target.flag())))
    }

    fn decode(&mut self, operation: &str, payload: &FramePayload) -> Result<Params> {
        if operation == "threshold.set" {
            reply_body(payload)?;
            if let Some(thresholds) = self.requested.take() {
                self.thresholds = thresholds;
            }
            let mut result = Params::new();
            result.insert("body".into(), Value::Integer(self.thresholds.body as i64));
            result.insert("hand".into(), Value::Integer(self.thresholds.hand as i64));
            result.insert("face".into(), Value::Integer(self.thresholds.face as i64));
            return Ok(result);
        }

        let target = Target::from_operation(operation)
            .ok_or_else(|| DeviceError::NotSupportAction(operation.to_string()))?;
        let detections = parse_detection(payload)?;
        let mut result = Params::new();
        result.insert(target.key().into(), detections_json(detections.of(target)));
        Ok(result)
    }

    async fn start_stream(&mut self, capability: &Capability, params: &Params) -> Result<()> {
        let target = Target::from_attribute(&capability.attribute)
            .ok_or_else(|| DeviceError::NotSupportAttribute(capability.to_string()))?;
        if let Some(threshold) = params.get("threshold").and_then(Value::as_number) {
            self.stream_thresholds.retain(|(t, _)| *t != target);
            self.stream_thresholds.push((target, threshold as u16));
        }
        debug!(?target, threshold = self.stream_threshold(target), "Detection stream started");
        Ok(())
    }

    async fn stop_stream(&mut self, capability: &Capability) -> Result<()> {
        if let Some(target) = Target::from_attribute(&capability.attribute) {
            self.stream_thresholds.retain(|(t, _)| *t != target);
        }
        Ok(())
    }

    fn poll_command(&self, capability: &Capability, _params: &Params) -> Option<FramePayload> {
        Target::from_attribute(&capability.attribute)
            .map(|target| FramePayload::Binary(detect_command(target.flag())))
    }

    fn decode_event(&mut self, capability: &Capability, body: &FramePayload) -> Result<Option<EventPayload>> {
        let Some(target) = Target::from_attribute(&capability.attribute) else {
            return Ok(None);
        };
        let result = parse_detection(body)?;
        let detections = Self::filtered(result.of(target), self.stream_threshold(target));
        if detections.is_empty() {
            return Ok(None);
        }
        Ok(Some(match target {
            Target::Body => EventPayload::BodyDetected { detections },
            Target::Hand => EventPayload::HandDetected { detections },
            Target::Face => EventPayload::FaceDetected { detections },
        }))
    }
}

/*!
 * Rolling robot driver.
 *
 * Serves `driveController` for motion, the `sphero` quaternion and
 * collision streams, and `deviceOrientation`. Motion commands are applied
 * directly; a single orientation reading is requested from the robot and
 * correlated with its reply. Sensor streams are pushed by the robot once
 * enabled.
 */
use std::collections::BTreeSet;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use devconnect_core::{
    event::Capability,
    message::Action,
    types::{Params, ServiceId, Value},
};

use crate::device::{DeviceDriver, DeviceError, DeviceInfo, Result};
use crate::profile::{Operation, OperationKind, ParamRule, ProfileSet, ProfileSpec, RetryBudget};
use crate::transport::FramePayload;

/// Motion profile
pub const DRIVE_PROFILE: &str = "driveController";
/// Robot sensor profile
pub const SPHERO_PROFILE: &str = "sphero";
/// Orientation profile
pub const ORIENTATION_PROFILE: &str = "deviceOrientation";
/// Device type reported in device info
pub const DEVICE_TYPE: &str = "sphero";

/// Routes served by the robot
pub fn profiles() -> ProfileSet {
    let drive = ProfileSpec::new(DRIVE_PROFILE)
        .route(Operation::new(Action::Get, "drive.status", OperationKind::Query))
        .route(
            Operation::new(Action::Post, "drive.move", OperationKind::Apply)
                .attribute("move")
                .rule(ParamRule::range("angle", 0.0, 360.0))
                .rule(ParamRule::range("speed", 0.0, 1.0)),
        )
        .route(
            Operation::new(Action::Put, "drive.rotate", OperationKind::Apply)
                .attribute("rotate")
                .rule(ParamRule::range("angle", 0.0, 360.0)),
        )
        .route(Operation::new(Action::Delete, "drive.stop", OperationKind::Apply).attribute("stop"));

    let sphero = ProfileSpec::new(SPHERO_PROFILE)
        .route(
            Operation::new(Action::Put, "quaternion.subscribe", OperationKind::Subscribe)
                .interface("quaternion")
                .attribute("onQuaternion"),
        )
        .route(
            Operation::new(Action::Delete, "quaternion.unsubscribe", OperationKind::Unsubscribe)
                .interface("quaternion")
                .attribute("onQuaternion"),
        )
        .route(
            Operation::new(Action::Put, "collision.subscribe", OperationKind::Subscribe)
                .interface("collision")
                .attribute("onCollision"),
        )
        .route(
            Operation::new(Action::Delete, "collision.unsubscribe", OperationKind::Unsubscribe)
                .interface("collision")
                .attribute("onCollision"),
        );

    let orientation = ProfileSpec::new(ORIENTATION_PROFILE)
        .route(
            Operation::new(
                Action::Get,
                "orientation.read",
                OperationKind::OneShot(RetryBudget::Default),
            )
            .attribute("onDeviceOrientation"),
        )
        .route(
            Operation::new(Action::Put, "orientation.subscribe", OperationKind::Subscribe)
                .attribute("onDeviceOrientation")
                .rule(ParamRule::optional_range("interval", 10.0, 1000.0)),
        )
        .route(
            Operation::new(Action::Delete, "orientation.unsubscribe", OperationKind::Unsubscribe)
                .attribute("onDeviceOrientation"),
        );

    ProfileSet::new().with(drive).with(sphero).with(orientation)
}

/// Device info for a robot
pub fn device_info<I: Into<ServiceId>, N: AsRef<str>>(id: I, name: N) -> DeviceInfo {
    DeviceInfo::new(id, name, DEVICE_TYPE)
        .with_profile(DRIVE_PROFILE)
        .with_profile(SPHERO_PROFILE)
        .with_profile(ORIENTATION_PROFILE)
}

/// Driver for one robot
#[derive(Debug, Default)]
pub struct DriveDriver {
    heading: f64,
    speed: f64,
    sensors: BTreeSet<String>,
}

impl DriveDriver {
    /// Create a driver for a robot at rest
    pub fn new() -> Self {
        Self::default()
    }

    fn number(params: &Params, key: &str) -> Result<f64> {
        params
            .get(key)
            .and_then(Value::as_number)
            .ok_or_else(|| DeviceError::invalid_parameter(format!("{} is required", key)))
    }

    fn sensor_mask(&self) -> Vec<&str> {
        self.sensors.iter().map(String::as_str).collect()
    }
}

#[async_trait]
impl DeviceDriver for DriveDriver {
    fn driver_name(&self) -> &'static str {
        "drive"
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.speed = 0.0;
        self.sensors.clear();
        Ok(())
    }

    async fn apply(&mut self, operation: &str, params: &Params) -> Result<()> {
        match operation {
            "drive.move" => {
                self.heading = Self::number(params, "angle")?;
                self.speed = Self::number(params, "speed")?;
            }
            "drive.rotate" => self.heading = Self::number(params, "angle")?,
            "drive.stop" => self.speed = 0.0,
            other => return Err(DeviceError::NotSupportAction(other.to_string())),
        }
        debug!(heading = self.heading, speed = self.speed, "Applied {}", operation);
        Ok(())
    }

    async fn query(&mut self, operation: &str, _params: &Params) -> Result<Params> {
        if operation != "drive.status" {
            return Err(DeviceError::NotSupportAction(operation.to_string()));
        }
        let mut payload = Params::new();
        payload.insert("angle".into(), Value::Float(self.heading));
        payload.insert("speed".into(), Value::Float(self.speed));
        payload.insert("rolling".into(), Value::Bool(self.speed > 0.0));
        Ok(payload)
    }

    fn encode(&mut self, operation: &str, _params: &Params) -> Result<FramePayload> {
        match operation {
            "orientation.read" => Ok(FramePayload::Json(json!({
                "command": "readSensors",
                "sensors": ["accelerometer", "gyroscope", "quaternion"],
            }))),
            other => Err(DeviceError::NotSupportAction(other.to_string())),
        }
    }

    async fn start_stream(&mut self, capability: &Capability, _params: &Params) -> Result<()> {
        self.sensors.insert(capability.attribute.to_ascii_lowercase());
        debug!(mask = ?self.sensor_mask(), "Sensor streaming enabled");
        Ok(())
    }

    async fn stop_stream(&mut self, capability: &Capability) -> Result<()> {
        self.sensors.remove(&capability.attribute.to_ascii_lowercase());
        debug!(mask = ?self.sensor_mask(), "Sensor streaming reduced");
        Ok(())
    }
}

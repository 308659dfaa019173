/*!
 * Smart light driver.
 *
 * Serves the `light` profile for bridge-attached bulbs: power, color and
 * brightness, plus an optional flashing pattern.
 */
use async_trait::async_trait;
use tracing::debug;

use devconnect_core::{
    message::Action,
    types::{Params, ServiceId, Value},
};

use crate::device::{DeviceDriver, DeviceError, DeviceInfo, Result};
use crate::profile::{format_color, parse_color, Operation, OperationKind, ParamRule, ProfileSet, ProfileSpec};

/// Profile name
pub const PROFILE: &str = "light";

/// Device type reported in device info
pub const DEVICE_TYPE: &str = "light";

const WHITE: [u8; 3] = [0xFF, 0xFF, 0xFF];

fn light_rules(operation: Operation) -> Operation {
    operation
        .rule(ParamRule::color("color"))
        .rule(ParamRule::optional_range("brightness", 0.0, 1.0))
        .rule(ParamRule::Text {
            name: "flashing",
            required: false,
        })
}

/// Routes of the `light` profile
pub fn profiles() -> ProfileSet {
    ProfileSet::new().with(
        ProfileSpec::new(PROFILE)
            .route(Operation::new(Action::Get, "light.status", OperationKind::Query))
            .route(light_rules(Operation::new(Action::Post, "light.on", OperationKind::Apply)))
            .route(light_rules(Operation::new(Action::Put, "light.update", OperationKind::Apply)))
            .route(Operation::new(Action::Delete, "light.off", OperationKind::Apply))
            .route(Operation::new(Action::Get, "light.status", OperationKind::Query).attribute("on"))
            .route(light_rules(
                Operation::new(Action::Put, "light.on", OperationKind::Apply).attribute("on"),
            ))
            .route(Operation::new(Action::Delete, "light.off", OperationKind::Apply).attribute("on")),
    )
}

/// Device info for a light
pub fn device_info<I: Into<ServiceId>, N: AsRef<str>>(id: I, name: N) -> DeviceInfo {
    DeviceInfo::new(id, name, DEVICE_TYPE).with_profile(PROFILE)
}

/// Light state
#[derive(Debug, Clone, PartialEq)]
pub struct LightState {
    /// Power
    pub on: bool,
    /// RGB color
    pub color: [u8; 3],
    /// Brightness, 0..1
    pub brightness: f64,
    /// Flashing pattern in milliseconds, alternating on and off
    pub flashing: Vec<u64>,
}

impl Default for LightState {
    fn default() -> Self {
        Self {
            on: false,
            color: WHITE,
            brightness: 1.0,
            flashing: Vec::new(),
        }
    }
}

/// Driver for one light
#[derive(Debug, Default)]
pub struct LightDriver {
    state: LightState,
    connected: bool,
}

impl LightDriver {
    /// Create a driver for a light that is off
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state
    pub fn state(&self) -> &LightState {
        &self.state
    }

    fn update(&mut self, params: &Params) -> Result<()> {
        // validate everything before touching the light
        let color = params
            .get("color")
            .and_then(Value::as_str)
            .map(|color| {
                parse_color(color).ok_or_else(|| DeviceError::invalid_parameter(format!("unknown color {}", color)))
            })
            .transpose()?;
        let brightness = params.get("brightness").and_then(Value::as_number);
        let flashing = params
            .get("flashing")
            .and_then(Value::as_str)
            .map(parse_flashing)
            .transpose()?;

        if let Some(color) = color {
            self.state.color = color;
        }
        if let Some(brightness) = brightness {
            self.state.brightness = brightness;
        }
        if let Some(flashing) = flashing {
            self.state.flashing = flashing;
        }
        Ok(())
    }
}

/// Parse a comma separated list of durations in milliseconds
fn parse_flashing(pattern: &str) -> Result<Vec<u64>> {
    pattern
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<u64>()
                .ok()
                .filter(|ms| *ms > 0)
                .ok_or_else(|| DeviceError::invalid_parameter(format!("flashing is invalid: {}", pattern)))
        })
        .collect()
}

#[async_trait]
impl DeviceDriver for LightDriver {
    fn driver_name(&self) -> &'static str {
        "light"
    }

    async fn connect(&mut self) -> Result<()> {
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }

    async fn apply(&mut self, operation: &str, params: &Params) -> Result<()> {
        if !self.connected {
            return Err(DeviceError::NotConnected("light bridge unreachable".into()));
        }
        match operation {
            "light.on" => {
                self.update(params)?;
                self.state.on = true;
            }
            "light.update" => self.update(params)?,
            "light.off" => {
                self.state.on = false;
                self.state.flashing.clear();
            }
            other => return Err(DeviceError::NotSupportAction(other.to_string())),
        }
        debug!("Light now {:?}", self.state);
        Ok(())
    }

    async fn query(&mut self, operation: &str, _params: &Params) -> Result<Params> {
        if operation != "light.status" {
            return Err(DeviceError::NotSupportAction(operation.to_string()));
        }
        let mut payload = Params::new();
        payload.insert("on".into(), Value::Bool(self.state.on));
        payload.insert("color".into(), Value::String(format_color(self.state.color)));
        payload.insert("brightness".into(), Value::Float(self.state.brightness));
        if !self.state.flashing.is_empty() {
            let pattern = self.state.flashing.iter().map(|ms| Value::Integer(*ms as i64)).collect();
            payload.insert("flashing".into(), Value::Array(pattern));
        }
        Ok(payload)
    }
}

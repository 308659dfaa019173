/*!
 * Profile tables.
 *
 * A plugin declares, per profile, which `(action, interface, attribute)`
 * routes it serves, what kind of device operation each route maps to and
 * which parameter rules the request must satisfy. Resolution and validation
 * happen before any device is touched.
 */
use std::fmt;

use devconnect_core::{
    event::{same_name, Capability},
    message::{Action, Request},
    types::{Params, Value},
};

use crate::device::{DeviceError, Result};

/// Retry budget of a one-shot command after NACKs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryBudget {
    /// The configured budget for ordinary commands
    Default,
    /// The configured budget for parameter commands
    Parameter,
    /// No retries
    None,
}

/// How a route is carried out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// Fire-and-forget mutation applied to the vendor handle
    Apply,
    /// Read of state held by the vendor handle
    Query,
    /// Command whose answer arrives later and is correlated by request id
    OneShot(RetryBudget),
    /// Event registration
    Subscribe,
    /// Event unregistration
    Unsubscribe,
}

/// A parameter constraint
#[derive(Debug, Clone, PartialEq)]
pub enum ParamRule {
    /// Number within an inclusive range
    Range {
        /// Parameter name
        name: &'static str,
        /// Lower bound
        min: f64,
        /// Upper bound
        max: f64,
        /// Whether the parameter must be present
        required: bool,
    },
    /// Color name or `RRGGBB` hex
    Color {
        /// Parameter name
        name: &'static str,
        /// Whether the parameter must be present
        required: bool,
    },
    /// Boolean
    Flag {
        /// Parameter name
        name: &'static str,
        /// Whether the parameter must be present
        required: bool,
    },
    /// Non-empty text
    Text {
        /// Parameter name
        name: &'static str,
        /// Whether the parameter must be present
        required: bool,
    },
}

impl ParamRule {
    /// A required numeric range
    pub fn range(name: &'static str, min: f64, max: f64) -> Self {
        ParamRule::Range {
            name,
            min,
            max,
            required: true,
        }
    }

    /// An optional numeric range
    pub fn optional_range(name: &'static str, min: f64, max: f64) -> Self {
        ParamRule::Range {
            name,
            min,
            max,
            required: false,
        }
    }

    /// An optional color
    pub fn color(name: &'static str) -> Self {
        ParamRule::Color { name, required: false }
    }

    /// An optional boolean
    pub fn flag(name: &'static str) -> Self {
        ParamRule::Flag { name, required: false }
    }

    /// A required text
    pub fn text(name: &'static str) -> Self {
        ParamRule::Text { name, required: true }
    }

    fn name(&self) -> &'static str {
        match self {
            ParamRule::Range { name, .. }
            | ParamRule::Color { name, .. }
            | ParamRule::Flag { name, .. }
            | ParamRule::Text { name, .. } => name,
        }
    }

    fn required(&self) -> bool {
        match self {
            ParamRule::Range { required, .. }
            | ParamRule::Color { required, .. }
            | ParamRule::Flag { required, .. }
            | ParamRule::Text { required, .. } => *required,
        }
    }

    fn check(&self, params: &Params) -> Result<()> {
        let name = self.name();
        let value = match params.get(name) {
            None | Some(Value::Null) if self.required() => {
                return Err(DeviceError::invalid_parameter(format!("{} is required", name)))
            }
            None | Some(Value::Null) => return Ok(()),
            Some(value) => value,
        };

        let valid = match self {
            ParamRule::Range { min, max, .. } => {
                matches!(value.as_number(), Some(v) if v >= *min && v <= *max)
            }
            ParamRule::Color { .. } => value.as_str().and_then(parse_color).is_some(),
            ParamRule::Flag { .. } => value.as_flag().is_some(),
            ParamRule::Text { .. } => value.as_str().map_or(false, |s| !s.trim().is_empty()),
        };

        if valid {
            Ok(())
        } else {
            Err(DeviceError::invalid_parameter(match self {
                ParamRule::Range { min, max, .. } => {
                    format!("{} must be between {} and {}, got {}", name, min, max, value)
                }
                _ => format!("{} is invalid: {}", name, value),
            }))
        }
    }
}

/// Parse a color name or `RRGGBB` hex string into RGB
pub fn parse_color(s: &str) -> Option<[u8; 3]> {
    let named = match s.to_ascii_lowercase().as_str() {
        "red" => Some([0xFF, 0x00, 0x00]),
        "green" => Some([0x00, 0xFF, 0x00]),
        "blue" => Some([0x00, 0x00, 0xFF]),
        "white" => Some([0xFF, 0xFF, 0xFF]),
        "yellow" => Some([0xFF, 0xFF, 0x00]),
        "cyan" => Some([0x00, 0xFF, 0xFF]),
        "magenta" => Some([0xFF, 0x00, 0xFF]),
        "black" => Some([0x00, 0x00, 0x00]),
        _ => None,
    };
    if named.is_some() {
        return named;
    }

    let hex = s.strip_prefix('#').unwrap_or(s);
    if hex.len() != 6 || !hex.is_ascii() {
        return None;
    }
    let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
    Some([channel(0)?, channel(2)?, channel(4)?])
}

/// Format RGB as upper-case `RRGGBB`
pub fn format_color(rgb: [u8; 3]) -> String {
    format!("{:02X}{:02X}{:02X}", rgb[0], rgb[1], rgb[2])
}

/// One route of a profile
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    /// Action served
    pub action: Action,
    /// Interface name
    pub interface: Option<&'static str>,
    /// Attribute name, absent for profile-level routes
    pub attribute: Option<&'static str>,
    /// Operation name handed to the driver
    pub name: &'static str,
    /// How the route is carried out
    pub kind: OperationKind,
    /// Parameter constraints
    pub rules: Vec<ParamRule>,
}

impl Operation {
    /// Create a profile-level route
    pub fn new(action: Action, name: &'static str, kind: OperationKind) -> Self {
        Self {
            action,
            interface: None,
            attribute: None,
            name,
            kind,
            rules: Vec::new(),
        }
    }

    /// Set the interface
    pub fn interface(mut self, interface: &'static str) -> Self {
        self.interface = Some(interface);
        self
    }

    /// Set the attribute
    pub fn attribute(mut self, attribute: &'static str) -> Self {
        self.attribute = Some(attribute);
        self
    }

    /// Add a parameter rule
    pub fn rule(mut self, rule: ParamRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Check the request parameters against every rule
    pub fn validate(&self, params: &Params) -> Result<()> {
        self.rules.iter().try_for_each(|rule| rule.check(params))
    }

    /// The parameters named by a rule, with null values dropped
    pub fn declared(&self, params: &Params) -> Params {
        self.rules
            .iter()
            .filter_map(|rule| {
                params
                    .get(rule.name())
                    .filter(|value| **value != Value::Null)
                    .map(|value| (rule.name().to_string(), value.clone()))
            })
            .collect()
    }

    /// The capability key of this route under a profile
    pub fn capability(&self, profile: &str) -> Capability {
        Capability::new(profile, self.interface, self.attribute.unwrap_or(self.name))
    }

    fn serves(&self, interface: Option<&str>, attribute: Option<&str>) -> bool {
        same_name(self.interface, interface) && same_name(self.attribute, attribute)
    }
}

/// The routes of one profile
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileSpec {
    /// Profile name
    pub name: &'static str,
    /// Routes
    pub operations: Vec<Operation>,
}

impl ProfileSpec {
    /// Create an empty profile
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            operations: Vec::new(),
        }
    }

    /// Add a route
    pub fn route(mut self, operation: Operation) -> Self {
        self.operations.push(operation);
        self
    }
}

/// The profiles a plugin serves
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileSet {
    profiles: Vec<ProfileSpec>,
}

/// A request resolved against the profile tables
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved<'a> {
    /// Profile name as declared
    pub profile: &'static str,
    /// The route
    pub operation: &'a Operation,
}

impl Resolved<'_> {
    /// Capability key of the resolved route
    pub fn capability(&self) -> Capability {
        self.operation.capability(self.profile)
    }
}

impl fmt::Display for Resolved<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.operation.action, self.capability())
    }
}

impl ProfileSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a profile
    pub fn with(mut self, profile: ProfileSpec) -> Self {
        self.profiles.push(profile);
        self
    }

    /// Merge another set into this one
    pub fn merge(mut self, other: ProfileSet) -> Self {
        self.profiles.extend(other.profiles);
        self
    }

    /// Names of all profiles
    pub fn names(&self) -> Vec<&'static str> {
        self.profiles.iter().map(|p| p.name).collect()
    }

    /// Find the route serving a request
    ///
    /// Misses are reported as not-supported profile, attribute or action, in
    /// that order of precedence.
    pub fn resolve(&self, request: &Request) -> Result<Resolved<'_>> {
        let profile = self
            .profiles
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(&request.profile))
            .ok_or_else(|| DeviceError::NotSupportProfile(request.profile.clone()))?;

        let mut candidates = profile
            .operations
            .iter()
            .filter(|op| op.serves(request.interface.as_deref(), request.attribute.as_deref()))
            .peekable();

        if candidates.peek().is_none() {
            return Err(DeviceError::NotSupportAttribute(request.path()));
        }

        candidates
            .find(|op| op.action == request.action)
            .map(|operation| Resolved {
                profile: profile.name,
                operation,
            })
            .ok_or_else(|| DeviceError::NotSupportAction(format!("{} {}", request.action, request.path())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profiles() -> ProfileSet {
        ProfileSet::new().with(
            ProfileSpec::new("driveController")
                .route(
                    Operation::new(Action::Post, "drive.move", OperationKind::Apply)
                        .attribute("move")
                        .rule(ParamRule::range("angle", 0.0, 360.0))
                        .rule(ParamRule::range("speed", 0.0, 1.0)),
                )
                .route(Operation::new(Action::Delete, "drive.stop", OperationKind::Apply).attribute("stop")),
        )
    }

    #[test]
    fn test_resolve() {
        let set = profiles();
        let request = Request::new(Action::Post, "s", "DriveController").with_attribute("MOVE");
        let resolved = set.resolve(&request).unwrap();
        assert_eq!(resolved.operation.name, "drive.move");
        assert_eq!(resolved.profile, "driveController");
        assert_eq!(resolved.capability(), Capability::new("driveController", None, "move"));
    }

    #[test]
    fn test_resolve_misses() {
        let set = profiles();
        let err = set.resolve(&Request::new(Action::Get, "s", "light")).unwrap_err();
        assert!(matches!(err, DeviceError::NotSupportProfile(_)));

        let err = set
            .resolve(&Request::new(Action::Post, "s", "driveController").with_attribute("jump"))
            .unwrap_err();
        assert!(matches!(err, DeviceError::NotSupportAttribute(_)));

        let err = set
            .resolve(&Request::new(Action::Get, "s", "driveController").with_attribute("move"))
            .unwrap_err();
        assert!(matches!(err, DeviceError::NotSupportAction(_)));
    }

    #[test]
    fn test_range_rules() {
        let set = profiles();
        let request = Request::new(Action::Post, "s", "driveController")
            .with_attribute("move")
            .with_param("angle", 90)
            .with_param("speed", "0.5");
        let op = set.resolve(&request).unwrap().operation;
        assert!(op.validate(&request.params).is_ok());

        let bad = request.clone().with_param("angle", 361);
        assert!(matches!(
            op.validate(&bad.params),
            Err(DeviceError::InvalidRequestParameter(_))
        ));

        let bad = request.clone().with_param("speed", -0.1);
        assert!(op.validate(&bad.params).is_err());

        let mut missing = request.params.clone();
        missing.remove("angle");
        assert!(op.validate(&missing).is_err());

        let bad = request.with_param("speed", "fast");
        assert!(op.validate(&bad.params).is_err());
    }

    #[test]
    fn test_optional_rules() {
        let op = Operation::new(Action::Put, "light.on", OperationKind::Apply)
            .rule(ParamRule::color("color"))
            .rule(ParamRule::optional_range("brightness", 0.0, 1.0))
            .rule(ParamRule::flag("flashing"));

        assert!(op.validate(&Params::new()).is_ok());

        let mut params = Params::new();
        params.insert("color".into(), "red".into());
        params.insert("brightness".into(), Value::Null);
        params.insert("flashing".into(), "true".into());
        assert!(op.validate(&params).is_ok());

        params.insert("color".into(), "purple-ish".into());
        assert!(op.validate(&params).is_err());
    }

    #[test]
    fn test_declared_params() {
        let op = Operation::new(Action::Put, "detect.subscribe", OperationKind::Subscribe)
            .rule(ParamRule::optional_range("interval", 3000.0, 60000.0))
            .rule(ParamRule::optional_range("threshold", 1.0, 1000.0));

        let mut params = Params::new();
        params.insert("interval".into(), Value::Integer(5000));
        params.insert("threshold".into(), Value::Null);
        params.insert("sessionKey".into(), "app-1".into());

        let declared = op.declared(&params);
        assert_eq!(declared.len(), 1);
        assert_eq!(declared.get("interval"), Some(&Value::Integer(5000)));
    }

    #[test]
    fn test_colors() {
        assert_eq!(parse_color("red"), Some([0xFF, 0, 0]));
        assert_eq!(parse_color("#00ff80"), Some([0, 0xFF, 0x80]));
        assert_eq!(parse_color("00FF8"), None);
        assert_eq!(parse_color("zzzzzz"), None);
        assert_eq!(parse_color("ééé"), None);
        assert_eq!(format_color([0xFF, 0, 0x0A]), "FF000A");
    }
}

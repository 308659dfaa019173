/*!
 * Composite service addressing.
 *
 * Clients address devices as `<device>.<plugin>.<domain>`; the bare
 * `<plugin>.<domain>` form addresses the plugin itself. Device ids may
 * contain dots, plugin ids may not.
 */
use std::fmt;

use devconnect_core::types::ServiceId;

use crate::error::{Error, Result};

/// Separator between the parts of a composite id
pub const SEPARATOR: char = '.';

/// A parsed composite service id
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceAddress {
    /// Device id local to the plugin, `None` for the plugin itself
    pub device: Option<ServiceId>,
    /// Plugin id
    pub plugin_id: String,
}

impl ServiceAddress {
    /// Address a device of a plugin
    pub fn device<D: Into<ServiceId>, P: AsRef<str>>(device: D, plugin_id: P) -> Self {
        Self {
            device: Some(device.into()),
            plugin_id: plugin_id.as_ref().to_string(),
        }
    }

    /// Address a plugin
    pub fn plugin<P: AsRef<str>>(plugin_id: P) -> Self {
        Self {
            device: None,
            plugin_id: plugin_id.as_ref().to_string(),
        }
    }

    /// Parse a composite id issued under `domain`
    pub fn parse(composite: &str, domain: &str) -> Result<Self> {
        if composite.is_empty() {
            return Err(Error::EmptyServiceId);
        }
        let local = strip_suffix_ignore_case(composite, domain)
            .and_then(|rest| rest.strip_suffix(SEPARATOR))
            .filter(|rest| !rest.is_empty())
            .ok_or_else(|| Error::invalid_service_id(composite))?;

        match local.rsplit_once(SEPARATOR) {
            Some((device, plugin_id)) if !device.is_empty() && !plugin_id.is_empty() => {
                Ok(Self::device(device, plugin_id))
            }
            Some(_) => Err(Error::invalid_service_id(composite)),
            None => Ok(Self::plugin(local)),
        }
    }

    /// The composite id under `domain`
    pub fn compose(&self, domain: &str) -> ServiceId {
        match &self.device {
            Some(device) => ServiceId::new(format!(
                "{}{sep}{}{sep}{}",
                device,
                self.plugin_id,
                domain,
                sep = SEPARATOR
            )),
            None => ServiceId::new(format!("{}{}{}", self.plugin_id, SEPARATOR, domain)),
        }
    }
}

impl fmt::Display for ServiceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.device {
            Some(device) => write!(f, "{}@{}", device, self.plugin_id),
            None => write!(f, "@{}", self.plugin_id),
        }
    }
}

fn strip_suffix_ignore_case<'a>(s: &'a str, suffix: &str) -> Option<&'a str> {
    let split = s.len().checked_sub(suffix.len())?;
    if !s.is_char_boundary(split) {
        return None;
    }
    let (head, tail) = s.split_at(split);
    tail.eq_ignore_ascii_case(suffix).then_some(head)
}

/// Whether `id` can be used as a plugin id
pub fn is_valid_plugin_id(id: &str) -> bool {
    !id.is_empty() && !id.contains(SEPARATOR)
}

/*!
 * Logging functionality for Device Connect.
 *
 * This module provides tracing setup and span helpers so plugins, the
 * manager and request handling log with the same structure.
 */
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

/// Initialize the logging system with default configuration
pub fn init() -> Result<()> {
    init_with_filter("info")
}

/// Initialize the logging system with a specific filter
///
/// # Arguments
///
/// * `filter` - The log filter string (e.g., "info", "debug", "devconnect_devices=trace")
pub fn init_with_filter(filter: &str) -> Result<()> {
    install(filter, false)
}

/// Initialize the logging system from configuration
pub fn init_from_config(config: &LoggingConfig) -> Result<()> {
    install(&config.level, config.json_format)
}

fn install(filter: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    let json_layer = json.then(|| fmt::layer().json().with_current_span(true));
    let text_layer = (!json).then(|| fmt::layer().with_target(true));

    tracing_subscriber::registry()
        .with(json_layer)
        .with(text_layer)
        .with(filter)
        .try_init()
        .map_err(|e| Error::runtime(format!("Failed to initialize logging: {}", e)))?;

    Ok(())
}

/// A type alias for a tracing span
pub type Span = tracing::Span;

/// Create a new span for a component
///
/// # Arguments
///
/// * `name` - The name of the component
/// * `id` - An optional ID for the component instance
pub fn component_span(name: &str, id: Option<&str>) -> Span {
    match id {
        Some(id) => tracing::info_span!("component", name = %name, id = %id),
        None => tracing::info_span!("component", name = %name),
    }
}

/// Create a new span for an operation
///
/// # Arguments
///
/// * `name` - The name of the operation
/// * `component` - The component performing the operation
pub fn operation_span(name: &str, component: &str) -> Span {
    tracing::info_span!("operation", name = %name, component = %component)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init() {
        // A second initialization in the same process fails, which is fine here
        let _ = init();
        assert!(init_with_filter("debug").is_err());
    }

    #[test]
    fn test_spans_without_subscriber() {
        let span = component_span("plugin", Some("hue"));
        let _guard = span.enter();
        let op = operation_span("GET /light", "hue");
        drop(op);
    }
}

/*!
 * Device Connect Devices
 *
 * This crate provides the plugin side of the Device Connect system: the
 * device registry, request dispatch, event listener fan-out and
 * asynchronous response correlation, plus the bundled device drivers.
 */

#![warn(missing_docs)]

// Re-export core types
pub use devconnect_core::prelude;

pub mod correlator;
pub mod device;
pub mod devices;
pub mod discovery;
pub mod dispatcher;
pub mod listener;
pub mod plugin;
pub mod profile;
pub mod registry;
pub mod store;
pub mod stream;
pub mod transport;

pub use correlator::{Correlator, RequestId};
pub use device::{ConnectionState, DeviceDriver, DeviceError, DeviceInfo, ErrorKind};
pub use discovery::{DeviceDiscoverer, DeviceDiscovery, DiscoveryOptions};
pub use listener::{ChannelListener, EventListener, SubscriptionId};
pub use plugin::{Plugin, PluginBuilder, PluginInfo};
pub use profile::{OperationKind, ProfileSet};
pub use registry::{DeviceRegistry, UpsertOutcome};
pub use store::{DeviceStore, JsonFileStore, MemoryStore};
pub use transport::{ChannelTransport, Frame, FramePayload, Inbound, Transport};

/// Device Connect devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the device system
pub fn init() -> Result<(), devconnect_core::error::Error> {
    tracing::info!("Device Connect Devices {} initialized", VERSION);
    Ok(())
}

/// Profiles served by the bundled drivers
pub fn bundled_profiles() -> ProfileSet {
    ProfileSet::new()
        .merge(devices::light::profiles())
        .merge(devices::drive::profiles())
        .merge(devices::human_detect::profiles())
}

/*!
 * Device discovery.
 *
 * Discovery providers scan a vendor medium (Bluetooth, USB, a bridge's REST
 * API) and report each device they find together with a ready driver and
 * transport. The [`DeviceDiscoverer`] fans a scan out over every provider
 * and merges the results into one channel.
 */
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::device::{DeviceDriver, DeviceError, DeviceInfo, Result};
use crate::transport::Transport;

/// Discovery options
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// How long a scan may run
    pub timeout: Duration,
    /// Stop after the first device
    pub first_only: bool,
    /// Only report devices of this type
    pub device_type_filter: Option<String>,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            first_only: false,
            device_type_filter: None,
        }
    }
}

impl DiscoveryOptions {
    /// Options with the given scan timeout
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }
}

/// A device found by a scan
pub struct Discovered {
    /// Descriptive info
    pub info: DeviceInfo,
    /// Vendor handle
    pub driver: Box<dyn DeviceDriver>,
    /// Link to the device
    pub transport: Arc<dyn Transport>,
}

impl Debug for Discovered {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Discovered")
            .field("info", &self.info)
            .field("driver", &self.driver.driver_name())
            .field("transport", &self.transport.name())
            .finish()
    }
}

/// Device discovery provider
#[async_trait]
pub trait DeviceDiscovery: Send + Sync + Debug {
    /// Provider name
    fn name(&self) -> &str;

    /// Start a scan; found devices arrive on the returned channel, which
    /// closes when the scan is over
    async fn discover(&self, options: DiscoveryOptions) -> Result<mpsc::Receiver<Discovered>>;
}

/// Builds the driver and transport of a statically known device
pub type DeviceFactory = Arc<dyn Fn() -> Discovered + Send + Sync>;

/// A provider reporting a fixed set of devices, such as lights configured
/// on a bridge or devices paired ahead of time
#[derive(Clone)]
pub struct StaticDiscovery {
    name: String,
    factories: Vec<DeviceFactory>,
}

impl Debug for StaticDiscovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticDiscovery")
            .field("name", &self.name)
            .field("devices", &self.factories.len())
            .finish()
    }
}

impl StaticDiscovery {
    /// Create an empty provider
    pub fn new<S: AsRef<str>>(name: S) -> Self {
        Self {
            name: name.as_ref().to_string(),
            factories: Vec::new(),
        }
    }

    /// Add a device
    pub fn with_device<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Discovered + Send + Sync + 'static,
    {
        self.factories.push(Arc::new(factory));
        self
    }
}

#[async_trait]
impl DeviceDiscovery for StaticDiscovery {
    fn name(&self) -> &str {
        &self.name
    }

    async fn discover(&self, _options: DiscoveryOptions) -> Result<mpsc::Receiver<Discovered>> {
        let (tx, rx) = mpsc::channel(self.factories.len().max(1));
        for factory in &self.factories {
            if tx.send(factory()).await.is_err() {
                break;
            }
        }
        Ok(rx)
    }
}

/// Aggregates discovery providers
#[derive(Debug, Default)]
pub struct DeviceDiscoverer {
    providers: Vec<Arc<dyn DeviceDiscovery>>,
}

impl DeviceDiscoverer {
    /// Create a discoverer without providers
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a discovery provider
    pub fn register_provider<D: DeviceDiscovery + 'static>(&mut self, provider: D) {
        self.providers.push(Arc::new(provider));
    }

    /// Registered providers
    pub fn providers(&self) -> &[Arc<dyn DeviceDiscovery>] {
        &self.providers
    }

    /// Scan with every provider
    ///
    /// Results are filtered by device type and merged; the channel closes
    /// once every provider has finished.
    pub async fn discover(&self, options: DiscoveryOptions) -> Result<mpsc::Receiver<Discovered>> {
        if self.providers.is_empty() {
            return Err(DeviceError::unknown("No discovery providers registered"));
        }

        let (tx, rx) = mpsc::channel(100);
        for provider in self.providers.iter().cloned() {
            let options = options.clone();
            let tx = tx.clone();

            tokio::spawn(async move {
                debug!("Starting discovery with provider {}", provider.name());
                match provider.discover(options.clone()).await {
                    Ok(mut receiver) => {
                        while let Some(found) = receiver.recv().await {
                            if let Some(ref filter) = options.device_type_filter {
                                if !found.info.device_type.eq_ignore_ascii_case(filter) {
                                    continue;
                                }
                            }
                            if tx.send(found).await.is_err() {
                                break;
                            }
                            if options.first_only {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        error!("Error in discovery provider {}: {}", provider.name(), e);
                    }
                }
                debug!("Discovery with provider {} completed", provider.name());
            });
        }

        Ok(rx)
    }
}

/*!
 * Device registry.
 *
 * Per-plugin map of known devices keyed by service id. Each entry owns the
 * device's vendor handle behind its own async lock, so commands to one
 * device are serialized while different devices proceed independently.
 * Map mutations go through a single registry-wide lock.
 */
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use serde::Serialize;
use tokio::sync::{broadcast, Mutex, MutexGuard};
use tracing::{debug, info};

use devconnect_core::types::ServiceId;

use crate::device::{ConnectionState, DeviceDriver, DeviceError, DeviceInfo, Result};
use crate::transport::Transport;

/// Event types for device registry
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A device was added to the registry
    DeviceAdded(DeviceInfo),
    /// A device's info changed
    DeviceUpdated(DeviceInfo),
    /// A device was removed from the registry
    DeviceRemoved(ServiceId),
    /// A device connection state changed
    StateChanged {
        /// The device ID
        id: ServiceId,
        /// The old state
        old_state: ConnectionState,
        /// The new state
        new_state: ConnectionState,
    },
}

/// What an upsert did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// A new entry was created
    Inserted,
    /// An existing entry got new info
    Updated,
    /// The entry already had identical info
    Unchanged,
}

/// Notified synchronously after a device leaves the registry
pub trait RemovalHook: Send + Sync {
    /// Release everything held for the device
    fn on_device_removed(&self, id: &ServiceId);
}

/// Snapshot of one entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStatus {
    /// Device info
    pub info: DeviceInfo,
    /// Connection state
    pub state: ConnectionState,
}

/// One registry entry
#[derive(Debug)]
pub struct DeviceSlot {
    id: ServiceId,
    info: RwLock<DeviceInfo>,
    state: RwLock<ConnectionState>,
    driver: Mutex<Option<Box<dyn DeviceDriver>>>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
}

impl DeviceSlot {
    fn new(info: DeviceInfo) -> Self {
        Self {
            id: info.id.clone(),
            info: RwLock::new(info),
            state: RwLock::new(ConnectionState::Offline),
            driver: Mutex::new(None),
            transport: RwLock::new(None),
        }
    }

    /// The device id
    pub fn id(&self) -> &ServiceId {
        &self.id
    }

    /// Current info
    pub fn info(&self) -> DeviceInfo {
        self.info.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the device can take commands
    pub fn is_online(&self) -> bool {
        self.state() == ConnectionState::Online
    }

    /// The transport, if one is attached
    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Lock the vendor handle
    ///
    /// Holding the guard serializes every command and state change issued
    /// to this device.
    pub async fn lock_driver(&self) -> MutexGuard<'_, Option<Box<dyn DeviceDriver>>> {
        self.driver.lock().await
    }

    fn status(&self) -> DeviceStatus {
        DeviceStatus {
            info: self.info(),
            state: self.state(),
        }
    }
}

/// Device registry
#[derive(Debug)]
pub struct DeviceRegistry {
    /// The registered devices
    devices: RwLock<HashMap<ServiceId, Arc<DeviceSlot>>>,
    /// Event sender for registry events
    event_sender: broadcast::Sender<RegistryEvent>,
    /// Hooks run after a removal
    removal_hooks: RwLock<Vec<Weak<dyn RemovalHook>>>,
}

impl DeviceRegistry {
    /// Create a new device registry
    pub fn new() -> Self {
        let (event_sender, _) = broadcast::channel(100);
        Self {
            devices: RwLock::new(HashMap::new()),
            event_sender,
            removal_hooks: RwLock::new(Vec::new()),
        }
    }

    /// Register a hook run after every removal
    pub fn add_removal_hook(&self, hook: Weak<dyn RemovalHook>) {
        self.removal_hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(hook);
    }

    /// Insert or update a device
    ///
    /// Updating never touches the driver, transport, state or any listener
    /// subscriptions held elsewhere for the device.
    pub fn upsert(&self, info: DeviceInfo) -> Result<UpsertOutcome> {
        if info.id.is_empty() {
            return Err(DeviceError::EmptyServiceId);
        }

        let mut devices = self.devices.write().map_err(|_| {
            DeviceError::unknown("Failed to acquire write lock on device registry")
        })?;

        let outcome = match devices.get(&info.id) {
            Some(slot) => {
                let mut current = slot.info.write().unwrap_or_else(PoisonError::into_inner);
                if *current == info {
                    UpsertOutcome::Unchanged
                } else {
                    *current = info.clone();
                    UpsertOutcome::Updated
                }
            }
            None => {
                devices.insert(info.id.clone(), Arc::new(DeviceSlot::new(info.clone())));
                UpsertOutcome::Inserted
            }
        };
        drop(devices);

        match outcome {
            UpsertOutcome::Inserted => {
                debug!("Registered device with ID {}", info.id);
                let _ = self.event_sender.send(RegistryEvent::DeviceAdded(info));
            }
            UpsertOutcome::Updated => {
                debug!("Updated device with ID {}", info.id);
                let _ = self.event_sender.send(RegistryEvent::DeviceUpdated(info));
            }
            UpsertOutcome::Unchanged => {}
        }

        Ok(outcome)
    }

    /// Get a device by ID
    pub fn find(&self, id: &ServiceId) -> Result<Arc<DeviceSlot>> {
        let devices = self.devices.read().map_err(|_| {
            DeviceError::unknown("Failed to acquire read lock on device registry")
        })?;

        devices
            .get(id)
            .cloned()
            .ok_or_else(|| DeviceError::not_found(id))
    }

    /// Whether a device is registered
    pub fn contains(&self, id: &ServiceId) -> bool {
        self.find(id).is_ok()
    }

    /// Remove a device and run the removal hooks
    pub fn remove(&self, id: &ServiceId) -> Result<DeviceInfo> {
        let slot = {
            let mut devices = self.devices.write().map_err(|_| {
                DeviceError::unknown("Failed to acquire write lock on device registry")
            })?;
            devices.remove(id).ok_or_else(|| DeviceError::not_found(id))?
        };

        let hooks: Vec<Arc<dyn RemovalHook>> = self
            .removal_hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for hook in hooks {
            hook.on_device_removed(id);
        }

        let _ = self.event_sender.send(RegistryEvent::DeviceRemoved(id.clone()));
        info!("Removed device with ID {}", id);

        Ok(slot.info())
    }

    /// Install the vendor handle and transport of a registered device
    pub async fn attach(
        &self,
        id: &ServiceId,
        driver: Box<dyn DeviceDriver>,
        transport: Arc<dyn Transport>,
    ) -> Result<()> {
        let slot = self.find(id)?;
        debug!(
            "Attaching driver {} over {} to device {}",
            driver.driver_name(),
            transport.name(),
            id
        );
        *slot.lock_driver().await = Some(driver);
        *slot.transport.write().unwrap_or_else(PoisonError::into_inner) = Some(transport);
        Ok(())
    }

    /// Record a connection state transition, returning the previous state
    pub fn set_state(&self, id: &ServiceId, new_state: ConnectionState) -> Result<ConnectionState> {
        let devices = self.devices.write().map_err(|_| {
            DeviceError::unknown("Failed to acquire write lock on device registry")
        })?;
        let slot = devices.get(id).ok_or_else(|| DeviceError::not_found(id))?;

        let old_state = {
            let mut state = slot.state.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *state, new_state)
        };
        drop(devices);

        if old_state != new_state {
            debug!("Device {} state {:?} -> {:?}", id, old_state, new_state);
            let _ = self.event_sender.send(RegistryEvent::StateChanged {
                id: id.clone(),
                old_state,
                new_state,
            });
        }
        Ok(old_state)
    }

    /// Snapshot of all devices, ordered by id
    pub fn list(&self) -> Result<Vec<DeviceStatus>> {
        let devices = self.devices.read().map_err(|_| {
            DeviceError::unknown("Failed to acquire read lock on device registry")
        })?;

        let mut list: Vec<DeviceStatus> = devices.values().map(|slot| slot.status()).collect();
        list.sort_by(|a, b| a.info.id.cmp(&b.info.id));
        Ok(list)
    }

    /// Get all device IDs
    pub fn ids(&self) -> Result<Vec<ServiceId>> {
        let devices = self.devices.read().map_err(|_| {
            DeviceError::unknown("Failed to acquire read lock on device registry")
        })?;

        Ok(devices.keys().cloned().collect())
    }

    /// Number of registered devices
    pub fn len(&self) -> usize {
        self.devices.read().map(|d| d.len()).unwrap_or(0)
    }

    /// Whether no device is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/*!
 * Persistence of known devices.
 *
 * Plugins remember the devices they have seen so a restart can repopulate
 * the registry before any scan runs. Only descriptive info is stored; the
 * driver and transport are rebuilt when the device is found again.
 */
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use devconnect_core::types::ServiceId;

use crate::device::{DeviceError, DeviceInfo, Result};

/// Storage for device info
#[async_trait]
pub trait DeviceStore: Send + Sync + Debug {
    /// Every stored device
    async fn load_devices(&self) -> Result<Vec<DeviceInfo>>;

    /// Insert or replace a device
    async fn save_device(&self, info: &DeviceInfo) -> Result<()>;

    /// Forget a device; unknown ids are ignored
    async fn delete_device(&self, id: &ServiceId) -> Result<()>;
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    devices: Mutex<BTreeMap<ServiceId, DeviceInfo>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored devices
    pub fn len(&self) -> usize {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn load_devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self
            .devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect())
    }

    async fn save_device(&self, info: &DeviceInfo) -> Result<()> {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(info.id.clone(), info.clone());
        Ok(())
    }

    async fn delete_device(&self, id: &ServiceId) -> Result<()> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner).remove(id);
        Ok(())
    }
}

/// Store keeping devices in a JSON file
///
/// The whole file is rewritten on every change.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    devices: tokio::sync::Mutex<Option<BTreeMap<ServiceId, DeviceInfo>>>,
}

impl JsonFileStore {
    /// Create a store backed by `path`; the file is created on first save
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            devices: tokio::sync::Mutex::new(None),
        }
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_file(&self) -> Result<BTreeMap<ServiceId, DeviceInfo>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) if text.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(text) => {
                let list: Vec<DeviceInfo> = serde_json::from_str(&text)?;
                Ok(list.into_iter().map(|info| (info.id.clone(), info)).collect())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(DeviceError::unknown(format!(
                "Failed to read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    async fn write_file(&self, devices: &BTreeMap<ServiceId, DeviceInfo>) -> Result<()> {
        let list: Vec<&DeviceInfo> = devices.values().collect();
        let text = serde_json::to_string_pretty(&list)?;
        tokio::fs::write(&self.path, text).await.map_err(|e| {
            DeviceError::unknown(format!("Failed to write {}: {}", self.path.display(), e))
        })?;
        debug!("Stored {} devices in {}", list.len(), self.path.display());
        Ok(())
    }

    async fn modify<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut BTreeMap<ServiceId, DeviceInfo>) + Send,
    {
        let mut cache = self.devices.lock().await;
        if cache.is_none() {
            *cache = Some(self.read_file().await?);
        }
        if let Some(devices) = cache.as_mut() {
            change(devices);
            self.write_file(devices).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceStore for JsonFileStore {
    async fn load_devices(&self) -> Result<Vec<DeviceInfo>> {
        let mut cache = self.devices.lock().await;
        let devices = self.read_file().await?;
        let list = devices.values().cloned().collect();
        *cache = Some(devices);
        Ok(list)
    }

    async fn save_device(&self, info: &DeviceInfo) -> Result<()> {
        let info = info.clone();
        self.modify(move |devices| {
            devices.insert(info.id.clone(), info);
        })
        .await
    }

    async fn delete_device(&self, id: &ServiceId) -> Result<()> {
        self.modify(|devices| {
            devices.remove(id);
        })
        .await
    }
}

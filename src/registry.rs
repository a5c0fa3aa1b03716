//! Device registry and shadow store boundary.
//!
//! The agent does not own device state. Models, connections, devices and
//! their point shadows live in a host-provided cache; this module defines the
//! traits the handlers and reporter call through, plus an in-memory
//! implementation used by the headless binary and the tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// A single point definition on a model. Fields are driver-specific.
pub type Point = Map<String, Value>;

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    #[serde(default)]
    pub model_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub connection_key: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceModel {
    pub name: String,
    #[serde(default)]
    pub model_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub device_points: Vec<Point>,
    #[serde(default)]
    pub devices: Vec<Device>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One point value to write to a device.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PointData {
    pub point_name: String,
    pub value: Value,
}

/// Last known point values of a device.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceShadow {
    pub id: String,
    pub online: bool,
    pub points: BTreeMap<String, Value>,
    pub updated_at: u64,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("device '{0}' not found")]
    DeviceNotFound(String),

    #[error("model '{0}' not found")]
    ModelNotFound(String),

    #[error("connection '{0}' not found")]
    ConnectionNotFound(String),

    #[error("invalid registry entry: {0}")]
    Invalid(String),
}

/// Host registry of models, connections and devices.
pub trait DeviceRegistry: Send + Sync {
    fn devices(&self) -> Vec<Device>;
    fn device(&self, id: &str) -> Option<Device>;
    fn model(&self, name: &str) -> Option<DeviceModel>;
    fn connection(&self, key: &str) -> Option<Value>;
    /// Name of the plugin that owns a connection.
    fn connection_plugin(&self, key: &str) -> Option<String>;

    fn add_model(&self, plugin: &str, model: DeviceModel) -> Result<(), RegistryError>;
    fn add_connection(&self, plugin: &str, key: &str, connection: Value)
        -> Result<(), RegistryError>;
    fn add_or_update_device(&self, device: Device) -> Result<(), RegistryError>;
    fn remove_devices(&self, ids: &[String]) -> Result<(), RegistryError>;
    fn write_points(&self, id: &str, points: Vec<PointData>) -> Result<(), RegistryError>;
    /// Restarts driver plugins so registry changes take effect.
    fn reload_plugins(&self);

    fn device_ids(&self) -> Vec<String> {
        self.devices().into_iter().map(|device| device.id).collect()
    }
}

pub trait ShadowStore: Send + Sync {
    fn shadow(&self, id: &str) -> Option<DeviceShadow>;
}

#[derive(Default)]
struct MemoryState {
    models: BTreeMap<String, (String, DeviceModel)>,
    connections: BTreeMap<String, (String, Value)>,
    devices: BTreeMap<String, Device>,
    shadows: HashMap<String, DeviceShadow>,
    reloads: usize,
}

/// Process-local registry and shadow store.
///
/// Point writes are applied directly to the device shadow.
#[derive(Default)]
pub struct MemoryRegistry {
    state: RwLock<MemoryState>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of plugin reloads requested so far.
    pub fn reload_count(&self) -> usize {
        self.read(|state| state.reloads)
    }

    fn read<T>(&self, f: impl FnOnce(&MemoryState) -> T) -> T {
        let guard = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    fn write<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> T {
        let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

impl DeviceRegistry for MemoryRegistry {
    fn devices(&self) -> Vec<Device> {
        self.read(|state| state.devices.values().cloned().collect())
    }

    fn device(&self, id: &str) -> Option<Device> {
        self.read(|state| state.devices.get(id).cloned())
    }

    fn model(&self, name: &str) -> Option<DeviceModel> {
        self.read(|state| state.models.get(name).map(|(_, model)| model.clone()))
    }

    fn connection(&self, key: &str) -> Option<Value> {
        self.read(|state| state.connections.get(key).map(|(_, conn)| conn.clone()))
    }

    fn connection_plugin(&self, key: &str) -> Option<String> {
        self.read(|state| state.connections.get(key).map(|(plugin, _)| plugin.clone()))
    }

    fn add_model(&self, plugin: &str, model: DeviceModel) -> Result<(), RegistryError> {
        if model.name.is_empty() {
            return Err(RegistryError::Invalid("model name is empty".to_string()));
        }
        self.write(|state| {
            for device in &model.devices {
                state.devices.insert(device.id.clone(), device.clone());
            }
            state
                .models
                .insert(model.name.clone(), (plugin.to_string(), model));
        });
        Ok(())
    }

    fn add_connection(
        &self,
        plugin: &str,
        key: &str,
        connection: Value,
    ) -> Result<(), RegistryError> {
        if key.is_empty() {
            return Err(RegistryError::Invalid("connection key is empty".to_string()));
        }
        self.write(|state| {
            state
                .connections
                .insert(key.to_string(), (plugin.to_string(), connection));
        });
        Ok(())
    }

    fn add_or_update_device(&self, device: Device) -> Result<(), RegistryError> {
        if device.id.is_empty() {
            return Err(RegistryError::Invalid("device id is empty".to_string()));
        }
        self.write(|state| {
            if !state.models.contains_key(&device.model_name) {
                return Err(RegistryError::ModelNotFound(device.model_name.clone()));
            }
            state.devices.insert(device.id.clone(), device);
            Ok(())
        })
    }

    fn remove_devices(&self, ids: &[String]) -> Result<(), RegistryError> {
        self.write(|state| {
            for id in ids {
                state.devices.remove(id);
                state.shadows.remove(id);
            }
        });
        Ok(())
    }

    fn write_points(&self, id: &str, points: Vec<PointData>) -> Result<(), RegistryError> {
        self.write(|state| {
            if !state.devices.contains_key(id) {
                return Err(RegistryError::DeviceNotFound(id.to_string()));
            }
            let shadow = state
                .shadows
                .entry(id.to_string())
                .or_insert_with(|| DeviceShadow {
                    id: id.to_string(),
                    ..DeviceShadow::default()
                });
            for point in points {
                shadow.points.insert(point.point_name, point.value);
            }
            shadow.online = true;
            shadow.updated_at = unix_millis();
            Ok(())
        })
    }

    fn reload_plugins(&self) {
        self.write(|state| state.reloads += 1);
    }
}

impl ShadowStore for MemoryRegistry {
    fn shadow(&self, id: &str) -> Option<DeviceShadow> {
        self.read(|state| state.shadows.get(id).cloned())
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

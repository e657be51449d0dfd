//! Device registry.
//!
//! The map of devices is written only by [`DeviceRegistry::register`]. Each device
//! keeps its own status lock and its own send lane, so updating one device never
//! blocks a dispatch to another.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, info};

use crate::device::transport::TransportKind;
use crate::sync::report::AttemptOutcome;

/// Advisory reachability state. Never used to skip a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceState {
    Connected,
    Unreachable,
    Unknown,
}

/// Static description of a target device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub transport: TransportKind,
    /// `host:port` of the device agent.
    pub address: String,
}

impl Device {
    pub fn new(id: impl Into<String>, transport: TransportKind, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            transport,
            address: address.into(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct DeviceStatus {
    state: DeviceState,
    last_seen: Option<DateTime<Utc>>,
}

/// A registered device with its mutable status.
#[derive(Debug)]
pub struct DeviceHandle {
    device: Device,
    status: Mutex<DeviceStatus>,
    lane: tokio::sync::Mutex<()>,
}

impl DeviceHandle {
    fn new(device: Device) -> Self {
        Self {
            device,
            status: Mutex::new(DeviceStatus {
                state: DeviceState::Unknown,
                last_seen: None,
            }),
            lane: tokio::sync::Mutex::new(()),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn id(&self) -> &str {
        &self.device.id
    }

    pub fn state(&self) -> DeviceState {
        self.status.lock().unwrap().state
    }

    /// Serializes directives to this device in the order their dispatches reach it.
    pub fn lane(&self) -> &tokio::sync::Mutex<()> {
        &self.lane
    }

    fn record(&self, outcome: &AttemptOutcome) -> DeviceState {
        let mut status = self.status.lock().unwrap();
        let previous = status.state;
        if outcome.is_ok() {
            status.state = DeviceState::Connected;
            status.last_seen = Some(Utc::now());
        } else {
            status.state = DeviceState::Unreachable;
        }

        if previous != status.state {
            info!(device = %self.device.id, from = ?previous, to = ?status.state, "Device state changed");
        }
        status.state
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        let status = *self.status.lock().unwrap();
        DeviceSnapshot {
            id: self.device.id.clone(),
            transport: self.device.transport,
            address: self.device.address.clone(),
            state: status.state,
            last_seen: status.last_seen,
        }
    }
}

/// Point-in-time view of a device, for listing and reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSnapshot {
    pub id: String,
    pub transport: TransportKind,
    pub address: String,
    pub state: DeviceState,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Device '{0}' is already registered")]
    Duplicate(String),
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: RwLock<Vec<Arc<DeviceHandle>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, device: Device) -> Result<Arc<DeviceHandle>, RegistryError> {
        let mut devices = self.devices.write().unwrap();
        if devices.iter().any(|d| d.id() == device.id) {
            return Err(RegistryError::Duplicate(device.id));
        }
        debug!(device = %device.id, address = %device.address, transport = %device.transport, "Registered device");
        let handle = Arc::new(DeviceHandle::new(device));
        devices.push(Arc::clone(&handle));
        Ok(handle)
    }

    /// Snapshots of every device, in registration order.
    pub fn list(&self) -> Vec<DeviceSnapshot> {
        self.devices.read().unwrap().iter().map(|d| d.snapshot()).collect()
    }

    pub fn handles(&self) -> Vec<Arc<DeviceHandle>> {
        self.devices.read().unwrap().clone()
    }

    pub fn get(&self, id: &str) -> Option<Arc<DeviceHandle>> {
        self.devices.read().unwrap().iter().find(|d| d.id() == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.devices.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record the outcome of an attempt. Returns the new state, or `None` for an
    /// unknown device id.
    pub fn mark_result(&self, device_id: &str, outcome: &AttemptOutcome) -> Option<DeviceState> {
        self.get(device_id).map(|handle| handle.record(outcome))
    }
}

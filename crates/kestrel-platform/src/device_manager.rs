//! Activation of the requested compute devices.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use kestrel_core::{DeviceKind, EngineError, Result};

use crate::probe::{Capabilities, CapabilitySnapshot};

/// One entry of the requested device list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(rename = "type")]
    pub kind: DeviceKind,
    /// Cap on live bytes handed out for this device; 0 means unlimited.
    #[serde(default)]
    pub memory_budget_mb: usize,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl DeviceConfig {
    pub fn new(kind: DeviceKind) -> Self {
        Self { kind, memory_budget_mb: 0, enabled: true }
    }

    pub fn with_budget_mb(mut self, mb: usize) -> Self {
        self.memory_budget_mb = mb;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Budget in bytes, `None` if unlimited.
    pub fn budget_bytes(&self) -> Option<usize> {
        (self.memory_budget_mb > 0).then(|| self.memory_budget_mb * 1024 * 1024)
    }
}

/// An activated compute device.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    capabilities: Capabilities,
}

impl Device {
    pub fn kind(&self) -> DeviceKind {
        self.capabilities.kind()
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }
}

/// Owns the list of active devices.
#[derive(Debug, Default)]
pub struct DeviceManager {
    devices: Vec<Device>,
    initialized: bool,
}

impl DeviceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Activate every requested, enabled device the snapshot says is usable.
    pub fn initialize(&mut self, requested: &[DeviceConfig], snapshot: &CapabilitySnapshot) -> Result<()> {
        if self.initialized {
            return Err(EngineError::AlreadyInitialized { component: "device manager" });
        }

        let mut devices: Vec<Device> = Vec::new();
        for request in requested.iter().filter(|r| r.enabled) {
            if devices.iter().any(|d| d.kind() == request.kind) {
                continue;
            }
            let Some(capabilities) = snapshot.capabilities(request.kind) else {
                warn!(device = %request.kind, "not a compute device, skipping");
                continue;
            };
            if !capabilities.is_usable() {
                warn!(device = %request.kind, "requested but not available, skipping");
                continue;
            }
            info!(device = %request.kind, "device activated");
            devices.push(Device { capabilities });
        }

        if devices.is_empty() {
            return Err(EngineError::NoActiveDevices);
        }
        self.devices = devices;
        self.initialized = true;
        Ok(())
    }

    /// Drop all active devices. Safe to call repeatedly.
    pub fn shutdown(&mut self) {
        if self.initialized {
            info!(count = self.devices.len(), "device manager shut down");
        }
        self.devices.clear();
        self.initialized = false;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn active_devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn active_kinds(&self) -> Vec<DeviceKind> {
        self.devices.iter().map(Device::kind).collect()
    }

    pub fn is_active(&self, kind: DeviceKind) -> bool {
        self.devices.iter().any(|d| d.kind() == kind)
    }

    pub fn device(&self, kind: DeviceKind) -> Option<&Device> {
        self.devices.iter().find(|d| d.kind() == kind)
    }
}

use std::fmt;

use serde::{Deserialize, Serialize};

/// Compute target on the SoC.
///
/// The discriminants are the device ids written into the model file's
/// tensor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Big.LITTLE CPU cluster
    #[default]
    Cpu,
    /// Vulkan-capable GPU
    Gpu,
    /// NNAPI accelerator
    Npu,
    /// Memory visible to every device; not a compute target
    Shared,
}

impl DeviceKind {
    /// All kinds that can run layers.
    pub const COMPUTE: [DeviceKind; 3] = [DeviceKind::Cpu, DeviceKind::Gpu, DeviceKind::Npu];

    /// Decode a tensor-table device id.
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(DeviceKind::Cpu),
            1 => Some(DeviceKind::Gpu),
            2 => Some(DeviceKind::Npu),
            3 => Some(DeviceKind::Shared),
            _ => None,
        }
    }

    /// Device id as stored in the tensor table.
    pub fn id(&self) -> u8 {
        match self {
            DeviceKind::Cpu => 0,
            DeviceKind::Gpu => 1,
            DeviceKind::Npu => 2,
            DeviceKind::Shared => 3,
        }
    }

    /// Whether this kind can run layers.
    pub fn is_compute(&self) -> bool {
        !matches!(self, DeviceKind::Shared)
    }

    pub fn is_cpu(&self) -> bool {
        matches!(self, DeviceKind::Cpu)
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Cpu => write!(f, "cpu"),
            DeviceKind::Gpu => write!(f, "gpu"),
            DeviceKind::Npu => write!(f, "npu"),
            DeviceKind::Shared => write!(f, "shared"),
        }
    }
}

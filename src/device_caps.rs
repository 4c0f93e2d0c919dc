//! Static device capabilities consumed by the residency and launch layers.

use serde::{Deserialize, Serialize};

/// Capabilities reported once at backend construction.
///
/// The dynamic free/total memory query lives on the backend itself
/// ([`crate::backend::DeviceBackend::mem_info`]) since it changes with every
/// allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    /// Adapter name from the driver.
    pub name: String,
    /// Total device memory in bytes.
    pub total_memory: u64,
    /// Whether host memory can be mapped into the device address space.
    pub can_map_host: bool,
    /// Row alignment requirement for 2D allocations, in bytes.
    pub pitch_alignment: u32,
    /// Whether the device drives a display. Launch batching stays
    /// conservative on display devices to avoid driver timeouts.
    pub display_device: bool,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            name: "unknown".to_string(),
            total_memory: 0,
            can_map_host: false,
            pitch_alignment: 32,
            display_device: false,
        }
    }
}

//! Policy and configuration parameters.
//!
//! The headroom and host-map constants were hard-coded in earlier backends;
//! here they are data so callers (and tests) can tune them per device.

use serde::{Deserialize, Serialize};

/// Residency policy for [`crate::memory::MemoryManager`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryPolicy {
    /// Device memory kept free after working (non-texture) allocations.
    pub working_headroom: u64,
    /// Device memory kept free after texture allocations. Larger than the
    /// working headroom so some space is left once all textures are in.
    pub texture_headroom: u64,
    /// Cap on total host memory mapped into the device address space.
    pub map_host_limit: u64,
}

impl Default for MemoryPolicy {
    fn default() -> Self {
        Self {
            working_headroom: 32 * 1024 * 1024,
            texture_headroom: 128 * 1024 * 1024,
            map_host_limit: 0,
        }
    }
}

/// Host-map limit heuristic: leave at least half of system memory, or 4 GiB,
/// whichever is smaller, free for the rest of the system. Returns 0 (host
/// mapping disabled) when the system memory size is unknown.
pub fn host_map_limit(system_ram: u64) -> u64 {
    const RESERVE: u64 = 4 * 1024 * 1024 * 1024;
    if system_ram == 0 {
        return 0;
    }
    if system_ram / 2 > RESERVE {
        system_ram - RESERVE
    } else {
        system_ram / 2
    }
}

/// Stream pool sizing for [`crate::sched::StreamScheduler`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of asynchronous execution streams (and concurrent workers).
    pub num_streams: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { num_streams: 1 }
    }
}

/// Launch batching for [`crate::launch::LaunchCoordinator`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchConfig {
    /// Samples per path-trace launch on a headless device.
    pub sample_batch_size: u32,
    /// Samples per launch when the device drives a display; smaller to bound
    /// worst-case latency per launch.
    pub interactive_batch_size: u32,
    /// Pixel chunk per shader-eval launch, so cancellation stays responsive.
    pub shader_chunk_size: u32,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            sample_batch_size: 32,
            interactive_batch_size: 8,
            shader_chunk_size: 65536,
        }
    }
}

/// Top-level device configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub memory: MemoryPolicy,
    pub scheduler: SchedulerConfig,
    pub launch: LaunchConfig,
}

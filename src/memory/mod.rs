//! Memory residency tracking and the device memory budget.

pub mod manager;
pub mod types;

pub use manager::MemoryManager;
pub use types::{BufferDesc, BufferId, DeviceBuffer, MemoryKind, MemoryStats, Residency};

//! raydev: GPU device abstraction core for a path-tracing renderer.
//!
//! Owns the pieces between the renderer's scheduler and a compute backend:
//! memory residency and eviction policy, two-level acceleration structure
//! builds, multi-stream kernel launch scheduling, and the multi-stage
//! denoise pipeline. The hardware surface is the [`backend::DeviceBackend`]
//! trait; [`backend::software::SoftwareBackend`] provides a deterministic
//! in-process implementation used by the test suite and as a reference for
//! real backends.

pub mod accel;
pub mod backend;
pub mod config;
pub mod context;
pub mod denoise;
pub mod device_caps;
pub mod error;
pub mod kernel;
pub mod launch;
pub mod memory;
pub mod scene;
pub mod sched;
pub mod task;

pub use accel::{AccelBuilder, TraversableHandle};
pub use backend::{DeviceBackend, DevicePtr, StreamId};
pub use config::{DeviceConfig, LaunchConfig, MemoryPolicy, SchedulerConfig};
pub use context::DeviceContext;
pub use denoise::{DenoisePipeline, DenoiseTask, NlmParams};
pub use device_caps::DeviceCapabilities;
pub use error::{DeviceError, DeviceResult, ErrorState};
pub use kernel::{DeviceKey, KernelFeatures, KernelRequest, KernelSetHandle};
pub use memory::{BufferDesc, BufferId, MemoryManager, MemoryStats, Residency};
pub use scene::{GeometrySnapshot, Mesh, MeshId, ObjectInstance};
pub use task::{DeviceTask, RenderTile, RenderWork, TaskPayload};

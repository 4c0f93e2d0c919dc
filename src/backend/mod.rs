//! Vendor seam: everything the core needs from an accelerator.
//!
//! The scheduling, residency and denoise layers never talk to a vendor API
//! directly; they go through [`DeviceBackend`]. The crate ships one complete
//! implementation, [`software::SoftwareBackend`], a deterministic in-process
//! simulation used by the test suite and as a reference for real backends.

pub mod software;

use bytemuck::{Pod, Zeroable};

use crate::accel::types::{Aabb, InstanceRecord, MotionTransformKey, TraversableHandle};
use crate::device_caps::DeviceCapabilities;
use crate::error::DeviceResult;
use crate::kernel::{KernelRequest, KernelSetHandle};

/// Stable virtual device address.
///
/// Addresses stay valid across residency migrations: when a buffer moves to
/// host-mapped memory the backend rebinds the same address to the new
/// backing, so in-flight references held by kernel parameter blocks remain
/// usable.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    pub const NULL: DevicePtr = DevicePtr(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Address `bytes` past this one. Valid only within one allocation.
    pub fn offset(&self, bytes: u64) -> DevicePtr {
        DevicePtr(self.0 + bytes)
    }
}

/// Index of an asynchronous execution stream. Stream `i` always uses launch
/// parameter slice `i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub usize);

/// Type-erased kernel launch argument.
///
/// Replaces fixed-arity argument setters: a launch takes a slice of
/// descriptors, so there is no ceiling on argument count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelArg {
    Ptr(DevicePtr),
    I32(i32),
    U32(u32),
    F32(f32),
    Int4([i32; 4]),
}

/// Grid/block geometry of one launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchDims {
    pub grid: [u32; 3],
    pub block: [u32; 3],
}

impl LaunchDims {
    /// 1D geometry covering `work_size` items with `block` threads per block.
    pub fn linear(work_size: u32, block: u32) -> Self {
        let blocks = work_size.div_ceil(block.max(1));
        Self {
            grid: [blocks, 1, 1],
            block: [block, 1, 1],
        }
    }

    /// 2D geometry covering a `w` x `h` rectangle.
    pub fn rect(w: u32, h: u32, block_x: u32, block_y: u32) -> Self {
        Self {
            grid: [w.div_ceil(block_x.max(1)), h.div_ceil(block_y.max(1)), 1],
            block: [block_x, block_y, 1],
        }
    }
}

/// Motion options for an acceleration structure build.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionOptions {
    pub num_keys: u32,
    pub time_begin: f32,
    pub time_end: f32,
    /// Whether geometry vanishes outside the time range.
    pub start_vanish: bool,
    pub end_vanish: bool,
}

impl MotionOptions {
    pub fn none() -> Self {
        Self {
            num_keys: 1,
            time_begin: 0.0,
            time_end: 1.0,
            start_vanish: false,
            end_vanish: false,
        }
    }
}

/// Geometry input for one bottom-level build, one entry per motion step.
#[derive(Debug, Clone)]
pub enum BlasGeometry<'a> {
    /// Shared indices, one vertex array per motion step.
    Triangles {
        vertex_steps: &'a [Vec<glam::Vec3>],
        indices: &'a [[u32; 3]],
    },
    /// Pre-inflated per-segment bounds, one array per motion step.
    CurveAabbs { aabb_steps: &'a [Vec<Aabb>] },
}

/// One bottom-level acceleration structure build call.
#[derive(Debug, Clone)]
pub struct BlasBuildInput<'a> {
    pub name: &'a str,
    pub geometry: BlasGeometry<'a>,
    pub motion: MotionOptions,
    /// Curves skip the any-hit test; visibility is checked during
    /// intersection instead.
    pub disable_anyhit: bool,
}

/// A keyed motion transform referenced by an instance in place of its static
/// transform.
#[derive(Debug, Clone)]
pub struct MotionTransformDesc<'a> {
    pub keys: &'a [MotionTransformKey],
    pub time_begin: f32,
    pub time_end: f32,
}

/// Everything the core needs from an accelerator.
///
/// All methods must be callable from multiple worker threads. A real backend
/// maps these onto its vendor API; the error mapping is: allocation failures
/// to `OutOfMemory`, launch/sync failures to `Launch`, acceleration structure
/// build failures to `Build`.
pub trait DeviceBackend: Send + Sync {
    fn capabilities(&self) -> DeviceCapabilities;

    /// Dynamic (free, total) device memory in bytes.
    fn mem_info(&self) -> (u64, u64);

    fn alloc_device(&self, name: &str, size: u64) -> DeviceResult<DevicePtr>;
    fn free_device(&self, ptr: DevicePtr) -> DeviceResult<()>;

    /// Allocate host memory mapped into the device address space.
    fn alloc_host_mapped(&self, name: &str, size: u64) -> DeviceResult<DevicePtr>;
    fn free_host_mapped(&self, ptr: DevicePtr) -> DeviceResult<()>;

    /// Move a device-resident allocation to host-mapped backing, keeping the
    /// published address valid.
    fn migrate_to_host(&self, ptr: DevicePtr) -> DeviceResult<()>;

    fn copy_to_device(&self, ptr: DevicePtr, data: &[u8]) -> DeviceResult<()>;
    fn copy_from_device(&self, ptr: DevicePtr, out: &mut [u8]) -> DeviceResult<()>;
    fn memset_device(&self, ptr: DevicePtr, value: u8, size: u64) -> DeviceResult<()>;

    /// Load (or look up) the compiled kernel set for the requested features.
    fn load_kernels(&self, request: &KernelRequest) -> DeviceResult<KernelSetHandle>;

    /// Occupancy limit for a compute entry point.
    fn max_threads_per_block(&self, entry: &str) -> u32;

    /// Issue one asynchronous kernel launch on a stream.
    fn launch(
        &self,
        stream: StreamId,
        entry: &str,
        dims: LaunchDims,
        args: &[KernelArg],
    ) -> DeviceResult<()>;

    /// Block until all work queued on a stream has completed.
    fn synchronize_stream(&self, stream: StreamId) -> DeviceResult<()>;

    /// Block until all work on the device has completed (null stream).
    fn synchronize(&self) -> DeviceResult<()>;

    fn build_blas(&self, input: &BlasBuildInput<'_>) -> DeviceResult<TraversableHandle>;
    fn build_tlas(&self, instances: &[InstanceRecord]) -> DeviceResult<TraversableHandle>;
    fn build_motion_transform(
        &self,
        desc: &MotionTransformDesc<'_>,
    ) -> DeviceResult<TraversableHandle>;
    fn free_accel(&self, handle: TraversableHandle) -> DeviceResult<()>;
}

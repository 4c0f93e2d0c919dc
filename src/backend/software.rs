//! Deterministic in-process accelerator.
//!
//! Simulates a device with a flat virtual address space and a fixed memory
//! size. Every launch is journaled with its stream, entry point and grid
//! geometry; the NLM denoise kernel family is additionally executed on the
//! CPU so the denoise pipeline produces real output. Acceleration structure
//! builds validate their inputs and hand out handles.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::accel::types::{InstanceRecord, TraversableHandle};
use crate::backend::{
    BlasBuildInput, BlasGeometry, DeviceBackend, DevicePtr, KernelArg, LaunchDims,
    MotionTransformDesc, StreamId,
};
use crate::device_caps::DeviceCapabilities;
use crate::error::{DeviceError, DeviceResult};
use crate::kernel::{self, KernelRequest, KernelSetHandle};

/// Simulated device parameters.
#[derive(Debug, Clone)]
pub struct SoftwareConfig {
    pub name: String,
    pub total_memory: u64,
    pub can_map_host: bool,
    pub pitch_alignment: u32,
    pub display_device: bool,
    pub max_threads_per_block: u32,
}

impl Default for SoftwareConfig {
    fn default() -> Self {
        Self {
            name: "software".to_string(),
            total_memory: 512 * 1024 * 1024,
            can_map_host: true,
            pitch_alignment: 32,
            display_device: false,
            max_threads_per_block: 256,
        }
    }
}

/// One journaled kernel launch.
#[derive(Debug, Clone)]
pub struct LaunchRecord {
    pub stream: usize,
    pub entry: String,
    pub dims: LaunchDims,
    pub args: Vec<KernelArg>,
}

/// One journaled bottom-level build.
#[derive(Debug, Clone)]
pub struct BlasRecord {
    pub name: String,
    pub handle: TraversableHandle,
    pub motion_keys: u32,
    pub disable_anyhit: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location {
    Device,
    HostMapped,
}

struct Region {
    size: u64,
    data: Vec<u8>,
    location: Location,
}

#[derive(Default)]
struct Journal {
    launches: Vec<LaunchRecord>,
    blas_builds: Vec<BlasRecord>,
    tlas_instances: Vec<InstanceRecord>,
    motion_transform_builds: usize,
    kernel_loads: Vec<KernelRequest>,
}

struct State {
    regions: BTreeMap<u64, Region>,
    next_addr: u64,
    device_used: u64,
    host_mapped_used: u64,
    next_handle: u64,
    accels: HashMap<u64, usize>,
    journal: Journal,
    fail_builds: bool,
    fail_launches: bool,
}

pub struct SoftwareBackend {
    config: SoftwareConfig,
    state: Mutex<State>,
}

impl SoftwareBackend {
    pub fn new(config: SoftwareConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State {
                regions: BTreeMap::new(),
                next_addr: 0x1000,
                device_used: 0,
                host_mapped_used: 0,
                next_handle: 1,
                accels: HashMap::new(),
                journal: Journal::default(),
                fail_builds: false,
                fail_launches: false,
            }),
        }
    }

    /// All launches journaled so far, in submission order.
    pub fn launches(&self) -> Vec<LaunchRecord> {
        self.state.lock().unwrap().journal.launches.clone()
    }

    pub fn clear_launches(&self) {
        self.state.lock().unwrap().journal.launches.clear();
    }

    pub fn blas_builds(&self) -> Vec<BlasRecord> {
        self.state.lock().unwrap().journal.blas_builds.clone()
    }

    /// Instance records of the most recent TLAS build.
    pub fn tlas_instances(&self) -> Vec<InstanceRecord> {
        self.state.lock().unwrap().journal.tlas_instances.clone()
    }

    pub fn motion_transform_builds(&self) -> usize {
        self.state.lock().unwrap().journal.motion_transform_builds
    }

    pub fn kernel_load_count(&self) -> usize {
        self.state.lock().unwrap().journal.kernel_loads.len()
    }

    /// Force subsequent acceleration structure builds to fail.
    pub fn set_fail_builds(&self, fail: bool) {
        self.state.lock().unwrap().fail_builds = fail;
    }

    /// Force subsequent launches to fail.
    pub fn set_fail_launches(&self, fail: bool) {
        self.state.lock().unwrap().fail_launches = fail;
    }

    pub fn live_accel_count(&self) -> usize {
        self.state.lock().unwrap().accels.len()
    }

    fn alloc_region(state: &mut State, size: u64, location: Location) -> DevicePtr {
        let base = state.next_addr;
        // Keep allocations apart so out-of-bounds access trips the resolver.
        state.next_addr += size.max(1) + 0x100;
        state.regions.insert(
            base,
            Region {
                size,
                data: vec![0; size as usize],
                location,
            },
        );
        DevicePtr(base)
    }

    fn resolve(state: &State, ptr: DevicePtr) -> DeviceResult<(u64, u64)> {
        let (base, region) = state
            .regions
            .range(..=ptr.0)
            .next_back()
            .ok_or_else(|| DeviceError::launch(format!("unmapped address {:#x}", ptr.0)))?;
        if ptr.0 >= base + region.size {
            return Err(DeviceError::launch(format!(
                "address {:#x} past end of region at {:#x}",
                ptr.0, base
            )));
        }
        Ok((*base, ptr.0 - base))
    }

    fn read_f32(state: &State, ptr: DevicePtr, count: usize) -> DeviceResult<Vec<f32>> {
        let (base, offset) = Self::resolve(state, ptr)?;
        let region = &state.regions[&base];
        let start = offset as usize;
        let end = start + count * 4;
        if end > region.data.len() {
            return Err(DeviceError::launch("read past end of region"));
        }
        let mut out = vec![0.0f32; count];
        for (i, chunk) in region.data[start..end].chunks_exact(4).enumerate() {
            out[i] = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Ok(out)
    }

    fn write_f32(state: &mut State, ptr: DevicePtr, values: &[f32]) -> DeviceResult<()> {
        let (base, offset) = Self::resolve(state, ptr)?;
        let region = state.regions.get_mut(&base).unwrap();
        let start = offset as usize;
        let end = start + values.len() * 4;
        if end > region.data.len() {
            return Err(DeviceError::launch("write past end of region"));
        }
        for (i, v) in values.iter().enumerate() {
            region.data[start + i * 4..start + i * 4 + 4].copy_from_slice(&v.to_le_bytes());
        }
        Ok(())
    }

    /// Execute the NLM kernel family on the CPU. Other entry points are
    /// journal-only.
    fn execute(&self, state: &mut State, entry: &str, args: &[KernelArg]) -> DeviceResult<()> {
        match entry {
            kernel::KERNEL_FILTER_NLM_CALC_DIFFERENCE => nlm_calc_difference(state, args),
            kernel::KERNEL_FILTER_NLM_BLUR => nlm_blur(state, args),
            kernel::KERNEL_FILTER_NLM_CALC_WEIGHT => nlm_calc_weight(state, args),
            kernel::KERNEL_FILTER_NLM_UPDATE_OUTPUT => nlm_update_output(state, args),
            kernel::KERNEL_FILTER_NLM_NORMALIZE => nlm_normalize(state, args),
            _ => Ok(()),
        }
    }
}

impl DeviceBackend for SoftwareBackend {
    fn capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities {
            name: self.config.name.clone(),
            total_memory: self.config.total_memory,
            can_map_host: self.config.can_map_host,
            pitch_alignment: self.config.pitch_alignment,
            display_device: self.config.display_device,
        }
    }

    fn mem_info(&self) -> (u64, u64) {
        let state = self.state.lock().unwrap();
        (
            self.config.total_memory - state.device_used,
            self.config.total_memory,
        )
    }

    fn alloc_device(&self, name: &str, size: u64) -> DeviceResult<DevicePtr> {
        let mut state = self.state.lock().unwrap();
        if state.device_used + size > self.config.total_memory {
            return Err(DeviceError::out_of_memory(format!(
                "device allocation {} of {} bytes exceeds capacity",
                name, size
            )));
        }
        state.device_used += size;
        Ok(Self::alloc_region(&mut state, size, Location::Device))
    }

    fn free_device(&self, ptr: DevicePtr) -> DeviceResult<()> {
        let mut state = self.state.lock().unwrap();
        match state.regions.remove(&ptr.0) {
            Some(region) if region.location == Location::Device => {
                state.device_used -= region.size;
                Ok(())
            }
            Some(_) => Err(DeviceError::launch("freed host-mapped region as device")),
            None => Err(DeviceError::launch(format!(
                "free of unmapped address {:#x}",
                ptr.0
            ))),
        }
    }

    fn alloc_host_mapped(&self, _name: &str, size: u64) -> DeviceResult<DevicePtr> {
        if !self.config.can_map_host {
            return Err(DeviceError::out_of_memory(
                "device cannot map host memory",
            ));
        }
        let mut state = self.state.lock().unwrap();
        state.host_mapped_used += size;
        Ok(Self::alloc_region(&mut state, size, Location::HostMapped))
    }

    fn free_host_mapped(&self, ptr: DevicePtr) -> DeviceResult<()> {
        let mut state = self.state.lock().unwrap();
        match state.regions.remove(&ptr.0) {
            Some(region) if region.location == Location::HostMapped => {
                state.host_mapped_used -= region.size;
                Ok(())
            }
            Some(_) => Err(DeviceError::launch("freed device region as host-mapped")),
            None => Err(DeviceError::launch(format!(
                "free of unmapped address {:#x}",
                ptr.0
            ))),
        }
    }

    fn migrate_to_host(&self, ptr: DevicePtr) -> DeviceResult<()> {
        if !self.config.can_map_host {
            return Err(DeviceError::out_of_memory(
                "device cannot map host memory",
            ));
        }
        let mut state = self.state.lock().unwrap();
        let region = state
            .regions
            .get_mut(&ptr.0)
            .ok_or_else(|| DeviceError::launch("migrate of unmapped address"))?;
        if region.location == Location::Device {
            region.location = Location::HostMapped;
            let size = region.size;
            state.device_used -= size;
            state.host_mapped_used += size;
        }
        Ok(())
    }

    fn copy_to_device(&self, ptr: DevicePtr, data: &[u8]) -> DeviceResult<()> {
        let mut state = self.state.lock().unwrap();
        let (base, offset) = Self::resolve(&state, ptr)?;
        let region = state.regions.get_mut(&base).unwrap();
        let start = offset as usize;
        if start + data.len() > region.data.len() {
            return Err(DeviceError::launch("copy past end of region"));
        }
        region.data[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn copy_from_device(&self, ptr: DevicePtr, out: &mut [u8]) -> DeviceResult<()> {
        let state = self.state.lock().unwrap();
        let (base, offset) = Self::resolve(&state, ptr)?;
        let region = &state.regions[&base];
        let start = offset as usize;
        if start + out.len() > region.data.len() {
            return Err(DeviceError::launch("copy past end of region"));
        }
        out.copy_from_slice(&region.data[start..start + out.len()]);
        Ok(())
    }

    fn memset_device(&self, ptr: DevicePtr, value: u8, size: u64) -> DeviceResult<()> {
        let mut state = self.state.lock().unwrap();
        let (base, offset) = Self::resolve(&state, ptr)?;
        let region = state.regions.get_mut(&base).unwrap();
        let start = offset as usize;
        let end = start + size as usize;
        if end > region.data.len() {
            return Err(DeviceError::launch("memset past end of region"));
        }
        region.data[start..end].fill(value);
        Ok(())
    }

    fn load_kernels(&self, request: &KernelRequest) -> DeviceResult<KernelSetHandle> {
        let groups = request.features.program_groups();
        log::debug!(
            "loading kernel set {} with {} program groups",
            request.features.cache_key(),
            groups.len()
        );
        let mut state = self.state.lock().unwrap();
        state.journal.kernel_loads.push(request.clone());
        let handle = KernelSetHandle(state.next_handle);
        state.next_handle += 1;
        Ok(handle)
    }

    fn max_threads_per_block(&self, _entry: &str) -> u32 {
        self.config.max_threads_per_block
    }

    fn launch(
        &self,
        stream: StreamId,
        entry: &str,
        dims: LaunchDims,
        args: &[KernelArg],
    ) -> DeviceResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_launches {
            return Err(DeviceError::launch(format!("injected failure in {}", entry)));
        }
        state.journal.launches.push(LaunchRecord {
            stream: stream.0,
            entry: entry.to_string(),
            dims,
            args: args.to_vec(),
        });
        self.execute(&mut state, entry, args)
    }

    fn synchronize_stream(&self, _stream: StreamId) -> DeviceResult<()> {
        Ok(())
    }

    fn synchronize(&self) -> DeviceResult<()> {
        Ok(())
    }

    fn build_blas(&self, input: &BlasBuildInput<'_>) -> DeviceResult<TraversableHandle> {
        let mut state = self.state.lock().unwrap();
        if state.fail_builds {
            return Err(DeviceError::build(format!(
                "injected build failure for {}",
                input.name
            )));
        }
        let steps = match &input.geometry {
            BlasGeometry::Triangles {
                vertex_steps,
                indices,
            } => {
                if vertex_steps.is_empty() || indices.is_empty() {
                    return Err(DeviceError::build("empty triangle geometry"));
                }
                vertex_steps.len()
            }
            BlasGeometry::CurveAabbs { aabb_steps } => {
                if aabb_steps.is_empty() || aabb_steps[0].is_empty() {
                    return Err(DeviceError::build("empty curve geometry"));
                }
                aabb_steps.len()
            }
        };
        if steps != input.motion.num_keys as usize {
            return Err(DeviceError::build(format!(
                "{}: {} geometry steps for {} motion keys",
                input.name, steps, input.motion.num_keys
            )));
        }
        let handle = TraversableHandle(state.next_handle);
        state.next_handle += 1;
        state.accels.insert(handle.0, steps);
        state.journal.blas_builds.push(BlasRecord {
            name: input.name.to_string(),
            handle,
            motion_keys: input.motion.num_keys,
            disable_anyhit: input.disable_anyhit,
        });
        Ok(handle)
    }

    fn build_tlas(&self, instances: &[InstanceRecord]) -> DeviceResult<TraversableHandle> {
        let mut state = self.state.lock().unwrap();
        if state.fail_builds {
            return Err(DeviceError::build("injected build failure for top level"));
        }
        for instance in instances {
            if !state.accels.contains_key(&instance.blas.0) {
                return Err(DeviceError::build(format!(
                    "instance {} references unknown bottom-level handle",
                    instance.instance_id
                )));
            }
            if !instance.motion.is_null() && !state.accels.contains_key(&instance.motion.0) {
                return Err(DeviceError::build(format!(
                    "instance {} references unknown motion transform",
                    instance.instance_id
                )));
            }
        }
        let handle = TraversableHandle(state.next_handle);
        state.next_handle += 1;
        state.accels.insert(handle.0, instances.len());
        state.journal.tlas_instances = instances.to_vec();
        Ok(handle)
    }

    fn build_motion_transform(
        &self,
        desc: &MotionTransformDesc<'_>,
    ) -> DeviceResult<TraversableHandle> {
        let mut state = self.state.lock().unwrap();
        if state.fail_builds {
            return Err(DeviceError::build("injected build failure for motion transform"));
        }
        if desc.keys.len() < 2 {
            return Err(DeviceError::build("motion transform needs at least two keys"));
        }
        let handle = TraversableHandle(state.next_handle);
        state.next_handle += 1;
        state.accels.insert(handle.0, desc.keys.len());
        state.journal.motion_transform_builds += 1;
        Ok(handle)
    }

    fn free_accel(&self, handle: TraversableHandle) -> DeviceResult<()> {
        let mut state = self.state.lock().unwrap();
        state.accels.remove(&handle.0);
        Ok(())
    }
}

fn arg_ptr(args: &[KernelArg], index: usize) -> DeviceResult<DevicePtr> {
    match args.get(index) {
        Some(KernelArg::Ptr(p)) => Ok(*p),
        other => Err(DeviceError::launch(format!(
            "argument {} is not a pointer: {:?}",
            index, other
        ))),
    }
}

fn arg_i32(args: &[KernelArg], index: usize) -> DeviceResult<i32> {
    match args.get(index) {
        Some(KernelArg::I32(v)) => Ok(*v),
        other => Err(DeviceError::launch(format!(
            "argument {} is not an i32: {:?}",
            index, other
        ))),
    }
}

fn arg_f32(args: &[KernelArg], index: usize) -> DeviceResult<f32> {
    match args.get(index) {
        Some(KernelArg::F32(v)) => Ok(*v),
        other => Err(DeviceError::launch(format!(
            "argument {} is not an f32: {:?}",
            index, other
        ))),
    }
}

struct NlmGeom {
    w: i32,
    h: i32,
    stride: i32,
    pass_stride: i32,
    r: i32,
}

impl NlmGeom {
    fn shifts(&self) -> Vec<(i32, i32)> {
        let mut shifts = Vec::new();
        for dy in -self.r..=self.r {
            for dx in -self.r..=self.r {
                shifts.push((dx, dy));
            }
        }
        shifts
    }

    fn index(&self, x: i32, y: i32) -> usize {
        (y * self.stride + x) as usize
    }

    fn contains(&self, x: i32, y: i32) -> bool {
        x >= 0 && y >= 0 && x < self.w && y < self.h
    }
}

/// Per-pixel patch distance between the guide image and its shifted copy,
/// one plane per shift offset.
fn nlm_calc_difference(state: &mut State, args: &[KernelArg]) -> DeviceResult<()> {
    let guide = arg_ptr(args, 0)?;
    let variance = arg_ptr(args, 1)?;
    let difference = arg_ptr(args, 3)?;
    let geom = NlmGeom {
        w: arg_i32(args, 4)?,
        h: arg_i32(args, 5)?,
        stride: arg_i32(args, 6)?,
        pass_stride: arg_i32(args, 7)?,
        r: arg_i32(args, 8)?,
    };
    let a = arg_f32(args, 11)?;
    let k_2 = arg_f32(args, 12)?;

    let plane = geom.pass_stride as usize;
    let guide_data = SoftwareBackend::read_f32(state, guide, plane)?;
    let variance_data = SoftwareBackend::read_f32(state, variance, plane)?;

    let shifts = geom.shifts();
    let mut out = vec![0.0f32; plane * shifts.len()];
    for (s, &(dx, dy)) in shifts.iter().enumerate() {
        for y in 0..geom.h {
            for x in 0..geom.w {
                let p = geom.index(x, y);
                let (qx, qy) = (x + dx, y + dy);
                let value = if geom.contains(qx, qy) {
                    let q = geom.index(qx, qy);
                    let d = guide_data[p] - guide_data[q];
                    (d * d - (variance_data[p] + variance_data[q])) / (a + k_2 * variance_data[p].abs())
                } else {
                    f32::INFINITY
                };
                out[s * plane + p] = value;
            }
        }
    }
    SoftwareBackend::write_f32(state, difference, &out)
}

/// Box blur over the patch window, per shift plane.
fn nlm_blur(state: &mut State, args: &[KernelArg]) -> DeviceResult<()> {
    let src = arg_ptr(args, 0)?;
    let dst = arg_ptr(args, 1)?;
    let geom = NlmGeom {
        w: arg_i32(args, 2)?,
        h: arg_i32(args, 3)?,
        stride: arg_i32(args, 4)?,
        pass_stride: arg_i32(args, 5)?,
        r: arg_i32(args, 6)?,
    };
    let f = arg_i32(args, 7)?;

    let plane = geom.pass_stride as usize;
    let num_shifts = geom.shifts().len();
    let src_data = SoftwareBackend::read_f32(state, src, plane * num_shifts)?;
    let mut out = vec![0.0f32; plane * num_shifts];
    for s in 0..num_shifts {
        for y in 0..geom.h {
            for x in 0..geom.w {
                let mut sum = 0.0f32;
                let mut count = 0u32;
                for fy in -f..=f {
                    for fx in -f..=f {
                        let (px, py) = (x + fx, y + fy);
                        if geom.contains(px, py) {
                            sum += src_data[s * plane + geom.index(px, py)];
                            count += 1;
                        }
                    }
                }
                out[s * plane + geom.index(x, y)] = if count > 0 { sum / count as f32 } else { 0.0 };
            }
        }
    }
    SoftwareBackend::write_f32(state, dst, &out)
}

/// Blurred patch distances to raw weights.
fn nlm_calc_weight(state: &mut State, args: &[KernelArg]) -> DeviceResult<()> {
    let src = arg_ptr(args, 0)?;
    let dst = arg_ptr(args, 1)?;
    let geom = NlmGeom {
        w: arg_i32(args, 2)?,
        h: arg_i32(args, 3)?,
        stride: arg_i32(args, 4)?,
        pass_stride: arg_i32(args, 5)?,
        r: arg_i32(args, 6)?,
    };

    let plane = geom.pass_stride as usize;
    let num_shifts = geom.shifts().len();
    let src_data = SoftwareBackend::read_f32(state, src, plane * num_shifts)?;
    let out: Vec<f32> = src_data
        .iter()
        .map(|&d| if d.is_finite() { (-d.max(0.0)).exp() } else { 0.0 })
        .collect();
    SoftwareBackend::write_f32(state, dst, &out)
}

/// Accumulate weighted contributions and weights.
fn nlm_update_output(state: &mut State, args: &[KernelArg]) -> DeviceResult<()> {
    let weights = arg_ptr(args, 0)?;
    let image = arg_ptr(args, 1)?;
    let out_ptr = arg_ptr(args, 2)?;
    let accum_ptr = arg_ptr(args, 3)?;
    let geom = NlmGeom {
        w: arg_i32(args, 4)?,
        h: arg_i32(args, 5)?,
        stride: arg_i32(args, 6)?,
        pass_stride: arg_i32(args, 7)?,
        r: arg_i32(args, 9)?,
    };

    let plane = geom.pass_stride as usize;
    let shifts = geom.shifts();
    let weight_data = SoftwareBackend::read_f32(state, weights, plane * shifts.len())?;
    let image_data = SoftwareBackend::read_f32(state, image, plane)?;
    let mut out = SoftwareBackend::read_f32(state, out_ptr, plane)?;
    let mut accum = SoftwareBackend::read_f32(state, accum_ptr, plane)?;

    for (s, &(dx, dy)) in shifts.iter().enumerate() {
        for y in 0..geom.h {
            for x in 0..geom.w {
                let (qx, qy) = (x + dx, y + dy);
                if !geom.contains(qx, qy) {
                    continue;
                }
                let p = geom.index(x, y);
                let weight = weight_data[s * plane + p];
                out[p] += weight * image_data[geom.index(qx, qy)];
                accum[p] += weight;
            }
        }
    }
    SoftwareBackend::write_f32(state, out_ptr, &out)?;
    SoftwareBackend::write_f32(state, accum_ptr, &accum)
}

/// Divide accumulated output by accumulated weight.
fn nlm_normalize(state: &mut State, args: &[KernelArg]) -> DeviceResult<()> {
    let out_ptr = arg_ptr(args, 0)?;
    let accum_ptr = arg_ptr(args, 1)?;
    let w = arg_i32(args, 2)?;
    let h = arg_i32(args, 3)?;
    let stride = arg_i32(args, 4)?;

    let plane = (stride * h) as usize;
    let mut out = SoftwareBackend::read_f32(state, out_ptr, plane)?;
    let accum = SoftwareBackend::read_f32(state, accum_ptr, plane)?;
    for y in 0..h {
        for x in 0..w {
            let p = (y * stride + x) as usize;
            if accum[p] > 0.0 {
                out[p] /= accum[p];
            }
        }
    }
    SoftwareBackend::write_f32(state, out_ptr, &out)
}

//! Residency decisions and the device memory budget.
//!
//! The allocation preference order is: device memory while the per-kind
//! headroom holds, then host-mapped memory under the map limit, then fail.
//! Under pressure, image textures are migrated to host-mapped backing
//! largest-first so working memory can stay on the device.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use crate::backend::{DeviceBackend, DevicePtr};
use crate::config::MemoryPolicy;
use crate::error::{DeviceError, DeviceResult, ErrorState};
use crate::memory::types::{BufferDesc, BufferId, DeviceBuffer, MemoryStats, Residency};

/// Serializes buffer migration across all device contexts in the process:
/// the first context performs a given migration, others wait and adopt.
static MOVE_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Breaks recursive migration when an allocation made during a migration
/// itself runs out of memory on another context.
static ANY_CONTEXT_MIGRATING: AtomicBool = AtomicBool::new(false);

struct State {
    buffers: HashMap<BufferId, DeviceBuffer>,
    device_bytes: u64,
    map_host_used: u64,
    /// While set, new texture allocations go straight to host-mapped memory.
    move_texture_to_host: bool,
}

pub struct MemoryManager {
    backend: Arc<dyn DeviceBackend>,
    error: ErrorState,
    policy: MemoryPolicy,
    state: Mutex<State>,
    next_id: AtomicU64,
    texture_table_dirty: AtomicBool,
}

impl MemoryManager {
    pub fn new(backend: Arc<dyn DeviceBackend>, error: ErrorState, policy: MemoryPolicy) -> Self {
        Self {
            backend,
            error,
            policy,
            state: Mutex::new(State {
                buffers: HashMap::new(),
                device_bytes: 0,
                map_host_used: 0,
                move_texture_to_host: false,
            }),
            next_id: AtomicU64::new(1),
            texture_table_dirty: AtomicBool::new(false),
        }
    }

    /// Allocate backing for `desc` and start tracking it.
    pub fn alloc(&self, desc: BufferDesc) -> DeviceResult<BufferId> {
        self.error.check()?;

        let id = BufferId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut buffer = DeviceBuffer {
            id,
            desc,
            residency: Residency::Unallocated,
            device_ptr: DevicePtr::NULL,
            device_size: 0,
            host_copy: None,
        };

        if buffer.desc.byte_size() > 0 {
            if let Err(err) = self.alloc_backing(&mut buffer) {
                self.error.raise(err.clone());
                return Err(err);
            }
        }

        let is_texture = buffer.desc.is_texture();
        {
            let mut state = self.state.lock().unwrap();
            match buffer.residency {
                Residency::DeviceResident => state.device_bytes += buffer.device_size,
                Residency::HostPinnedMapped => state.map_host_used += buffer.device_size,
                _ => {}
            }
            state.buffers.insert(id, buffer);
        }
        if is_texture {
            self.texture_table_dirty.store(true, Ordering::Release);
        }
        Ok(id)
    }

    /// Decide placement and allocate, following the preference chain.
    fn alloc_backing(&self, buffer: &mut DeviceBuffer) -> DeviceResult<()> {
        let size = buffer.desc.byte_size();
        let is_texture = buffer.desc.is_texture();
        let is_image = buffer.desc.is_image();
        let headroom = if is_texture {
            self.policy.texture_headroom
        } else {
            self.policy.working_headroom
        };
        let can_map_host = self.backend.capabilities().can_map_host;

        let moving = self.state.lock().unwrap().move_texture_to_host;
        let (mut free, _total) = self.backend.mem_info();

        // Make room by migrating textures before working allocations spill
        // to host memory; the performance hit would be worse for the
        // working set. Image allocations themselves are allowed to spill.
        if !moving && !is_image && size + headroom >= free && can_map_host {
            self.evict_textures_to_host(size + headroom - free, is_texture);
            free = self.backend.mem_info().0;
        }

        let moving = self.state.lock().unwrap().move_texture_to_host;
        if !moving && size + headroom < free {
            match self.backend.alloc_device(&buffer.desc.name, size) {
                Ok(ptr) => {
                    log::debug!(
                        "buffer allocate: {}, {} bytes in device memory",
                        buffer.desc.name,
                        size
                    );
                    buffer.residency = Residency::DeviceResident;
                    buffer.device_ptr = ptr;
                    buffer.device_size = size;
                    return Ok(());
                }
                Err(err) => {
                    log::warn!("device allocation of {} failed: {}", buffer.desc.name, err);
                }
            }
        }

        if can_map_host {
            let within_limit = {
                let state = self.state.lock().unwrap();
                state.map_host_used + size < self.policy.map_host_limit
            };
            if within_limit {
                let ptr = self.backend.alloc_host_mapped(&buffer.desc.name, size)?;
                log::debug!(
                    "buffer allocate: {}, {} bytes in host memory",
                    buffer.desc.name,
                    size
                );
                buffer.residency = Residency::HostPinnedMapped;
                buffer.device_ptr = ptr;
                buffer.device_size = size;
                return Ok(());
            }
        }

        Err(DeviceError::out_of_memory(format!(
            "system is out of GPU and shared host memory ({} requested for {})",
            size, buffer.desc.name
        )))
    }

    /// Migrate texture buffers to host-mapped backing until `bytes_needed`
    /// device bytes have been freed or no eligible candidate remains.
    ///
    /// Eligible: texture-kind, device-resident, not array-backed. When
    /// `only_images` is set (a texture allocation is asking for room), only
    /// 2D image textures move; otherwise images are still preferred but
    /// linear textures may move too. Published device addresses survive the
    /// migration.
    pub fn evict_textures_to_host(&self, mut bytes_needed: u64, only_images: bool) {
        if ANY_CONTEXT_MIGRATING.load(Ordering::Acquire) {
            return;
        }

        self.state.lock().unwrap().move_texture_to_host = true;

        while bytes_needed > 0 {
            let candidate = {
                let state = self.state.lock().unwrap();
                let mut best: Option<(BufferId, u64, bool)> = None;
                for buffer in state.buffers.values() {
                    if buffer.residency != Residency::DeviceResident {
                        continue;
                    }
                    if !buffer.desc.is_texture() || buffer.desc.array_backed {
                        continue;
                    }
                    let is_image = buffer.desc.is_image();
                    if only_images && !is_image {
                        continue;
                    }
                    let better = match best {
                        None => true,
                        Some((_, best_size, best_is_image)) => {
                            is_image > best_is_image
                                || (is_image == best_is_image && buffer.device_size > best_size)
                        }
                    };
                    if better {
                        best = Some((buffer.id, buffer.device_size, is_image));
                    }
                }
                best
            };

            let Some((id, size, _)) = candidate else {
                break;
            };

            {
                let _guard = MOVE_MUTEX.lock().unwrap();
                ANY_CONTEXT_MIGRATING.store(true, Ordering::Release);

                let mut state = self.state.lock().unwrap();
                if let Some(buffer) = state.buffers.get_mut(&id) {
                    // Re-check: another context may have migrated it while
                    // we waited on the move mutex.
                    if buffer.residency == Residency::DeviceResident {
                        log::info!("move memory from device to host: {}", buffer.desc.name);
                        if let Err(err) = self.backend.migrate_to_host(buffer.device_ptr) {
                            self.error.raise(err);
                            ANY_CONTEXT_MIGRATING.store(false, Ordering::Release);
                            break;
                        }
                        buffer.residency = Residency::HostPinnedMapped;
                        state.device_bytes -= size;
                        state.map_host_used += size;
                    }
                }

                ANY_CONTEXT_MIGRATING.store(false, Ordering::Release);
            }

            bytes_needed = bytes_needed.saturating_sub(size);
        }

        // Unset before the texture table reloads; the table itself stays in
        // device memory.
        self.state.lock().unwrap().move_texture_to_host = false;
        self.texture_table_dirty.store(true, Ordering::Release);
    }

    /// Release whichever backing is active. Silent no-op for unknown or
    /// already-unallocated buffers.
    pub fn free(&self, id: BufferId) {
        let removed = {
            let mut state = self.state.lock().unwrap();
            let Some(buffer) = state.buffers.remove(&id) else {
                return;
            };
            match buffer.residency {
                Residency::DeviceResident => state.device_bytes -= buffer.device_size,
                Residency::HostPinnedMapped => state.map_host_used -= buffer.device_size,
                _ => {}
            }
            buffer
        };

        let result = match removed.residency {
            Residency::DeviceResident => self.backend.free_device(removed.device_ptr),
            Residency::HostPinnedMapped => self.backend.free_host_mapped(removed.device_ptr),
            Residency::HostOnly | Residency::Unallocated => Ok(()),
        };
        if let Err(err) = result {
            self.error.raise(err);
        }
        if removed.desc.is_texture() {
            self.texture_table_dirty.store(true, Ordering::Release);
        }
    }

    /// Clear buffer contents. Device-side clear when a device address
    /// exists; host-side clear (allocating the host copy if needed)
    /// otherwise. No-op for buffers aliasing shared host memory.
    pub fn zero(&self, id: BufferId) -> DeviceResult<()> {
        self.error.check()?;
        let mut state = self.state.lock().unwrap();
        let Some(buffer) = state.buffers.get_mut(&id) else {
            return Ok(());
        };
        if buffer.desc.shared_alias {
            return Ok(());
        }
        let size = buffer.desc.byte_size();
        match buffer.residency {
            Residency::DeviceResident | Residency::HostPinnedMapped => {
                self.backend.memset_device(buffer.device_ptr, 0, size)
            }
            Residency::HostOnly | Residency::Unallocated => {
                let copy = buffer.host_copy.get_or_insert_with(|| vec![0; size as usize]);
                copy.fill(0);
                buffer.residency = Residency::HostOnly;
                Ok(())
            }
        }
    }

    pub fn copy_to_device(&self, id: BufferId, data: &[u8]) -> DeviceResult<()> {
        self.error.check()?;
        let ptr = self.require_ptr(id)?;
        self.backend.copy_to_device(ptr, data)
    }

    pub fn copy_from_device(&self, id: BufferId, out: &mut [u8]) -> DeviceResult<()> {
        self.error.check()?;
        let ptr = self.require_ptr(id)?;
        self.backend.copy_from_device(ptr, out)
    }

    fn require_ptr(&self, id: BufferId) -> DeviceResult<DevicePtr> {
        self.device_ptr(id).ok_or_else(|| {
            DeviceError::launch(format!("buffer {:?} has no device address", id))
        })
    }

    /// Published device address, if the buffer has one.
    pub fn device_ptr(&self, id: BufferId) -> Option<DevicePtr> {
        let state = self.state.lock().unwrap();
        state.buffers.get(&id).and_then(|b| b.device_ptr())
    }

    pub fn residency(&self, id: BufferId) -> Residency {
        let state = self.state.lock().unwrap();
        state
            .buffers
            .get(&id)
            .map(|b| b.residency)
            .unwrap_or(Residency::Unallocated)
    }

    /// Snapshot of texture device addresses for the descriptor table, in
    /// allocation order.
    pub fn texture_table_entries(&self) -> Vec<DevicePtr> {
        let state = self.state.lock().unwrap();
        let mut textures: Vec<_> = state
            .buffers
            .values()
            .filter(|b| b.desc.is_texture())
            .collect();
        textures.sort_by_key(|b| b.id.0);
        textures
            .iter()
            .filter_map(|b| b.device_ptr())
            .collect()
    }

    /// Set by any texture allocation, free, or migration since the last
    /// table upload.
    pub fn texture_table_dirty(&self) -> bool {
        self.texture_table_dirty.load(Ordering::Acquire)
    }

    pub fn clear_texture_table_dirty(&self) {
        self.texture_table_dirty.store(false, Ordering::Release);
    }

    pub fn stats(&self) -> MemoryStats {
        let state = self.state.lock().unwrap();
        let host_only_bytes = state
            .buffers
            .values()
            .filter(|b| b.residency == Residency::HostOnly)
            .map(|b| b.desc.byte_size())
            .sum();
        MemoryStats {
            buffer_count: state.buffers.len() as u32,
            device_bytes: state.device_bytes,
            host_mapped_bytes: state.map_host_used,
            host_only_bytes,
        }
    }

    /// Free every tracked buffer (context teardown).
    pub fn free_all(&self) {
        let ids: Vec<BufferId> = {
            let state = self.state.lock().unwrap();
            state.buffers.keys().copied().collect()
        };
        for id in ids {
            self.free(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::{SoftwareBackend, SoftwareConfig};

    const MIB: u64 = 1024 * 1024;

    fn manager(device_mem: u64, can_map_host: bool, map_limit: u64) -> MemoryManager {
        let backend = Arc::new(SoftwareBackend::new(SoftwareConfig {
            total_memory: device_mem,
            can_map_host,
            ..Default::default()
        }));
        let policy = MemoryPolicy {
            working_headroom: 4 * MIB,
            texture_headroom: 16 * MIB,
            map_host_limit: map_limit,
        };
        MemoryManager::new(backend, ErrorState::new(), policy)
    }

    #[test]
    fn device_resident_when_headroom_holds() {
        let mgr = manager(64 * MIB, false, 0);
        let id = mgr.alloc(BufferDesc::working("accum", 16, 1024)).unwrap();
        assert_eq!(mgr.residency(id), Residency::DeviceResident);
        assert!(mgr.device_ptr(id).is_some());
        assert_eq!(mgr.stats().device_bytes, 16 * 1024);
    }

    #[test]
    fn free_is_silent_for_unknown_buffers() {
        let mgr = manager(64 * MIB, false, 0);
        mgr.free(BufferId(999));
        let id = mgr.alloc(BufferDesc::working("tmp", 4, 16)).unwrap();
        mgr.free(id);
        mgr.free(id);
        assert_eq!(mgr.stats().buffer_count, 0);
    }

    #[test]
    fn zero_on_unallocated_creates_host_copy() {
        let mgr = manager(64 * MIB, false, 0);
        let id = mgr
            .alloc(BufferDesc {
                count: 0,
                ..BufferDesc::working("empty", 4, 0)
            })
            .unwrap();
        assert_eq!(mgr.residency(id), Residency::Unallocated);
        assert!(mgr.device_ptr(id).is_none());
        mgr.zero(id).unwrap();
    }

    #[test]
    fn oom_raises_device_error() {
        let mgr = manager(8 * MIB, false, 0);
        let result = mgr.alloc(BufferDesc::working("big", 1, 32 * MIB));
        assert!(matches!(result, Err(DeviceError::OutOfMemory(_))));
        // Error state short-circuits further allocations.
        let next = mgr.alloc(BufferDesc::working("small", 1, 16));
        assert!(next.is_err());
    }
}

//! Buffer descriptors, residency states, and accounting snapshots.

use serde::{Deserialize, Serialize};

use crate::backend::DevicePtr;

/// Where a buffer's bytes currently live. A buffer is in exactly one state;
/// only `DeviceResident` and `HostPinnedMapped` publish a device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Residency {
    Unallocated,
    DeviceResident,
    /// Host memory mapped into the device address space.
    HostPinnedMapped,
    /// Host copy only, no device-side presence.
    HostOnly,
}

/// Semantic class of an allocation, driving headroom and eviction policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryKind {
    /// Render working set: output buffers, parameter blocks, queues. Small
    /// hot allocations (like the texture descriptor table) also use this
    /// kind regardless of their content.
    Working,
    /// 1D global data arrays.
    Global,
    /// Image textures.
    Texture,
}

/// Stable integer identity of one tracked buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u64);

/// Allocation request.
#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub name: String,
    pub kind: MemoryKind,
    pub elem_size: u64,
    pub count: u64,
    /// 2D extent; `height > 1` marks an image texture, which eviction
    /// prefers to move first.
    pub width: u32,
    pub height: u32,
    /// Backed by an opaque vendor array object; such buffers cannot migrate.
    pub array_backed: bool,
    /// Host backing aliased with another buffer's; zeroing is a no-op.
    pub shared_alias: bool,
}

impl BufferDesc {
    pub fn working(name: &str, elem_size: u64, count: u64) -> Self {
        Self {
            name: name.to_string(),
            kind: MemoryKind::Working,
            elem_size,
            count,
            width: count as u32,
            height: 1,
            array_backed: false,
            shared_alias: false,
        }
    }

    pub fn global(name: &str, elem_size: u64, count: u64) -> Self {
        Self {
            kind: MemoryKind::Global,
            ..Self::working(name, elem_size, count)
        }
    }

    pub fn texture_2d(name: &str, elem_size: u64, width: u32, height: u32) -> Self {
        Self {
            name: name.to_string(),
            kind: MemoryKind::Texture,
            elem_size,
            count: width as u64 * height as u64,
            width,
            height,
            array_backed: false,
            shared_alias: false,
        }
    }

    pub fn byte_size(&self) -> u64 {
        self.elem_size * self.count
    }

    /// Texture-typed for headroom/eviction purposes.
    pub fn is_texture(&self) -> bool {
        matches!(self.kind, MemoryKind::Texture | MemoryKind::Global)
    }

    pub fn is_image(&self) -> bool {
        self.is_texture() && self.height > 1
    }
}

/// One tracked buffer.
#[derive(Debug)]
pub struct DeviceBuffer {
    pub id: BufferId,
    pub desc: BufferDesc,
    pub residency: Residency,
    /// Published device address; null unless `DeviceResident` or
    /// `HostPinnedMapped`.
    pub device_ptr: DevicePtr,
    /// Bytes of physical backing currently held.
    pub device_size: u64,
    /// Host copy owned by the manager for `HostOnly` buffers.
    pub host_copy: Option<Vec<u8>>,
}

impl DeviceBuffer {
    /// The published address, if any. `HostOnly` buffers never have one.
    pub fn device_ptr(&self) -> Option<DevicePtr> {
        match self.residency {
            Residency::DeviceResident | Residency::HostPinnedMapped => Some(self.device_ptr),
            Residency::Unallocated | Residency::HostOnly => None,
        }
    }
}

/// Accounting snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStats {
    pub buffer_count: u32,
    pub device_bytes: u64,
    pub host_mapped_bytes: u64,
    pub host_only_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_detection() {
        let tex = BufferDesc::texture_2d("env", 16, 64, 64);
        assert!(tex.is_texture());
        assert!(tex.is_image());
        assert_eq!(tex.byte_size(), 64 * 64 * 16);

        let linear = BufferDesc::global("lookup", 4, 256);
        assert!(linear.is_texture());
        assert!(!linear.is_image());

        let work = BufferDesc::working("params", 8, 32);
        assert!(!work.is_texture());
    }
}

//! Per-stream launch parameter blocks.
//!
//! One contiguous device allocation holds `num_streams` copies of
//! `LaunchParams`. Stream `i` only ever reads slice `i`, so tile and shader
//! descriptors are written per stream while scene constants are broadcast to
//! every slice.

use std::mem;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::backend::{DeviceBackend, DevicePtr, StreamId};
use crate::error::DeviceResult;
use crate::memory::{BufferDesc, BufferId, MemoryManager};

/// Work-tile descriptor as the path trace kernel reads it.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct WorkTile {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    pub offset: i32,
    pub stride: i32,
    pub start_sample: u32,
    pub num_samples: u32,
    pub buffer: u64,
}

/// Shader evaluation descriptor.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct ShaderEvalState {
    pub input: u64,
    pub output: u64,
    pub eval_type: u32,
    pub sample: u32,
    pub offset: i32,
    pub _pad: u32,
}

/// Scene-wide constants, logically shared, physically duplicated per stream.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct SceneConstants {
    /// Active top-level traversable, substituted before every launch.
    pub traversable: u64,
    /// Device address of the texture descriptor table.
    pub texture_table: u64,
    pub num_textures: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct LaunchParams {
    pub work_tile: WorkTile,
    pub shader: ShaderEvalState,
    pub constants: SceneConstants,
}

const WORK_TILE_OFFSET: u64 = 0;
const SHADER_OFFSET: u64 = mem::size_of::<WorkTile>() as u64;
const CONSTANTS_OFFSET: u64 = SHADER_OFFSET + mem::size_of::<ShaderEvalState>() as u64;
const STRIDE: u64 = mem::size_of::<LaunchParams>() as u64;

pub struct ParamTable {
    backend: Arc<dyn DeviceBackend>,
    buffer: BufferId,
    base: DevicePtr,
    num_streams: usize,
}

impl ParamTable {
    pub fn new(
        backend: Arc<dyn DeviceBackend>,
        memory: &MemoryManager,
        num_streams: usize,
    ) -> DeviceResult<Self> {
        let buffer = memory.alloc(BufferDesc::working(
            "launch_params",
            mem::size_of::<LaunchParams>() as u64,
            num_streams as u64,
        ))?;
        memory.zero(buffer)?;
        let base = memory
            .device_ptr(buffer)
            .expect("working allocation always has a device address");
        Ok(Self {
            backend,
            buffer,
            base,
            num_streams,
        })
    }

    pub fn buffer(&self) -> BufferId {
        self.buffer
    }

    /// Device address of the parameter slice the given stream reads.
    pub fn stream_ptr(&self, stream: StreamId) -> DevicePtr {
        debug_assert!(stream.0 < self.num_streams);
        self.base.offset(stream.0 as u64 * STRIDE)
    }

    pub fn write_work_tile(&self, stream: StreamId, tile: &WorkTile) -> DeviceResult<()> {
        self.backend.copy_to_device(
            self.stream_ptr(stream).offset(WORK_TILE_OFFSET),
            bytemuck::bytes_of(tile),
        )
    }

    pub fn write_shader_state(
        &self,
        stream: StreamId,
        state: &ShaderEvalState,
    ) -> DeviceResult<()> {
        self.backend.copy_to_device(
            self.stream_ptr(stream).offset(SHADER_OFFSET),
            bytemuck::bytes_of(state),
        )
    }

    /// Write the same constants into every stream's slice.
    pub fn broadcast_constants(&self, constants: &SceneConstants) -> DeviceResult<()> {
        for i in 0..self.num_streams {
            self.backend.copy_to_device(
                self.stream_ptr(StreamId(i)).offset(CONSTANTS_OFFSET),
                bytemuck::bytes_of(constants),
            )?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn read_constants(&self, stream: StreamId) -> DeviceResult<SceneConstants> {
        let mut raw = [0u8; mem::size_of::<SceneConstants>()];
        self.backend.copy_from_device(
            self.stream_ptr(stream).offset(CONSTANTS_OFFSET),
            &mut raw,
        )?;
        Ok(*bytemuck::from_bytes(&raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::{SoftwareBackend, SoftwareConfig};
    use crate::config::MemoryPolicy;
    use crate::error::ErrorState;

    #[test]
    fn block_layout_has_no_padding() {
        assert_eq!(mem::size_of::<WorkTile>(), 40);
        assert_eq!(mem::size_of::<ShaderEvalState>(), 32);
        assert_eq!(mem::size_of::<SceneConstants>(), 24);
        assert_eq!(mem::size_of::<LaunchParams>(), 96);
    }

    #[test]
    fn broadcast_reaches_every_stream_slice() {
        let backend = Arc::new(SoftwareBackend::new(SoftwareConfig::default()));
        let memory = MemoryManager::new(backend.clone(), ErrorState::new(), MemoryPolicy::default());
        let table = ParamTable::new(backend, &memory, 3).unwrap();

        let constants = SceneConstants {
            traversable: 42,
            texture_table: 7,
            num_textures: 2,
            _pad: 0,
        };
        table.broadcast_constants(&constants).unwrap();

        for i in 0..3 {
            assert_eq!(table.read_constants(StreamId(i)).unwrap(), constants);
        }
    }

    #[test]
    fn stream_slices_do_not_alias() {
        let backend = Arc::new(SoftwareBackend::new(SoftwareConfig::default()));
        let memory = MemoryManager::new(backend.clone(), ErrorState::new(), MemoryPolicy::default());
        let table = ParamTable::new(backend, &memory, 2).unwrap();

        let tile = WorkTile {
            x: 1,
            y: 2,
            w: 3,
            h: 4,
            offset: 0,
            stride: 3,
            start_sample: 0,
            num_samples: 8,
            buffer: 0,
        };
        table.write_work_tile(StreamId(1), &tile).unwrap();
        assert_ne!(table.stream_ptr(StreamId(0)), table.stream_ptr(StreamId(1)));
    }
}

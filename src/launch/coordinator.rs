//! Translates work descriptions into kernel launches on a specific stream.
//!
//! Every launch path shares the same preamble: check the error state,
//! refresh the texture descriptor table if an allocation dirtied it, and
//! make sure the active traversable is present in every stream's constant
//! block. Streams are synchronized before each function returns, so callers
//! observe completed results and buffer lifetimes stay simple.

use std::mem;
use std::sync::Arc;

use log::{debug, trace};

use crate::accel::TraversableHandle;
use crate::backend::{DeviceBackend, KernelArg, LaunchDims, StreamId};
use crate::config::LaunchConfig;
use crate::error::{DeviceResult, ErrorState};
use crate::kernel;
use crate::launch::params::{ParamTable, SceneConstants, ShaderEvalState, WorkTile};
use crate::memory::{BufferDesc, BufferId, MemoryManager};
use crate::task::{
    ConvertKind, DeviceTask, FilmConvertWork, RenderWork, ShaderEvalKind, ShaderEvalWork,
};

struct ConstantState {
    constants: SceneConstants,
    texture_table: Option<BufferId>,
}

pub struct LaunchCoordinator {
    backend: Arc<dyn DeviceBackend>,
    memory: Arc<MemoryManager>,
    error: ErrorState,
    config: LaunchConfig,
    params: ParamTable,
    state: std::sync::Mutex<ConstantState>,
}

impl LaunchCoordinator {
    pub fn new(
        backend: Arc<dyn DeviceBackend>,
        memory: Arc<MemoryManager>,
        error: ErrorState,
        config: LaunchConfig,
        num_streams: usize,
    ) -> DeviceResult<Self> {
        let params = ParamTable::new(backend.clone(), &memory, num_streams)?;
        Ok(Self {
            backend,
            memory,
            error,
            config,
            params,
            state: std::sync::Mutex::new(ConstantState {
                constants: SceneConstants::default(),
                texture_table: None,
            }),
        })
    }

    /// Install a new scene traversable. Takes effect in every stream's
    /// constant block before the next launch.
    pub fn set_traversable(&self, traversable: TraversableHandle) -> DeviceResult<()> {
        let mut state = self.state.lock().unwrap();
        state.constants.traversable = traversable.0;
        self.params.broadcast_constants(&state.constants)
    }

    /// Rebuild and upload the texture descriptor table if any texture
    /// allocation changed it since the last launch.
    fn refresh_texture_table(&self) -> DeviceResult<()> {
        if !self.memory.texture_table_dirty() {
            return Ok(());
        }
        let entries = self.memory.texture_table_entries();
        debug!("refreshing texture table with {} entries", entries.len());

        let mut state = self.state.lock().unwrap();
        if let Some(old) = state.texture_table.take() {
            self.memory.free(old);
        }
        let count = entries.len().max(1) as u64;
        let id = self
            .memory
            .alloc(BufferDesc::working("texture_table", mem::size_of::<u64>() as u64, count))?;
        if entries.is_empty() {
            self.memory.zero(id)?;
        } else {
            self.memory
                .copy_to_device(id, bytemuck::cast_slice(&entries))?;
        }
        state.texture_table = Some(id);
        state.constants.texture_table = self
            .memory
            .device_ptr(id)
            .map(|p| p.0)
            .unwrap_or_default();
        state.constants.num_textures = entries.len() as u32;
        self.memory.clear_texture_table_dirty();
        self.params.broadcast_constants(&state.constants)
    }

    fn prepare(&self) -> DeviceResult<()> {
        self.error.check()?;
        self.refresh_texture_table()
    }

    fn square_block(&self, entry: &str) -> u32 {
        let tpb = self.backend.max_threads_per_block(entry).max(1);
        ((tpb as f64).sqrt() as u32).max(1)
    }

    /// Render tiles pulled from `work` until the queue drains or the task is
    /// cancelled. Samples advance in fixed sub-batches with the stream
    /// synchronized after each one.
    pub fn launch_render(
        &self,
        work: &dyn RenderWork,
        task: &DeviceTask,
        interactive: bool,
        stream: StreamId,
    ) -> DeviceResult<()> {
        let batch_size = if interactive {
            self.config.interactive_batch_size
        } else {
            self.config.sample_batch_size
        };
        let side = self.square_block(kernel::KERNEL_PATH_TRACE);

        while let Some(mut tile) = work.acquire_tile() {
            while tile.sample < tile.end_sample() {
                self.prepare()?;
                if task.cancel_requested() && !task.finish_queue {
                    break;
                }
                let samples = batch_size.min(tile.end_sample() - tile.sample);
                let wtile = WorkTile {
                    x: tile.x,
                    y: tile.y,
                    w: tile.w,
                    h: tile.h,
                    offset: tile.offset,
                    stride: tile.stride,
                    start_sample: tile.sample,
                    num_samples: samples,
                    buffer: tile.buffer.0,
                };
                self.params.write_work_tile(stream, &wtile)?;

                let total_work = tile.w * samples;
                trace!(
                    "path trace tile ({}, {}) samples {}..{} on stream {}",
                    tile.x,
                    tile.y,
                    tile.sample,
                    tile.sample + samples,
                    stream.0
                );
                self.launch_checked(
                    stream,
                    kernel::KERNEL_PATH_TRACE,
                    LaunchDims::rect(total_work, tile.h, side, side),
                    &[
                        KernelArg::Ptr(self.params.stream_ptr(stream)),
                        KernelArg::U32(total_work * tile.h),
                    ],
                )?;
                self.backend.synchronize_stream(stream)?;

                tile.sample += samples;
                work.update_progress(
                    Some(&tile),
                    tile.w as u64 * tile.h as u64 * samples as u64,
                );
            }
            let done = tile.sample >= tile.end_sample();
            work.release_tile(tile);
            if !done {
                // Cancelled mid-tile, do not pull further tiles.
                break;
            }
        }
        Ok(())
    }

    /// Shader evaluation runs one sample at a time over fixed-size chunks of
    /// the input range.
    pub fn launch_shader_eval(
        &self,
        work: &ShaderEvalWork,
        task: &DeviceTask,
        stream: StreamId,
    ) -> DeviceResult<()> {
        let entry = match work.kind {
            ShaderEvalKind::Displace => kernel::KERNEL_DISPLACE,
            ShaderEvalKind::Background => kernel::KERNEL_BACKGROUND,
            ShaderEvalKind::Bake => kernel::KERNEL_BAKE,
        };
        let tpb = self.backend.max_threads_per_block(entry).max(1);
        let chunk = self.config.shader_chunk_size;

        for sample in 0..work.num_samples {
            let mut offset = work.eval_start;
            while offset < work.eval_end {
                self.prepare()?;
                if task.cancel_requested() && !task.finish_queue {
                    return Ok(());
                }
                let count = chunk.min((work.eval_end - offset) as u32);
                let state = ShaderEvalState {
                    input: work.input.0,
                    output: work.output.0,
                    eval_type: work.kind as u32,
                    sample,
                    offset,
                    _pad: 0,
                };
                self.params.write_shader_state(stream, &state)?;
                self.launch_checked(
                    stream,
                    entry,
                    LaunchDims::linear(count, tpb),
                    &[
                        KernelArg::Ptr(self.params.stream_ptr(stream)),
                        KernelArg::U32(count),
                    ],
                )?;
                self.backend.synchronize_stream(stream)?;
                task.report_progress(count as u64);
                offset += count as i32;
            }
        }
        Ok(())
    }

    /// Convert the accumulated render buffer for display, one launch over
    /// the full rectangle.
    pub fn launch_film_convert(
        &self,
        work: &FilmConvertWork,
        task: &DeviceTask,
        stream: StreamId,
    ) -> DeviceResult<()> {
        self.prepare()?;
        if task.cancel_requested() && !task.finish_queue {
            return Ok(());
        }
        let entry = match work.kind {
            ConvertKind::Byte => kernel::KERNEL_CONVERT_TO_BYTE,
            ConvertKind::HalfFloat => kernel::KERNEL_CONVERT_TO_HALF_FLOAT,
        };
        let side = self.square_block(entry);
        let sample_scale = 1.0 / (work.sample + 1) as f32;

        self.launch_checked(
            stream,
            entry,
            LaunchDims::rect(work.w, work.h, side, side),
            &[
                KernelArg::Ptr(work.dst),
                KernelArg::Ptr(work.buffer),
                KernelArg::F32(sample_scale),
                KernelArg::I32(work.x as i32),
                KernelArg::I32(work.y as i32),
                KernelArg::I32(work.w as i32),
                KernelArg::I32(work.h as i32),
                KernelArg::I32(work.offset),
                KernelArg::I32(work.stride),
            ],
        )?;
        self.backend.synchronize_stream(stream)?;
        task.report_progress(work.w as u64 * work.h as u64);
        Ok(())
    }

    /// Direct launch access for pipelines that manage their own staging,
    /// with the shared failure bookkeeping.
    pub(crate) fn launch_checked(
        &self,
        stream: StreamId,
        entry: &str,
        dims: LaunchDims,
        args: &[KernelArg],
    ) -> DeviceResult<()> {
        match self.backend.launch(stream, entry, dims, args) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.error.raise(err.clone());
                Err(err)
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn error(&self) -> &ErrorState {
        &self.error
    }

    pub fn teardown(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(id) = state.texture_table.take() {
            self.memory.free(id);
        }
        self.memory.free(self.params.buffer());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::{SoftwareBackend, SoftwareConfig};
    use crate::backend::DevicePtr;
    use crate::config::MemoryPolicy;
    use crate::task::{split_tiles, TaskPayload, TileQueue};

    fn fixture() -> (Arc<SoftwareBackend>, Arc<MemoryManager>, LaunchCoordinator) {
        let backend = Arc::new(SoftwareBackend::new(SoftwareConfig::default()));
        let error = ErrorState::new();
        let memory = Arc::new(MemoryManager::new(
            backend.clone(),
            error.clone(),
            MemoryPolicy::default(),
        ));
        let coordinator = LaunchCoordinator::new(
            backend.clone(),
            memory.clone(),
            error,
            LaunchConfig::default(),
            2,
        )
        .unwrap();
        (backend, memory, coordinator)
    }

    #[test]
    fn render_batches_samples() {
        let (backend, _memory, coordinator) = fixture();
        let tiles = split_tiles(16, 16, 16, 0, 40, 16, DevicePtr(0x2000));
        let queue = Arc::new(TileQueue::new(tiles));
        let task = DeviceTask::new(TaskPayload::Render {
            work: queue.clone(),
            interactive: false,
        });

        backend.clear_launches();
        coordinator
            .launch_render(&*queue, &task, false, StreamId(0))
            .unwrap();

        // 40 samples at batch size 32 is two launches: 32 then 8.
        let launches = backend.launches();
        assert_eq!(launches.len(), 2);
        assert!(launches
            .iter()
            .all(|l| l.entry == kernel::KERNEL_PATH_TRACE));
        assert_eq!(queue.progress(), 16 * 16 * 40);
    }

    #[test]
    fn interactive_render_uses_small_batches() {
        let (backend, _memory, coordinator) = fixture();
        let tiles = split_tiles(8, 8, 8, 0, 16, 8, DevicePtr(0x2000));
        let queue = Arc::new(TileQueue::new(tiles));
        let task = DeviceTask::new(TaskPayload::Render {
            work: queue.clone(),
            interactive: true,
        });

        backend.clear_launches();
        coordinator
            .launch_render(&*queue, &task, true, StreamId(0))
            .unwrap();
        assert_eq!(backend.launches().len(), 2); // 16 samples in batches of 8
    }

    #[test]
    fn shader_eval_chunks_the_range() {
        let (backend, _memory, coordinator) = fixture();
        let work = ShaderEvalWork {
            kind: ShaderEvalKind::Background,
            input: DevicePtr(0x3000),
            output: DevicePtr(0x4000),
            eval_start: 0,
            eval_end: 70000,
            num_samples: 1,
        };
        let task = DeviceTask::new(TaskPayload::ShaderEval(work.clone()));

        backend.clear_launches();
        coordinator
            .launch_shader_eval(&work, &task, StreamId(1))
            .unwrap();

        let launches = backend.launches();
        assert_eq!(launches.len(), 2); // 65536 then 4464
        assert!(launches.iter().all(|l| l.stream == 1));
        assert!(launches
            .iter()
            .all(|l| l.entry == kernel::KERNEL_BACKGROUND));
    }

    #[test]
    fn film_convert_uses_square_blocks() {
        let (backend, _memory, coordinator) = fixture();
        let work = FilmConvertWork {
            kind: ConvertKind::HalfFloat,
            buffer: DevicePtr(0x5000),
            dst: DevicePtr(0x6000),
            sample: 7,
            x: 0,
            y: 0,
            w: 64,
            h: 64,
            offset: 0,
            stride: 64,
        };
        let task = DeviceTask::new(TaskPayload::FilmConvert(work.clone()));

        backend.clear_launches();
        coordinator
            .launch_film_convert(&work, &task, StreamId(0))
            .unwrap();

        let launches = backend.launches();
        assert_eq!(launches.len(), 1);
        // 256 threads per block split as 16x16.
        assert_eq!(launches[0].dims.block, [16, 16, 1]);
    }

    #[test]
    fn texture_alloc_triggers_table_refresh() {
        let (_backend, memory, coordinator) = fixture();
        memory
            .alloc(BufferDesc::texture_2d("env", 16, 8, 8))
            .unwrap();
        assert!(memory.texture_table_dirty());

        coordinator.prepare().unwrap();
        assert!(!memory.texture_table_dirty());
    }

    #[test]
    fn raised_error_short_circuits_launches() {
        let (backend, _memory, coordinator) = fixture();
        coordinator
            .error()
            .raise(crate::error::DeviceError::launch("prior failure"));

        let tiles = split_tiles(8, 8, 8, 0, 4, 8, DevicePtr(0x2000));
        let queue = Arc::new(TileQueue::new(tiles));
        let task = DeviceTask::new(TaskPayload::Render {
            work: queue.clone(),
            interactive: false,
        });
        backend.clear_launches();
        assert!(coordinator
            .launch_render(&*queue, &task, false, StreamId(0))
            .is_err());
        assert!(backend.launches().is_empty());
    }
}

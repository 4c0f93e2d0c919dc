//! Device context: owns the backend handle, stream pool, memory manager,
//! acceleration structures and launch machinery, and exposes the task
//! submission surface the render scheduler drives.

use std::sync::{Arc, Mutex};

use log::{info, warn};

use crate::accel::{AccelBuilder, TraversableHandle};
use crate::backend::{DeviceBackend, StreamId};
use crate::config::DeviceConfig;
use crate::denoise::DenoisePipeline;
use crate::device_caps::DeviceCapabilities;
use crate::error::{DeviceResult, ErrorState};
use crate::kernel::{cache, DeviceKey, KernelRequest, KernelSetHandle};
use crate::launch::LaunchCoordinator;
use crate::memory::{BufferDesc, BufferId, MemoryManager, MemoryStats, Residency};
use crate::scene::GeometrySnapshot;
use crate::sched::StreamScheduler;
use crate::task::{DeviceTask, ShaderEvalWork, TaskPayload};

pub struct DeviceContext {
    backend: Arc<dyn DeviceBackend>,
    error: ErrorState,
    memory: Arc<MemoryManager>,
    scheduler: StreamScheduler,
    coordinator: Arc<LaunchCoordinator>,
    accel: Mutex<AccelBuilder>,
    device_key: DeviceKey,
}

impl DeviceContext {
    pub fn new(
        backend: Arc<dyn DeviceBackend>,
        config: DeviceConfig,
        device_key: DeviceKey,
    ) -> DeviceResult<Self> {
        let caps = backend.capabilities();
        info!(
            "device context on {} ({} MB, host mapping {})",
            caps.name,
            caps.total_memory / (1024 * 1024),
            if caps.can_map_host { "on" } else { "off" }
        );

        let error = ErrorState::new();
        let memory = Arc::new(MemoryManager::new(
            backend.clone(),
            error.clone(),
            config.memory.clone(),
        ));
        let scheduler = StreamScheduler::new(&config.scheduler);
        let coordinator = Arc::new(LaunchCoordinator::new(
            backend.clone(),
            memory.clone(),
            error.clone(),
            config.launch.clone(),
            scheduler.num_streams(),
        )?);
        let accel = Mutex::new(AccelBuilder::new(backend.clone(), error.clone()));

        Ok(Self {
            backend,
            error,
            memory,
            scheduler,
            coordinator,
            accel,
            device_key,
        })
    }

    pub fn capabilities(&self) -> DeviceCapabilities {
        self.backend.capabilities()
    }

    pub fn num_streams(&self) -> usize {
        self.scheduler.num_streams()
    }

    /// Load (or fetch from the process-wide cache) the kernel set for the
    /// requested feature combination.
    pub fn load_kernels(&self, request: &KernelRequest) -> DeviceResult<KernelSetHandle> {
        let backend = self.backend.clone();
        let request = request.clone();
        let result = cache::get_or_load(self.device_key, &request.features.cache_key(), move || {
            backend.load_kernels(&request)
        });
        if let Err(err) = &result {
            self.error.raise(err.clone());
        }
        result
    }

    /// Rebuild acceleration structures from the snapshot and publish the new
    /// traversable to every stream. Serializes against in-flight work.
    pub fn build_scene(
        &self,
        snapshot: &GeometrySnapshot,
        motion_blur: bool,
    ) -> DeviceResult<()> {
        self.scheduler.wait();
        self.backend.synchronize()?;

        let mut accel = self.accel.lock().unwrap();
        accel.rebuild(snapshot, motion_blur)?;
        self.coordinator.set_traversable(accel.traversable())
    }

    pub fn traversable(&self) -> TraversableHandle {
        self.accel.lock().unwrap().traversable()
    }

    /// Submit one task, fanned out across the stream pool. Returns once the
    /// sub-tasks are queued; use [`wait`](Self::wait) for completion.
    pub fn task_add(&self, task: DeviceTask) {
        let num_streams = self.scheduler.num_streams();
        match &*task.payload {
            TaskPayload::Render { work, interactive } => {
                let interactive = *interactive;
                let subtasks: Vec<_> = (0..num_streams)
                    .map(|_| {
                        let coordinator = self.coordinator.clone();
                        let work = work.clone();
                        let task = task.clone();
                        move |stream: StreamId| {
                            if let Err(err) =
                                coordinator.launch_render(&*work, &task, interactive, stream)
                            {
                                warn!("render sub-task on stream {} failed: {}", stream.0, err);
                            }
                        }
                    })
                    .collect();
                self.scheduler.submit(subtasks);
            }
            TaskPayload::ShaderEval(work) => {
                let subtasks: Vec<_> = split_shader_eval(work, num_streams)
                    .into_iter()
                    .map(|chunk| {
                        let coordinator = self.coordinator.clone();
                        let task = task.clone();
                        move |stream: StreamId| {
                            if let Err(err) = coordinator.launch_shader_eval(&chunk, &task, stream)
                            {
                                warn!(
                                    "shader eval sub-task on stream {} failed: {}",
                                    stream.0, err
                                );
                            }
                        }
                    })
                    .collect();
                self.scheduler.submit(subtasks);
            }
            TaskPayload::FilmConvert(work) => {
                let coordinator = self.coordinator.clone();
                let work = work.clone();
                let task = task.clone();
                self.scheduler.submit(vec![move |stream: StreamId| {
                    if let Err(err) = coordinator.launch_film_convert(&work, &task, stream) {
                        warn!("film convert on stream {} failed: {}", stream.0, err);
                    }
                }]);
            }
        }
    }

    /// Block until all queued sub-tasks complete.
    pub fn wait(&self) {
        self.scheduler.wait();
    }

    /// Drop queued sub-tasks; in-flight ones observe their task's cancel
    /// flag between batches.
    pub fn cancel(&self) {
        self.scheduler.cancel();
    }

    pub fn denoiser(&self, stream: StreamId) -> DenoisePipeline {
        DenoisePipeline::new(
            self.backend.clone(),
            self.memory.clone(),
            self.error.clone(),
            stream,
        )
    }

    // Memory surface, forwarded to the residency manager.

    pub fn mem_alloc(&self, desc: BufferDesc) -> DeviceResult<BufferId> {
        self.memory.alloc(desc)
    }

    pub fn mem_free(&self, id: BufferId) {
        self.memory.free(id);
    }

    pub fn mem_zero(&self, id: BufferId) -> DeviceResult<()> {
        self.memory.zero(id)
    }

    pub fn mem_copy_to(&self, id: BufferId, data: &[u8]) -> DeviceResult<()> {
        self.memory.copy_to_device(id, data)
    }

    pub fn mem_copy_from(&self, id: BufferId, out: &mut [u8]) -> DeviceResult<()> {
        self.memory.copy_from_device(id, out)
    }

    pub fn mem_residency(&self, id: BufferId) -> Residency {
        self.memory.residency(id)
    }

    pub fn mem_stats(&self) -> MemoryStats {
        self.memory.stats()
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    pub fn has_error(&self) -> bool {
        self.error.has_error()
    }

    pub fn first_error_message(&self) -> Option<String> {
        self.error.first_message()
    }

    pub fn error_state(&self) -> &ErrorState {
        &self.error
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        self.scheduler.wait();
        let _ = self.backend.synchronize();
        self.accel.lock().unwrap().clear();
        self.coordinator.teardown();
        self.memory.free_all();
        cache::evict_device(self.device_key);
        self.error.clear();
    }
}

/// Contiguous split of the evaluation range, one chunk per stream, empty
/// chunks dropped.
fn split_shader_eval(work: &ShaderEvalWork, num_streams: usize) -> Vec<ShaderEvalWork> {
    let total = (work.eval_end - work.eval_start).max(0);
    if total == 0 {
        return Vec::new();
    }
    let per_stream = (total as usize).div_ceil(num_streams) as i32;
    let mut chunks = Vec::new();
    let mut start = work.eval_start;
    while start < work.eval_end {
        let end = (start + per_stream).min(work.eval_end);
        let mut chunk = work.clone();
        chunk.eval_start = start;
        chunk.eval_end = end;
        chunks.push(chunk);
        start = end;
    }
    chunks
}

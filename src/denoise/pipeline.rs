//! Denoise stage sequencing.
//!
//! Two composite algorithms, windowed non-local-means and transform-based
//! reconstruction, plus the single-purpose stages the caller composes
//! directly. Every stage checks the shared error state before launching and
//! synchronizes its stream before returning, so a failure in any stage
//! stops the sequence and later stages become no-ops.

use std::mem;
use std::sync::Arc;

use log::{debug, trace};

use crate::backend::{DeviceBackend, DevicePtr, KernelArg, LaunchDims, StreamId};
use crate::denoise::task::{DenoiseTask, NlmParams, NlmTempLayout};
use crate::error::{DeviceResult, ErrorState};
use crate::kernel;
use crate::memory::{BufferDesc, MemoryManager};

/// Feature count of the local model fitted during reconstruction.
pub const DENOISE_FEATURES: i32 = 11;
/// Floats per pixel in the transform buffer.
pub const TRANSFORM_SIZE: i32 = DENOISE_FEATURES * 3;
/// Floats per pixel in the normal-equation accumulators.
pub const XTWX_SIZE: i32 = (DENOISE_FEATURES + 1) * (DENOISE_FEATURES + 1);
pub const XTWY_SIZE: i32 = 3 * (DENOISE_FEATURES + 1);

pub struct DenoisePipeline {
    backend: Arc<dyn DeviceBackend>,
    memory: Arc<MemoryManager>,
    error: ErrorState,
    stream: StreamId,
}

impl DenoisePipeline {
    pub fn new(
        backend: Arc<dyn DeviceBackend>,
        memory: Arc<MemoryManager>,
        error: ErrorState,
        stream: StreamId,
    ) -> Self {
        Self {
            backend,
            memory,
            error,
            stream,
        }
    }

    fn stage(&self, entry: &str, dims: LaunchDims, args: &[KernelArg]) -> DeviceResult<()> {
        self.error.check()?;
        trace!("denoise stage {} on stream {}", entry, self.stream.0);
        if let Err(err) = self.backend.launch(self.stream, entry, dims, args) {
            self.error.raise(err.clone());
            return Err(err);
        }
        self.backend.synchronize_stream(self.stream)?;
        Ok(())
    }

    fn square_block(&self, entry: &str) -> u32 {
        let tpb = self.backend.max_threads_per_block(entry).max(1);
        ((tpb as f64).sqrt() as u32).max(1)
    }

    fn shifted_dims(&self, task: &DenoiseTask, params: &NlmParams, entry: &str) -> LaunchDims {
        let side = self.square_block(entry);
        LaunchDims::rect(
            task.width() as u32,
            (task.height() * params.num_shifts()) as u32,
            side,
            side,
        )
    }

    /// The NLM difference/blur/weight/blur sequence shared by the direct
    /// filter and the per-frame accumulation.
    fn nlm_weights(
        &self,
        task: &DenoiseTask,
        params: &NlmParams,
        guide: DevicePtr,
        variance: DevicePtr,
        layout: &NlmTempLayout,
        temp: DevicePtr,
        frame_offset: i32,
    ) -> DeviceResult<()> {
        let difference = layout.difference(temp);
        let blur_difference = layout.blur_difference(temp);
        let geometry = [
            KernelArg::I32(task.width()),
            KernelArg::I32(task.height()),
            KernelArg::I32(task.stride),
            KernelArg::I32(task.plane()),
        ];

        self.stage(
            kernel::KERNEL_FILTER_NLM_CALC_DIFFERENCE,
            self.shifted_dims(task, params, kernel::KERNEL_FILTER_NLM_CALC_DIFFERENCE),
            &[
                KernelArg::Ptr(guide),
                KernelArg::Ptr(variance),
                KernelArg::Ptr(DevicePtr::NULL),
                KernelArg::Ptr(difference),
                geometry[0],
                geometry[1],
                geometry[2],
                geometry[3],
                KernelArg::I32(params.r),
                KernelArg::I32(0),
                KernelArg::I32(frame_offset),
                KernelArg::F32(params.a),
                KernelArg::F32(params.k_2),
            ],
        )?;

        let blur_args = [
            KernelArg::Ptr(difference),
            KernelArg::Ptr(blur_difference),
            geometry[0],
            geometry[1],
            geometry[2],
            geometry[3],
            KernelArg::I32(params.r),
            KernelArg::I32(params.f),
        ];
        let blur_dims = self.shifted_dims(task, params, kernel::KERNEL_FILTER_NLM_BLUR);
        self.stage(kernel::KERNEL_FILTER_NLM_BLUR, blur_dims, &blur_args)?;
        self.stage(
            kernel::KERNEL_FILTER_NLM_CALC_WEIGHT,
            self.shifted_dims(task, params, kernel::KERNEL_FILTER_NLM_CALC_WEIGHT),
            &[
                KernelArg::Ptr(blur_difference),
                KernelArg::Ptr(difference),
                geometry[0],
                geometry[1],
                geometry[2],
                geometry[3],
                KernelArg::I32(params.r),
                KernelArg::I32(params.f),
            ],
        )?;
        // Second blur reuses the same argument set.
        self.stage(kernel::KERNEL_FILTER_NLM_BLUR, blur_dims, &blur_args)
    }

    /// Windowed non-local-means: filter `image` into `out` using `guide` and
    /// its `variance` for patch similarity.
    pub fn non_local_means(
        &self,
        task: &DenoiseTask,
        image: DevicePtr,
        guide: DevicePtr,
        variance: DevicePtr,
        out: DevicePtr,
        params: &NlmParams,
    ) -> DeviceResult<()> {
        self.error.check()?;
        debug!(
            "non-local means over {}x{} with r={} f={}",
            task.width(),
            task.height(),
            params.r,
            params.f
        );

        let layout = NlmTempLayout::new(task, params);
        let temp_id = self.memory.alloc(BufferDesc::working(
            "denoise_temp",
            1,
            layout.total_bytes(),
        ))?;
        let temp = self
            .memory
            .device_ptr(temp_id)
            .expect("working allocation always has a device address");

        let result = (|| {
            let plane_bytes = task.plane() as u64 * mem::size_of::<f32>() as u64;
            self.backend
                .memset_device(layout.weight_accum(temp), 0, layout.section_bytes)?;
            self.backend.memset_device(out, 0, plane_bytes)?;

            self.nlm_weights(task, params, guide, variance, &layout, temp, 0)?;

            let geometry = [
                KernelArg::I32(task.width()),
                KernelArg::I32(task.height()),
                KernelArg::I32(task.stride),
                KernelArg::I32(task.plane()),
            ];
            self.stage(
                kernel::KERNEL_FILTER_NLM_UPDATE_OUTPUT,
                self.shifted_dims(task, params, kernel::KERNEL_FILTER_NLM_UPDATE_OUTPUT),
                &[
                    KernelArg::Ptr(layout.blur_difference(temp)),
                    KernelArg::Ptr(image),
                    KernelArg::Ptr(out),
                    KernelArg::Ptr(layout.weight_accum(temp)),
                    geometry[0],
                    geometry[1],
                    geometry[2],
                    geometry[3],
                    KernelArg::I32(0),
                    KernelArg::I32(params.r),
                    KernelArg::I32(params.f),
                ],
            )?;
            let side = self.square_block(kernel::KERNEL_FILTER_NLM_NORMALIZE);
            self.stage(
                kernel::KERNEL_FILTER_NLM_NORMALIZE,
                LaunchDims::rect(task.width() as u32, task.height() as u32, side, side),
                &[
                    KernelArg::Ptr(out),
                    KernelArg::Ptr(layout.weight_accum(temp)),
                    KernelArg::I32(task.width()),
                    KernelArg::I32(task.height()),
                    KernelArg::I32(task.stride),
                ],
            )
        })();

        self.memory.free(temp_id);
        result
    }

    /// Transform-based reconstruction: fit a local model per pixel, fold
    /// every contributing frame into normal-equation accumulators, solve.
    pub fn reconstruct(
        &self,
        task: &DenoiseTask,
        color: DevicePtr,
        color_variance: DevicePtr,
        guide: DevicePtr,
        guide_variance: DevicePtr,
        output: DevicePtr,
        params: &NlmParams,
        pca_threshold: f32,
    ) -> DeviceResult<()> {
        self.error.check()?;
        let pixels = task.plane() as u64;
        let float_bytes = mem::size_of::<f32>() as u64;

        let transform = self.memory.alloc(BufferDesc::working(
            "denoise_transform",
            float_bytes,
            pixels * TRANSFORM_SIZE as u64,
        ))?;
        let rank = self.memory.alloc(BufferDesc::working(
            "denoise_rank",
            mem::size_of::<i32>() as u64,
            pixels,
        ))?;
        let xtwx = self.memory.alloc(BufferDesc::working(
            "denoise_xtwx",
            float_bytes,
            pixels * XTWX_SIZE as u64,
        ))?;
        let xtwy = self.memory.alloc(BufferDesc::working(
            "denoise_xtwy",
            float_bytes,
            pixels * XTWY_SIZE as u64,
        ))?;
        let layout = NlmTempLayout::new(task, params);
        let temp = self
            .memory
            .alloc(BufferDesc::working("denoise_temp", 1, layout.total_bytes()))?;

        let result = self.reconstruct_stages(
            task,
            color,
            color_variance,
            guide,
            guide_variance,
            output,
            params,
            pca_threshold,
            &layout,
            ReconstructBuffers {
                transform: self.memory.device_ptr(transform).unwrap_or(DevicePtr::NULL),
                rank: self.memory.device_ptr(rank).unwrap_or(DevicePtr::NULL),
                xtwx: self.memory.device_ptr(xtwx).unwrap_or(DevicePtr::NULL),
                xtwy: self.memory.device_ptr(xtwy).unwrap_or(DevicePtr::NULL),
                temp: self.memory.device_ptr(temp).unwrap_or(DevicePtr::NULL),
            },
        );

        for id in [transform, rank, xtwx, xtwy, temp] {
            self.memory.free(id);
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn reconstruct_stages(
        &self,
        task: &DenoiseTask,
        color: DevicePtr,
        color_variance: DevicePtr,
        guide: DevicePtr,
        guide_variance: DevicePtr,
        output: DevicePtr,
        params: &NlmParams,
        pca_threshold: f32,
        layout: &NlmTempLayout,
        buffers: ReconstructBuffers,
    ) -> DeviceResult<()> {
        let pixels = task.plane() as u64;
        let float_bytes = mem::size_of::<f32>() as u64;
        self.backend.memset_device(
            buffers.xtwx,
            0,
            pixels * XTWX_SIZE as u64 * float_bytes,
        )?;
        self.backend.memset_device(
            buffers.xtwy,
            0,
            pixels * XTWY_SIZE as u64 * float_bytes,
        )?;

        let tpb = self
            .backend
            .max_threads_per_block(kernel::KERNEL_FILTER_CONSTRUCT_TRANSFORM)
            .max(1);
        self.stage(
            kernel::KERNEL_FILTER_CONSTRUCT_TRANSFORM,
            LaunchDims::linear((task.width() * task.height()) as u32, tpb),
            &[
                KernelArg::Ptr(guide),
                KernelArg::Ptr(buffers.transform),
                KernelArg::Ptr(buffers.rank),
                KernelArg::I32(task.width()),
                KernelArg::I32(task.height()),
                KernelArg::I32(task.stride),
                KernelArg::I32(task.pass_stride),
                KernelArg::I32(params.r),
                KernelArg::F32(pca_threshold),
            ],
        )?;

        for &frame in &task.frames {
            let frame_offset = frame * task.frame_stride;
            self.nlm_weights(
                task,
                params,
                guide,
                guide_variance,
                layout,
                buffers.temp,
                frame_offset,
            )?;
            self.stage(
                kernel::KERNEL_FILTER_NLM_CONSTRUCT_GRAMIAN,
                self.shifted_dims(task, params, kernel::KERNEL_FILTER_NLM_CONSTRUCT_GRAMIAN),
                &[
                    KernelArg::Ptr(layout.blur_difference(buffers.temp)),
                    KernelArg::Ptr(color),
                    KernelArg::Ptr(color_variance),
                    KernelArg::Ptr(buffers.transform),
                    KernelArg::Ptr(buffers.rank),
                    KernelArg::Ptr(buffers.xtwx),
                    KernelArg::Ptr(buffers.xtwy),
                    KernelArg::I32(task.width()),
                    KernelArg::I32(task.height()),
                    KernelArg::I32(task.stride),
                    KernelArg::I32(task.plane()),
                    KernelArg::I32(params.r),
                    KernelArg::I32(params.f),
                    KernelArg::I32(frame_offset),
                ],
            )?;
        }

        let tpb = self
            .backend
            .max_threads_per_block(kernel::KERNEL_FILTER_FINALIZE)
            .max(1);
        self.stage(
            kernel::KERNEL_FILTER_FINALIZE,
            LaunchDims::linear((task.width() * task.height()) as u32, tpb),
            &[
                KernelArg::Ptr(output),
                KernelArg::Ptr(buffers.rank),
                KernelArg::Ptr(buffers.xtwx),
                KernelArg::Ptr(buffers.xtwy),
                KernelArg::Int4(task.filter_area),
                KernelArg::I32(task.width()),
                KernelArg::I32(task.stride),
                KernelArg::I32(task.sample),
            ],
        )
    }

    /// Merge two half-sample buffers into mean and variance estimates.
    pub fn combine_halves(
        &self,
        task: &DenoiseTask,
        mean: DevicePtr,
        variance: DevicePtr,
        a: DevicePtr,
        b: DevicePtr,
        r: i32,
    ) -> DeviceResult<()> {
        let side = self.square_block(kernel::KERNEL_FILTER_COMBINE_HALVES);
        self.stage(
            kernel::KERNEL_FILTER_COMBINE_HALVES,
            LaunchDims::rect(task.width() as u32, task.height() as u32, side, side),
            &[
                KernelArg::Ptr(mean),
                KernelArg::Ptr(variance),
                KernelArg::Ptr(a),
                KernelArg::Ptr(b),
                KernelArg::Int4(task.rect),
                KernelArg::I32(r),
            ],
        )
    }

    /// Split the shadow-catcher pass into variance-tracked buffers.
    #[allow(clippy::too_many_arguments)]
    pub fn divide_shadow(
        &self,
        task: &DenoiseTask,
        a: DevicePtr,
        b: DevicePtr,
        sample_variance: DevicePtr,
        sv_variance: DevicePtr,
        buffer_variance: DevicePtr,
    ) -> DeviceResult<()> {
        let side = self.square_block(kernel::KERNEL_FILTER_DIVIDE_SHADOW);
        self.stage(
            kernel::KERNEL_FILTER_DIVIDE_SHADOW,
            LaunchDims::rect(task.width() as u32, task.height() as u32, side, side),
            &[
                KernelArg::I32(task.sample),
                KernelArg::Ptr(a),
                KernelArg::Ptr(b),
                KernelArg::Ptr(sample_variance),
                KernelArg::Ptr(sv_variance),
                KernelArg::Ptr(buffer_variance),
                KernelArg::Int4(task.rect),
                KernelArg::I32(task.buffer_pass_stride),
                KernelArg::I32(task.buffer_denoising_offset),
            ],
        )
    }

    /// Extract one render-pass feature into mean/variance buffers.
    pub fn get_feature(
        &self,
        task: &DenoiseTask,
        mean_offset: i32,
        variance_offset: i32,
        mean: DevicePtr,
        variance: DevicePtr,
        scale: f32,
    ) -> DeviceResult<()> {
        let side = self.square_block(kernel::KERNEL_FILTER_GET_FEATURE);
        self.stage(
            kernel::KERNEL_FILTER_GET_FEATURE,
            LaunchDims::rect(task.width() as u32, task.height() as u32, side, side),
            &[
                KernelArg::I32(task.sample),
                KernelArg::I32(mean_offset),
                KernelArg::I32(variance_offset),
                KernelArg::Ptr(mean),
                KernelArg::Ptr(variance),
                KernelArg::F32(scale),
                KernelArg::Int4(task.rect),
                KernelArg::I32(task.buffer_pass_stride),
                KernelArg::I32(task.buffer_denoising_offset),
            ],
        )
    }

    /// Write a filtered feature back into the render buffer.
    pub fn write_feature(
        &self,
        task: &DenoiseTask,
        out_offset: i32,
        from: DevicePtr,
        buffer: DevicePtr,
    ) -> DeviceResult<()> {
        let side = self.square_block(kernel::KERNEL_FILTER_WRITE_FEATURE);
        self.stage(
            kernel::KERNEL_FILTER_WRITE_FEATURE,
            LaunchDims::rect(
                task.filter_area[2] as u32,
                task.filter_area[3] as u32,
                side,
                side,
            ),
            &[
                KernelArg::I32(out_offset),
                KernelArg::Int4(task.rect),
                KernelArg::Ptr(from),
                KernelArg::Ptr(buffer),
                KernelArg::Int4(task.filter_area),
                KernelArg::I32(task.stride),
            ],
        )
    }

    /// Flag outlier pixels from image, variance and depth.
    pub fn detect_outliers(
        &self,
        task: &DenoiseTask,
        image: DevicePtr,
        variance: DevicePtr,
        depth: DevicePtr,
        out: DevicePtr,
    ) -> DeviceResult<()> {
        let side = self.square_block(kernel::KERNEL_FILTER_DETECT_OUTLIERS);
        self.stage(
            kernel::KERNEL_FILTER_DETECT_OUTLIERS,
            LaunchDims::rect(task.width() as u32, task.height() as u32, side, side),
            &[
                KernelArg::Ptr(image),
                KernelArg::Ptr(variance),
                KernelArg::Ptr(depth),
                KernelArg::Ptr(out),
                KernelArg::Int4(task.rect),
                KernelArg::I32(task.pass_stride),
            ],
        )
    }
}

#[derive(Clone, Copy)]
struct ReconstructBuffers {
    transform: DevicePtr,
    rank: DevicePtr,
    xtwx: DevicePtr,
    xtwy: DevicePtr,
    temp: DevicePtr,
}

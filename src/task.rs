//! Work submitted by the renderer: render tiles, shader evaluation batches
//! and film conversion, plus the cancellation contract shared by all three.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::backend::DevicePtr;

/// One rectangle of the frame being sampled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderTile {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    /// Next sample to render.
    pub sample: u32,
    pub start_sample: u32,
    pub num_samples: u32,
    /// Linear offset and row stride of this tile inside the render buffer.
    pub offset: i32,
    pub stride: i32,
    pub buffer: DevicePtr,
}

impl RenderTile {
    pub fn end_sample(&self) -> u32 {
        self.start_sample + self.num_samples
    }
}

/// Source of tiles for a render task. Workers on different streams pull
/// tiles concurrently; a tile is owned by one worker from acquire to
/// release.
pub trait RenderWork: Send + Sync {
    fn acquire_tile(&self) -> Option<RenderTile>;
    fn release_tile(&self, tile: RenderTile);
    /// `pixel_samples` counts pixels times samples completed since the last
    /// report.
    fn update_progress(&self, tile: Option<&RenderTile>, pixel_samples: u64);
    fn cancelled(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderEvalKind {
    Displace,
    Background,
    Bake,
}

/// Shader evaluation over a linear range of input points.
#[derive(Debug, Clone)]
pub struct ShaderEvalWork {
    pub kind: ShaderEvalKind,
    pub input: DevicePtr,
    pub output: DevicePtr,
    pub eval_start: i32,
    pub eval_end: i32,
    pub num_samples: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvertKind {
    Byte,
    HalfFloat,
}

/// Tone-map / convert the accumulated render buffer for display or output.
#[derive(Debug, Clone)]
pub struct FilmConvertWork {
    pub kind: ConvertKind,
    pub buffer: DevicePtr,
    pub dst: DevicePtr,
    pub sample: u32,
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    pub offset: i32,
    pub stride: i32,
}

pub enum TaskPayload {
    Render {
        work: Arc<dyn RenderWork>,
        /// Interactive display shrinks the per-launch sample batch.
        interactive: bool,
    },
    ShaderEval(ShaderEvalWork),
    FilmConvert(FilmConvertWork),
}

/// Progress callback for work without a tile context.
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

/// One submission to the device. Cloned across stream sub-tasks; the cancel
/// flag is shared.
#[derive(Clone)]
pub struct DeviceTask {
    pub payload: Arc<TaskPayload>,
    cancel: Arc<AtomicBool>,
    /// When set, cancellation does not cut the sample range short.
    pub finish_queue: bool,
    progress: Option<ProgressFn>,
}

impl DeviceTask {
    pub fn new(payload: TaskPayload) -> Self {
        Self {
            payload: Arc::new(payload),
            cancel: Arc::new(AtomicBool::new(false)),
            finish_queue: false,
            progress: None,
        }
    }

    pub fn with_finish_queue(mut self, finish_queue: bool) -> Self {
        self.finish_queue = finish_queue;
        self
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn report_progress(&self, amount: u64) {
        if let Some(progress) = &self.progress {
            progress(amount);
        }
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn cancel_requested(&self) -> bool {
        if self.cancel.load(Ordering::SeqCst) {
            return true;
        }
        match &*self.payload {
            TaskPayload::Render { work, .. } => work.cancelled(),
            _ => false,
        }
    }
}

/// Splits a frame into tiles, row-major.
pub fn split_tiles(
    width: u32,
    height: u32,
    tile_size: u32,
    start_sample: u32,
    num_samples: u32,
    stride: i32,
    buffer: DevicePtr,
) -> Vec<RenderTile> {
    assert!(tile_size > 0);
    let mut tiles = Vec::new();
    let mut y = 0;
    while y < height {
        let h = tile_size.min(height - y);
        let mut x = 0;
        while x < width {
            let w = tile_size.min(width - x);
            // Pixel (px, py) lives at buffer index offset + px + py * stride;
            // a whole-frame buffer needs no per-tile bias.
            tiles.push(RenderTile {
                x,
                y,
                w,
                h,
                sample: start_sample,
                start_sample,
                num_samples,
                offset: 0,
                stride,
                buffer,
            });
            x += tile_size;
        }
        y += tile_size;
    }
    tiles
}

/// Shared queue of tiles with completion accounting. The standard
/// `RenderWork` used by the context; renderers with their own tile
/// management implement the trait directly.
pub struct TileQueue {
    pending: Mutex<VecDeque<RenderTile>>,
    finished: Mutex<Vec<RenderTile>>,
    progress: AtomicU64,
    cancel: AtomicBool,
}

impl TileQueue {
    pub fn new(tiles: Vec<RenderTile>) -> Self {
        Self {
            pending: Mutex::new(tiles.into()),
            finished: Mutex::new(Vec::new()),
            progress: AtomicU64::new(0),
            cancel: AtomicBool::new(false),
        }
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Total pixel-samples reported so far.
    pub fn progress(&self) -> u64 {
        self.progress.load(Ordering::SeqCst)
    }

    pub fn finished_tiles(&self) -> Vec<RenderTile> {
        self.finished.lock().unwrap().clone()
    }
}

impl RenderWork for TileQueue {
    fn acquire_tile(&self) -> Option<RenderTile> {
        self.pending.lock().unwrap().pop_front()
    }

    fn release_tile(&self, tile: RenderTile) {
        self.finished.lock().unwrap().push(tile);
    }

    fn update_progress(&self, _tile: Option<&RenderTile>, pixel_samples: u64) {
        self.progress.fetch_add(pixel_samples, Ordering::SeqCst);
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

//! Sample batching, cancellation and stream fan-out through the context.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use raydev::backend::software::{SoftwareBackend, SoftwareConfig};
use raydev::backend::{DevicePtr, KernelArg};
use raydev::kernel::{self, DeviceKey};
use raydev::task::{
    DeviceTask, RenderTile, RenderWork, ShaderEvalKind, ShaderEvalWork, TaskPayload, TileQueue,
    split_tiles,
};
use raydev::{DeviceConfig, DeviceContext, SchedulerConfig};

fn context(num_streams: usize) -> (Arc<SoftwareBackend>, DeviceContext) {
    let _ = env_logger::builder().is_test(true).try_init();
    let backend = Arc::new(SoftwareBackend::new(SoftwareConfig::default()));
    let config = DeviceConfig {
        scheduler: SchedulerConfig { num_streams },
        ..Default::default()
    };
    let context = DeviceContext::new(
        backend.clone(),
        config,
        DeviceKey {
            platform_id: 0,
            device_id: 1,
        },
    )
    .unwrap();
    (backend, context)
}

/// Tile source that records every progress report.
struct RecordingWork {
    inner: TileQueue,
    reports: Mutex<Vec<u64>>,
    cancel_after_first: AtomicBool,
}

impl RecordingWork {
    fn new(tiles: Vec<RenderTile>) -> Self {
        Self {
            inner: TileQueue::new(tiles),
            reports: Mutex::new(Vec::new()),
            cancel_after_first: AtomicBool::new(false),
        }
    }
}

impl RenderWork for RecordingWork {
    fn acquire_tile(&self) -> Option<RenderTile> {
        self.inner.acquire_tile()
    }

    fn release_tile(&self, tile: RenderTile) {
        self.inner.release_tile(tile);
    }

    fn update_progress(&self, tile: Option<&RenderTile>, pixel_samples: u64) {
        self.reports.lock().unwrap().push(pixel_samples);
        if self.cancel_after_first.load(Ordering::SeqCst) {
            self.inner.cancel();
        }
        self.inner.update_progress(tile, pixel_samples);
    }

    fn cancelled(&self) -> bool {
        self.inner.cancelled()
    }
}

#[test]
fn forty_samples_run_as_two_batches() {
    let (backend, context) = context(2);
    let tiles = split_tiles(32, 32, 32, 0, 40, 32, DevicePtr(0x2000));
    let work = Arc::new(RecordingWork::new(tiles));
    let task = DeviceTask::new(TaskPayload::Render {
        work: work.clone(),
        interactive: false,
    });

    backend.clear_launches();
    context.task_add(task);
    context.wait();

    let launches = backend.launches();
    assert_eq!(launches.len(), 2);
    assert!(launches
        .iter()
        .all(|l| l.entry == kernel::KERNEL_PATH_TRACE));

    // Batch of 32 samples then the 8-sample remainder.
    let reports = work.reports.lock().unwrap().clone();
    assert_eq!(reports, vec![32 * 32 * 32, 32 * 32 * 8]);
    assert_eq!(work.inner.progress(), 32 * 32 * 40);
    assert_eq!(work.inner.finished_tiles().len(), 1);
}

#[test]
fn cancellation_halts_before_next_batch() {
    let (backend, context) = context(1);
    let tiles = split_tiles(16, 16, 16, 0, 64, 16, DevicePtr(0x2000));
    let work = Arc::new(RecordingWork::new(tiles));
    work.cancel_after_first.store(true, Ordering::SeqCst);
    let task = DeviceTask::new(TaskPayload::Render {
        work: work.clone(),
        interactive: false,
    });

    backend.clear_launches();
    context.task_add(task);
    context.wait();

    // The first 32-sample batch completes, the second is never issued.
    assert_eq!(backend.launches().len(), 1);
    assert_eq!(work.inner.progress(), 16 * 16 * 32);
}

#[test]
fn finish_queue_overrides_cancellation() {
    let (backend, context) = context(1);
    let tiles = split_tiles(16, 16, 16, 0, 64, 16, DevicePtr(0x2000));
    let work = Arc::new(RecordingWork::new(tiles));
    work.cancel_after_first.store(true, Ordering::SeqCst);
    let task = DeviceTask::new(TaskPayload::Render {
        work: work.clone(),
        interactive: false,
    })
    .with_finish_queue(true);

    backend.clear_launches();
    context.task_add(task);
    context.wait();

    // 64 samples in batches of 32, the full range despite cancellation.
    assert_eq!(backend.launches().len(), 2);
    assert_eq!(work.inner.progress(), 16 * 16 * 64);
}

#[test]
fn shader_eval_fans_out_across_streams() {
    let (backend, context) = context(2);
    let work = ShaderEvalWork {
        kind: ShaderEvalKind::Bake,
        input: DevicePtr(0x3000),
        output: DevicePtr(0x4000),
        eval_start: 0,
        eval_end: 1000,
        num_samples: 1,
    };
    backend.clear_launches();
    context.task_add(DeviceTask::new(TaskPayload::ShaderEval(work)));
    context.wait();

    let launches = backend.launches();
    assert_eq!(launches.len(), 2);
    assert!(launches.iter().all(|l| l.entry == kernel::KERNEL_BAKE));

    let mut streams: Vec<usize> = launches.iter().map(|l| l.stream).collect();
    streams.sort_unstable();
    assert_eq!(streams, vec![0, 1]);

    // Each stream reads its own parameter slice.
    let slices: Vec<DevicePtr> = launches
        .iter()
        .map(|l| match l.args[0] {
            KernelArg::Ptr(p) => p,
            ref other => panic!("expected pointer argument, got {other:?}"),
        })
        .collect();
    assert_ne!(slices[0], slices[1]);
}

#[test]
fn streams_pull_tiles_concurrently() {
    let (backend, context) = context(2);
    // Four tiles, two streams; every tile must be rendered exactly once.
    let tiles = split_tiles(64, 64, 32, 0, 8, 64, DevicePtr(0x2000));
    let queue = Arc::new(TileQueue::new(tiles));
    let task = DeviceTask::new(TaskPayload::Render {
        work: queue.clone(),
        interactive: false,
    });

    backend.clear_launches();
    context.task_add(task);
    context.wait();

    assert_eq!(queue.finished_tiles().len(), 4);
    assert_eq!(backend.launches().len(), 4); // 8 samples fit one batch each
    assert_eq!(queue.progress(), 64 * 64 * 8);
}

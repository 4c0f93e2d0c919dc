//! Fan-out of logical work units across a fixed set of execution streams.
//!
//! Stream `i` is serviced by its own single-worker queue, so sub-tasks
//! tagged `StreamId(i)` run strictly one after another even when submissions
//! overlap. Callers own the splitting policy and hand in at most one closure
//! per stream per submission.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;

use crate::backend::StreamId;
use crate::config::SchedulerConfig;
use crate::sched::pool::ThreadPool;

pub struct StreamScheduler {
    streams: Vec<ThreadPool>,
    cancel: Arc<AtomicBool>,
}

impl StreamScheduler {
    pub fn new(config: &SchedulerConfig) -> Self {
        let num_streams = config.num_streams.max(1);
        debug!("stream scheduler with {} streams", num_streams);
        Self {
            streams: (0..num_streams).map(|_| ThreadPool::new(1)).collect(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn num_streams(&self) -> usize {
        self.streams.len()
    }

    /// Enqueue one sub-task per stream. Sub-tasks beyond the stream count are
    /// rejected by splitting policy upstream, so the length is asserted.
    ///
    /// Each stream has one worker of its own, so a sub-task for stream `i`
    /// never starts before earlier sub-tasks on that stream have finished,
    /// and the per-stream launch parameter slice stays single-writer.
    pub fn submit<F>(&self, subtasks: Vec<F>)
    where
        F: FnOnce(StreamId) + Send + 'static,
    {
        assert!(subtasks.len() <= self.streams.len());
        for (index, subtask) in subtasks.into_iter().enumerate() {
            let cancel = Arc::clone(&self.cancel);
            self.streams[index].execute(move || {
                // Not-yet-started sub-tasks observe cancellation here;
                // in-flight ones poll their task's own flag.
                if cancel.load(Ordering::SeqCst) {
                    return;
                }
                subtask(StreamId(index));
            });
        }
    }

    /// Block until all queued sub-tasks complete, then clear any pending
    /// cancellation so the next submission starts fresh.
    pub fn wait(&self) {
        for stream in &self.streams {
            stream.wait();
        }
        self.cancel.store(false, Ordering::SeqCst);
    }

    /// Drop sub-tasks that have not started yet, including ones submitted
    /// after this call and before the next `wait`. In-flight sub-tasks
    /// finish on their own cancellation checks.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn scheduler(num_streams: usize) -> StreamScheduler {
        StreamScheduler::new(&SchedulerConfig { num_streams })
    }

    #[test]
    fn zero_streams_clamps_to_one() {
        assert_eq!(scheduler(0).num_streams(), 1);
    }

    #[test]
    fn subtasks_see_distinct_stream_indices() {
        let sched = scheduler(4);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let subtasks: Vec<_> = (0..4)
            .map(|_| {
                let seen = Arc::clone(&seen);
                move |stream: StreamId| {
                    seen.lock().unwrap().push(stream.0);
                }
            })
            .collect();
        sched.submit(subtasks);
        sched.wait();

        let mut indices = seen.lock().unwrap().clone();
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn wait_drains_all_submissions() {
        let sched = scheduler(2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            sched.submit(vec![move |_stream: StreamId| {
                counter.fetch_add(1, Ordering::SeqCst);
            }]);
        }
        sched.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn same_stream_submissions_never_overlap() {
        let sched = scheduler(2);
        let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();
        let order = Arc::new(Mutex::new(Vec::new()));

        // First stream-0 sub-task blocks until released.
        let first_order = Arc::clone(&order);
        sched.submit(vec![move |_stream: StreamId| {
            gate_rx.recv().unwrap();
            first_order.lock().unwrap().push("first");
        }]);
        // Second submission targets stream 0 while the first is in flight.
        let second_order = Arc::clone(&order);
        sched.submit(vec![move |_stream: StreamId| {
            second_order.lock().unwrap().push("second");
        }]);

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(order.lock().unwrap().is_empty());

        gate_tx.send(()).unwrap();
        sched.wait();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn cancellation_holds_until_wait() {
        let sched = scheduler(1);
        let ran = Arc::new(AtomicUsize::new(0));

        sched.cancel();
        let counter = Arc::clone(&ran);
        sched.submit(vec![move |_stream: StreamId| {
            counter.fetch_add(1, Ordering::SeqCst);
        }]);
        sched.wait();
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        // wait() rearmed the scheduler.
        let counter = Arc::clone(&ran);
        sched.submit(vec![move |_stream: StreamId| {
            counter.fetch_add(1, Ordering::SeqCst);
        }]);
        sched.wait();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}

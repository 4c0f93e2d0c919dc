use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread;

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size worker pool over one shared job channel.
pub(crate) struct ThreadPool {
    workers: Vec<Worker>,
    sender: Option<mpsc::Sender<Job>>,
    pending: Arc<(Mutex<usize>, Condvar)>,
}

struct Worker {
    #[allow(dead_code)]
    id: usize,
    handle: Option<thread::JoinHandle<()>>,
}

impl ThreadPool {
    pub(crate) fn new(size: usize) -> ThreadPool {
        assert!(size > 0);

        let (sender, receiver) = mpsc::channel();
        let receiver = Arc::new(Mutex::new(receiver));
        let pending = Arc::new((Mutex::new(0usize), Condvar::new()));

        let mut workers = Vec::with_capacity(size);
        for id in 0..size {
            workers.push(Worker::new(id, Arc::clone(&receiver)));
        }

        ThreadPool {
            workers,
            sender: Some(sender),
            pending,
        }
    }

    pub(crate) fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let (count, _) = &*self.pending;
            *count.lock().unwrap() += 1;
        }
        let pending = Arc::clone(&self.pending);
        let job: Job = Box::new(move || {
            f();
            let (count, done) = &*pending;
            *count.lock().unwrap() -= 1;
            done.notify_all();
        });
        // Send only fails after shutdown, when no work is accepted anyway.
        if let Some(sender) = &self.sender {
            if sender.send(job).is_err() {
                let (count, done) = &*self.pending;
                *count.lock().unwrap() -= 1;
                done.notify_all();
            }
        }
    }

    /// Block until every queued job has run to completion.
    pub(crate) fn wait(&self) {
        let (count, done) = &*self.pending;
        let mut count = count.lock().unwrap();
        while *count > 0 {
            count = done.wait(count).unwrap();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // Closing the channel stops the workers once the queue drains.
        drop(self.sender.take());

        for worker in &mut self.workers {
            if let Some(handle) = worker.handle.take() {
                handle
                    .join()
                    .unwrap_or_else(|_| eprintln!("Worker thread panicked"));
            }
        }
    }
}

impl Worker {
    fn new(id: usize, receiver: Arc<Mutex<mpsc::Receiver<Job>>>) -> Worker {
        let handle = thread::spawn(move || loop {
            let receiver = receiver.lock().unwrap();
            match receiver.recv() {
                Ok(job) => {
                    drop(receiver); // Release lock before executing
                    job();
                }
                Err(_) => break, // Channel closed
            }
        });

        Worker {
            id,
            handle: Some(handle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn wait_observes_all_jobs() {
        let pool = ThreadPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..32 {
            let counter = Arc::clone(&counter);
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn drop_joins_workers() {
        let pool = ThreadPool::new(2);
        pool.execute(|| {});
        drop(pool);
    }
}

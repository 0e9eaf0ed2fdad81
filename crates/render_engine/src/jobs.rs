//! Background job execution and completion tracking
//!
//! Pipeline compilation, shader loading and upload packaging all run off the
//! critical path on a small worker pool. Completion is observed through
//! [`WaitGroup`]s; there is no in-flight cancellation, shutdown drains.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

/// Cooperative completion counter.
///
/// A wait group starts with a count of zero and is considered signaled
/// whenever the count is zero. Producers call [`WaitGroup::add`] before
/// scheduling work and [`WaitGroup::done`] when it finishes; consumers block
/// in [`WaitGroup::wait`].
pub struct WaitGroup {
    counter: Mutex<u64>,
    condvar: Condvar,
}

impl WaitGroup {
    /// Create a signaled wait group (count zero)
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            counter: Mutex::new(0),
            condvar: Condvar::new(),
        })
    }

    /// Create a wait group with an initial count
    pub fn with_count(count: u64) -> Arc<Self> {
        Arc::new(Self {
            counter: Mutex::new(count),
            condvar: Condvar::new(),
        })
    }

    /// Increment the pending count by `n`
    pub fn add(&self, n: u64) {
        let mut counter = self.counter.lock();
        *counter += n;
    }

    /// Mark one unit of work as finished, waking waiters at zero
    pub fn done(&self) {
        let mut counter = self.counter.lock();
        assert!(*counter > 0, "WaitGroup::done called more times than add");
        *counter -= 1;
        if *counter == 0 {
            self.condvar.notify_all();
        }
    }

    /// Block until the count reaches zero
    pub fn wait(&self) {
        let mut counter = self.counter.lock();
        while *counter != 0 {
            self.condvar.wait(&mut counter);
        }
    }

    /// Non-blocking signaled check
    pub fn is_signaled(&self) -> bool {
        *self.counter.lock() == 0
    }
}

enum JobMessage {
    Run(Box<dyn FnOnce() + Send + 'static>),
    Exit,
}

/// Fixed-size worker pool for background jobs.
///
/// Jobs are opaque closures; anything that needs a completion handshake
/// pairs the closure with a [`WaitGroup`].
pub struct JobSystem {
    sender: Sender<JobMessage>,
    workers: Vec<JoinHandle<()>>,
}

impl JobSystem {
    /// Spawn `worker_count` worker threads (at least one)
    pub fn new(worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        let (sender, receiver) = unbounded::<JobMessage>();

        let workers = (0..worker_count)
            .map(|index| {
                let receiver: Receiver<JobMessage> = receiver.clone();
                std::thread::Builder::new()
                    .name(format!("gfx-job-{index}"))
                    .spawn(move || {
                        while let Ok(message) = receiver.recv() {
                            match message {
                                JobMessage::Run(job) => job(),
                                JobMessage::Exit => break,
                            }
                        }
                    })
                    .expect("failed to spawn job worker thread")
            })
            .collect();

        Self { sender, workers }
    }

    /// Enqueue a job for execution on any worker
    pub fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        // Send only fails after shutdown; jobs scheduled that late are dropped.
        if self.sender.send(JobMessage::Run(Box::new(job))).is_err() {
            log::warn!("job scheduled after job system shutdown was dropped");
        }
    }

    /// Request exit and join every worker
    pub fn shutdown(&mut self) {
        for _ in &self.workers {
            let _ = self.sender.send(JobMessage::Exit);
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for JobSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_wait_group_starts_signaled() {
        let wg = WaitGroup::new();
        assert!(wg.is_signaled());
        wg.wait();
    }

    #[test]
    fn test_wait_group_signals_at_zero() {
        let wg = WaitGroup::with_count(2);
        assert!(!wg.is_signaled());
        wg.done();
        assert!(!wg.is_signaled());
        wg.done();
        assert!(wg.is_signaled());
    }

    #[test]
    fn test_jobs_run_and_signal() {
        let jobs = JobSystem::new(2);
        let counter = Arc::new(AtomicU32::new(0));
        let wg = WaitGroup::with_count(16);

        for _ in 0..16 {
            let counter = Arc::clone(&counter);
            let wg = Arc::clone(&wg);
            jobs.spawn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                wg.done();
            });
        }

        wg.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn test_shutdown_joins_workers() {
        let mut jobs = JobSystem::new(4);
        let wg = WaitGroup::with_count(1);
        {
            let wg = Arc::clone(&wg);
            jobs.spawn(move || wg.done());
        }
        wg.wait();
        jobs.shutdown();
    }
}

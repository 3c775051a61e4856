use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of named worker threads fed from one job queue.
///
/// Jobs beyond the number of workers wait in the queue until a worker frees
/// up; nothing is ever spawned on demand.
pub struct WorkerPool {
    name: &'static str,
    job_sender: Option<mpsc::Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    active_count: Arc<AtomicUsize>,
}

/// Completion handle of a submitted job.
pub struct JobHandle {
    done: mpsc::Receiver<()>,
}

impl JobHandle {
    /// Waits until the job finished (or was dropped unrun). Returns `false`
    /// on timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        match self.done.recv_timeout(timeout) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => true,
            Err(mpsc::RecvTimeoutError::Timeout) => false,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.done.try_recv(),
            Ok(()) | Err(mpsc::TryRecvError::Disconnected)
        )
    }
}

impl WorkerPool {
    pub fn new(name: &'static str, size: usize) -> anyhow::Result<Self> {
        let (job_sender, job_receiver) = mpsc::channel::<Job>();
        let job_receiver = Arc::new(Mutex::new(job_receiver));
        let active_count = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let receiver = job_receiver.clone();
            let active = active_count.clone();
            let worker = thread::Builder::new()
                .name(format!("{}-{}", name, index))
                .spawn(move || Self::worker_loop(name, receiver, active))
                .map_err(|e| anyhow::anyhow!("Failed to spawn {} worker {}: {}", name, index, e))?;
            workers.push(worker);
        }

        log::debug!("Started {} pool with {} worker(s)", name, size);

        Ok(Self {
            name,
            job_sender: Some(job_sender),
            workers,
            active_count,
        })
    }

    fn worker_loop(name: &'static str, receiver: Arc<Mutex<mpsc::Receiver<Job>>>, active: Arc<AtomicUsize>) {
        loop {
            // Only hold the queue lock while waiting for the next job
            let job = {
                let receiver = receiver.lock().unwrap_or_else(PoisonError::into_inner);
                receiver.recv()
            };
            let Ok(job) = job else {
                break;
            };

            active.fetch_add(1, Ordering::SeqCst);
            if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                log::error!("Job on {} pool panicked", name);
            }
            active.fetch_sub(1, Ordering::SeqCst);
        }
        log::debug!("{} worker exiting", name);
    }

    /// Queues `job`. Returns `None` if the pool is shutting down.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> Option<JobHandle> {
        let sender = self.job_sender.as_ref()?;
        let (done_tx, done_rx) = mpsc::channel();

        let wrapped: Job = Box::new(move || {
            job();
            let _ = done_tx.send(());
        });

        if let Err(e) = sender.send(wrapped) {
            log::error!("Failed to submit job to {} pool: {}", self.name, e);
            return None;
        }
        Some(JobHandle { done: done_rx })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Number of jobs currently executing.
    pub fn active_count(&self) -> usize {
        self.active_count.load(Ordering::SeqCst)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the queue lets idle workers exit
        self.job_sender = None;
        let current = thread::current().id();
        for worker in self.workers.drain(..) {
            if worker.thread().id() == current {
                continue;
            }
            let _ = worker.join();
        }
    }
}

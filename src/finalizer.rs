//! Asynchronous end-of-job processing.
//!
//! Ended jobs are pushed by the scheduler (usually from whichever worker rendered the last
//! tile) into a bounded queue. A single background thread drains the queue, saves output
//! images, runs the jobs' callbacks and keeps the summaries around for later queries.

use std::{
    collections::HashMap,
    num::NonZeroUsize,
    sync::{
        Arc, Mutex, MutexGuard, RwLock, Weak,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};

use crate::{
    job::{JobEndReason, JobId, JobSummary, JobToFinalize},
    scheduler::JobRegistry,
};

#[derive(Copy, Clone, Debug)]
pub struct FinalizerSettings {
    /// Maximum number of ended jobs waiting for the consumer.
    /// Pushing into a full queue spins until the consumer catches up.
    pub queue_capacity: NonZeroUsize,
    /// Longest time the consumer sleeps between checks for work or a stop request.
    pub poll_interval: Duration,
    /// Write targets of completed jobs that have a path to disk.
    pub save_targets: bool,
}

impl Default for FinalizerSettings {
    fn default() -> Self {
        FinalizerSettings {
            queue_capacity: NonZeroUsize::new(1024).expect("1024 is non-zero"),
            poll_interval: Duration::from_millis(50),
            save_targets: true,
        }
    }
}

pub struct Finalizer {
    settings: FinalizerSettings,
    sender: Sender<JobToFinalize>,
    shared: Arc<Shared>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

/// State the consumer thread works with.
struct Shared {
    receiver: Receiver<JobToFinalize>,
    running: AtomicBool,
    summaries: Mutex<HashMap<JobId, JobSummary>>,
    registry: RwLock<Option<Weak<dyn JobRegistry>>>,
    save_targets: bool,
}

impl Finalizer {
    pub fn new(settings: FinalizerSettings) -> Self {
        let (sender, receiver) = crossbeam_channel::bounded(settings.queue_capacity.get());
        Finalizer {
            settings,
            sender,
            shared: Arc::new(Shared {
                receiver,
                running: AtomicBool::new(false),
                summaries: Mutex::new(HashMap::new()),
                registry: RwLock::new(None),
                save_targets: settings.save_targets,
            }),
            consumer: Mutex::new(None),
        }
    }

    /// Queues an ended job for finalization.
    ///
    /// Never drops the job: if the queue is full this yields and retries until the consumer
    /// makes room.
    pub fn push(&self, job: JobToFinalize) {
        let mut job = job;
        let mut overrun_logged = false;

        loop {
            match self.sender.try_send(job) {
                Ok(()) => return,
                Err(TrySendError::Full(returned)) => {
                    if !overrun_logged {
                        log::warn!(
                            "finalizer queue overrun while pushing job {}, consider a larger queue",
                            returned.summary.id
                        );
                        overrun_logged = true;
                    }
                    job = returned;
                    thread::yield_now();
                }
                Err(TrySendError::Disconnected(returned)) => {
                    // The receiver lives as long as we do
                    log::error!(
                        "finalizer queue disconnected, dropping job {}",
                        returned.summary.id
                    );
                    return;
                }
            }
        }
    }

    /// Starts the consumer thread, does nothing if it is already running.
    pub fn start(&self) {
        let mut consumer = self.consumer.lock().expect("Poisoned lock!");
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!("finalizer starting");

        let shared = Arc::clone(&self.shared);
        let poll_interval = self.settings.poll_interval;
        let spawned = thread::Builder::new()
            .name("finalizer".into())
            .spawn(move || shared.run(poll_interval));

        match spawned {
            Ok(handle) => *consumer = Some(handle),
            Err(e) => {
                log::error!("failed to spawn finalizer thread: {e}");
                self.shared.running.store(false, Ordering::Release);
            }
        }
    }

    /// Stops and joins the consumer thread, does nothing if it is not running.
    ///
    /// Jobs that are already queued when this is called get finalized before the thread exits.
    pub fn stop(&self) {
        let mut consumer = self.consumer.lock().expect("Poisoned lock!");
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        log::debug!("finalizer stopping");

        let Some(handle) = consumer.take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            // Dropped from inside the consumer, the loop exits on its own after the current job
            return;
        }
        if handle.join().is_err() {
            log::error!("finalizer thread panicked");
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Summary of a finalized job.
    ///
    /// Returns `None` until the consumer actually processed the job.
    pub fn get_summary(&self, id: JobId) -> Option<JobSummary> {
        self.shared.summaries().get(&id).cloned()
    }

    /// Number of summaries stored so far.
    pub fn finalized_count(&self) -> usize {
        self.shared.summaries().len()
    }

    /// Jobs waiting in the queue.
    pub fn pending(&self) -> usize {
        self.sender.len()
    }

    /// Remembers the registry the job states of finalized jobs are erased from.
    pub fn attach_registry(&self, registry: Weak<dyn JobRegistry>) {
        *self.shared.registry.write().expect("Poisoned lock!") = Some(registry);
    }
}

impl Drop for Finalizer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn run(&self, poll_interval: Duration) {
        log::debug!("finalizer running");

        while self.running.load(Ordering::Acquire) {
            match self.receiver.recv_timeout(poll_interval) {
                Ok(job) => {
                    self.finalize(job);
                    self.finalize_all();
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.finalize_all();

        log::debug!("finalizer stopped");
    }

    /// Finalizes everything currently in the queue.
    fn finalize_all(&self) {
        loop {
            match self.receiver.try_recv() {
                Ok(job) => self.finalize(job),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => return,
            }
        }
    }

    fn finalize(&self, job: JobToFinalize) {
        let JobToFinalize { summary, callback } = job;
        let id = summary.id;
        log::info!("finalizing job {id} ({:?})", summary.end_reason);

        if self.save_targets && summary.end_reason == JobEndReason::Completed {
            if let Some(path) = summary.target.path() {
                match summary.target.save_to(path) {
                    Ok(()) => log::info!("saved job {id} to {}", path.display()),
                    Err(e) => log::error!("failed to save job {id} to {}: {e}", path.display()),
                }
            }
        }

        if let Some(callback) = callback {
            callback(&summary);
        }

        let previous = self.summaries().insert(id, summary);
        if previous.is_some() {
            log::warn!("duplicate job summary with id {id} in finalizer");
        }

        let registry = self
            .registry
            .read()
            .expect("Poisoned lock!")
            .as_ref()
            .and_then(Weak::upgrade);
        if let Some(registry) = registry {
            registry.erase_job_state(id);
        }
    }

    fn summaries(&self) -> MutexGuard<'_, HashMap<JobId, JobSummary>> {
        self.summaries.lock().expect("Poisoned lock!")
    }
}

//! The brain of the render system.
//!
//! The scheduler owns a priority queue of pending tiles and the registry of in-flight jobs.
//! Workers pull tiles highest priority first and report them back when rendered. When the last
//! tile of a job is accounted for, the job is packaged into a summary and pushed to the attached
//! [`Finalizer`].

use std::{
    cmp::Ordering as CmpOrdering,
    collections::{BinaryHeap, HashMap},
    num::NonZeroU32,
    sync::{
        Arc, Condvar, Mutex, MutexGuard, RwLock, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use thiserror::Error;

use crate::{
    finalizer::Finalizer,
    job::{Job, JobId, JobState, Tile, TileRelease},
    priority::PriorityKey,
    tiler,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("invalid job kind {0}")]
    InvalidJobKind(u8),
    #[error("image of size {0}x{1} has no pixels to render")]
    EmptyImage(u32, u32),
    #[error("job has no progressive passes")]
    NoPasses,
    #[error("job has {0} progressive passes, at most 256 are supported")]
    TooManyPasses(usize),
    #[error("job splits into {0} tiles, which is more than a job can track")]
    TooManyTiles(u64),
}

#[derive(Copy, Clone, Debug)]
pub struct SchedulerSettings {
    /// Edge length of the square tiles jobs are split into.
    pub tile_size: NonZeroU32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        SchedulerSettings {
            tile_size: NonZeroU32::new(32).expect("32 is non-zero"),
        }
    }
}

/// Registry of job states that the finalizer cleans up after it consumed a job.
pub trait JobRegistry: Send + Sync {
    fn erase_job_state(&self, id: JobId);
}

/// Tile waiting in the queue.
///
/// Ordered so that the max-heap pops the smallest priority key first, equal keys in the order
/// they were queued.
struct QueuedTile<S> {
    sequence: u64,
    tile: Tile<S>,
}

impl<S> QueuedTile<S> {
    fn key(&self) -> (PriorityKey, u64) {
        (self.tile.priority(), self.sequence)
    }
}

impl<S> PartialEq for QueuedTile<S> {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl<S> Eq for QueuedTile<S> {}

impl<S> PartialOrd for QueuedTile<S> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<S> Ord for QueuedTile<S> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.key().cmp(&self.key())
    }
}

struct SchedulerInner<S> {
    tiles: BinaryHeap<QueuedTile<S>>,
    jobs: HashMap<JobId, Arc<JobState<S>>>,
    next_sequence: u64,
    shutdown: bool,
}

pub struct Scheduler<S> {
    settings: SchedulerSettings,
    inner: Mutex<SchedulerInner<S>>,
    tiles_available: Condvar,
    next_job_id: AtomicU64,
    finalizer: RwLock<Option<Arc<Finalizer>>>,
}

impl<S: Send + Sync + 'static> Scheduler<S> {
    pub fn new(settings: SchedulerSettings) -> Self {
        Scheduler {
            settings,
            inner: Mutex::new(SchedulerInner {
                tiles: BinaryHeap::new(),
                jobs: HashMap::new(),
                next_sequence: 0,
                shutdown: false,
            }),
            tiles_available: Condvar::new(),
            next_job_id: AtomicU64::new(0),
            finalizer: RwLock::new(None),
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Submits a job for rendering.
    ///
    /// The job is split into tiles which are queued together with the job's state.
    /// Returns the id under which the job can be tracked.
    pub fn submit(&self, job: Job<S>) -> Result<JobId, SchedulerError> {
        tiler::validate(&job)?;

        let tile_count =
            tiler::tile_count(job.resolution(), job.passes().len(), self.settings.tile_size);
        let tile_count =
            u32::try_from(tile_count).map_err(|_| SchedulerError::TooManyTiles(tile_count))?;

        let id = JobId(self.next_job_id.fetch_add(1, Ordering::Relaxed));
        let state = Arc::new(JobState::new(job, id, tile_count));
        let tiles = tiler::tile(&state, self.settings.tile_size)?;

        {
            let mut inner = self.lock();
            inner.jobs.insert(id, Arc::clone(&state));
            for tile in tiles {
                let sequence = inner.next_sequence;
                inner.next_sequence += 1;
                inner.tiles.push(QueuedTile { sequence, tile });
            }
        }
        state.mark_started();
        log::debug!("submitted job {id} with {tile_count} tiles");

        self.tiles_available.notify_all();
        Ok(id)
    }

    /// Flags a job as cancelled.
    ///
    /// Queued tiles of the job are dropped when they reach the front of the queue, tiles that
    /// are already being rendered are left alone. Unknown ids are ignored.
    pub fn cancel(&self, id: JobId) {
        let inner = self.lock();
        if let Some(state) = inner.jobs.get(&id) {
            log::debug!("cancelling job {id}");
            state.mark_cancelled();
        }
    }

    /// Returns the highest priority tile, waiting until one is available.
    ///
    /// Returns `None` when the scheduler is shut down, or when all queued tiles turned out to
    /// belong to cancelled jobs. Only the first case means the caller should stop asking.
    pub fn get_next_tile(&self) -> Option<Tile<S>> {
        let inner = self.lock();
        let inner = self
            .tiles_available
            .wait_while(inner, |inner| inner.tiles.is_empty() && !inner.shutdown)
            .expect("Poisoned lock!");
        self.pop_valid_tile(inner)
    }

    /// Like [`Scheduler::get_next_tile`], but returns `None` immediately when the queue is
    /// empty.
    pub fn try_get_next_tile(&self) -> Option<Tile<S>> {
        self.pop_valid_tile(self.lock())
    }

    fn pop_valid_tile(&self, mut inner: MutexGuard<'_, SchedulerInner<S>>) -> Option<Tile<S>> {
        if inner.shutdown {
            log::trace!("shutdown signal received");
            return None;
        }

        let mut ended = Vec::new();
        let mut found = None;

        while let Some(QueuedTile { tile, .. }) = inner.tiles.pop() {
            let is_live = inner
                .jobs
                .get(&tile.job_id())
                .is_some_and(|state| !state.is_cancelled());

            if is_live {
                found = Some(tile);
                break;
            }
            tile.mark_reported();

            match tile.state().release_tile(None) {
                TileRelease::Last => ended.push(Arc::clone(tile.state())),
                TileRelease::Pending => {}
                TileRelease::Overrun => log::warn!(
                    "discarded tile of job {} that had no outstanding tiles",
                    tile.job_id()
                ),
            }
        }
        drop(inner);

        for state in ended {
            self.complete_and_finalize(&state);
        }

        if let Some(tile) = &found {
            tile.state().stamp_start();
        }
        found
    }

    /// Accounts a tile as rendered.
    pub fn set_tile_complete(&self, tile: &Tile<S>) {
        self.release(tile, true);
    }

    /// Accounts a tile that was handed out but deliberately not rendered, typically because
    /// its job got cancelled in the meantime.
    pub fn set_tile_skipped(&self, tile: &Tile<S>) {
        self.release(tile, false);
    }

    fn release(&self, tile: &Tile<S>, rendered: bool) {
        if !tile.mark_reported() {
            log::warn!(
                "tile {:?} of job {} reported more than once",
                tile.block(),
                tile.job_id()
            );
            return;
        }

        let block = tile.block();
        match tile.state().release_tile(rendered.then_some(&block)) {
            TileRelease::Last => self.complete_and_finalize(tile.state()),
            TileRelease::Pending => {}
            TileRelease::Overrun => log::warn!(
                "tile {:?} of job {} reported after the job ran out of tiles",
                tile.block(),
                tile.job_id()
            ),
        }
    }

    /// Marks the job completed and hands its summary to the finalizer.
    ///
    /// The job state stays registered, it is the finalizer's job to erase it once the summary
    /// is stored.
    fn complete_and_finalize(&self, state: &Arc<JobState<S>>) {
        let Some(to_finalize) = state.finish() else {
            log::warn!("job {} was already completed", state.id());
            return;
        };
        log::debug!(
            "completing job {} ({:?})",
            state.id(),
            to_finalize.summary.end_reason
        );

        let finalizer = self.finalizer.read().expect("Poisoned lock!").clone();
        match finalizer {
            Some(finalizer) => finalizer.push(to_finalize),
            None => log::warn!(
                "no finalizer attached, job {} will not be finalized",
                state.id()
            ),
        }
    }

    pub fn get_job_state(&self, id: JobId) -> Option<Arc<JobState<S>>> {
        self.lock().jobs.get(&id).cloned()
    }

    /// Number of tiles waiting in the queue, including tiles of cancelled jobs that were not
    /// discarded yet.
    pub fn queued_tiles(&self) -> usize {
        self.lock().tiles.len()
    }

    /// Connects the scheduler with a finalizer in both directions.
    /// Attaching again replaces the previous link.
    pub fn attach_finalizer(self: &Arc<Self>, finalizer: &Arc<Finalizer>) {
        *self.finalizer.write().expect("Poisoned lock!") = Some(Arc::clone(finalizer));

        let registry: Arc<dyn JobRegistry> = Arc::clone(self) as Arc<dyn JobRegistry>;
        let registry: Weak<dyn JobRegistry> = Arc::downgrade(&registry);
        finalizer.attach_registry(registry);
    }
}

impl<S> Scheduler<S> {
    /// Wakes up everyone waiting for tiles and makes all further requests return `None`.
    pub fn shutdown(&self) {
        {
            let mut inner = self.lock();
            if !inner.shutdown {
                log::debug!("scheduler shutting down");
            }
            inner.shutdown = true;
        }
        self.tiles_available.notify_all();
    }

    pub fn is_shut_down(&self) -> bool {
        self.lock().shutdown
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerInner<S>> {
        self.inner.lock().expect("Poisoned lock!")
    }
}

impl<S: Send + Sync + 'static> JobRegistry for Scheduler<S> {
    fn erase_job_state(&self, id: JobId) {
        self.lock().jobs.remove(&id);
    }
}

impl<S: Send + Sync + 'static> Default for Scheduler<S> {
    fn default() -> Self {
        Scheduler::new(SchedulerSettings::default())
    }
}

impl<S> Drop for Scheduler<S> {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.shutdown = true;
        }
        self.tiles_available.notify_all();
    }
}

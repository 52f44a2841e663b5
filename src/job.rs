use std::{
    fmt,
    ops::Deref as _,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, MutexGuard, OnceLock,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use bon::bon;
use image::{GenericImage, GenericImageView, RgbaImage};

use crate::{
    geometry::{ScreenBlock, ScreenSize},
    priority::{JobKind, PriorityKey},
    screen_block::ScreenBlockExt,
};

/// Numerical identifier of a submitted job, assigned by the scheduler.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Called once with the job's summary after the finalizer picks it up.
pub type JobEndedCallback = Box<dyn FnOnce(&JobSummary) + Send>;

/// Where the pixels of a job end up.
///
/// Cloning is cheap, clones share the same buffer.
#[derive(Clone)]
pub struct ImageTarget {
    buffer: Arc<Mutex<RgbaImage>>,
    resolution: ScreenSize,
    path: Option<PathBuf>,
}

impl ImageTarget {
    pub fn new(resolution: ScreenSize) -> Self {
        ImageTarget {
            buffer: Arc::new(Mutex::new(RgbaImage::new(
                resolution.width,
                resolution.height,
            ))),
            resolution,
            path: None,
        }
    }

    pub fn with_path(resolution: ScreenSize, path: impl Into<PathBuf>) -> Self {
        ImageTarget {
            path: Some(path.into()),
            ..ImageTarget::new(resolution)
        }
    }

    pub fn resolution(&self) -> ScreenSize {
        self.resolution
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn image(&self) -> MutexGuard<'_, RgbaImage> {
        self.buffer.lock().expect("Poisoned lock!")
    }

    /// Copies the top left corner of `block_buffer` into `block` of the target.
    pub fn write_block(&self, block: ScreenBlock, block_buffer: &RgbaImage) -> image::ImageResult<()> {
        debug_assert!(block_buffer.width() >= block.width());
        debug_assert!(block_buffer.height() >= block.height());

        self.image().copy_from(
            block_buffer
                .view(0, 0, block.width(), block.height())
                .deref(),
            block.min.x,
            block.min.y,
        )
    }

    /// Writes the buffer to `path`, the format is chosen by the file extension.
    pub fn save_to(&self, path: &Path) -> image::ImageResult<()> {
        self.image().save(path)
    }
}

impl PartialEq for ImageTarget {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path && self.resolution == other.resolution
    }
}

impl fmt::Debug for ImageTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageTarget")
            .field("resolution", &self.resolution)
            .field("path", &self.path)
            .finish()
    }
}

/// A single render request.
///
/// The scene (anything the tile renderer needs to compute pixels, typically geometry and a
/// camera) is shared with the caller, the scheduler never looks inside.
pub struct Job<S> {
    id: Option<JobId>,
    scene: Arc<S>,
    kind: JobKind,
    resolution: ScreenSize,
    /// Progressive refinement block sizes in pixels, coarse to fine.
    /// `[32, 16, 8, 1]` renders the image four times with increasing detail.
    passes: Vec<u32>,
    target: ImageTarget,
    on_end: Mutex<Option<JobEndedCallback>>,
}

#[bon]
impl<S> Job<S> {
    #[builder]
    pub fn new(
        scene: Arc<S>,
        kind: JobKind,
        resolution: ScreenSize,
        passes: Option<Vec<u32>>,
        path: Option<PathBuf>,
        on_end: Option<JobEndedCallback>,
    ) -> Self {
        let target = match path {
            Some(path) => ImageTarget::with_path(resolution, path),
            None => ImageTarget::new(resolution),
        };

        Job {
            id: None,
            scene,
            kind,
            resolution,
            passes: passes.unwrap_or_else(|| vec![1]),
            target,
            on_end: Mutex::new(on_end),
        }
    }
}

impl<S> Job<S> {
    /// Scheduler assigned id, `None` until the job is submitted.
    pub fn id(&self) -> Option<JobId> {
        self.id
    }

    pub fn scene(&self) -> &S {
        &self.scene
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn resolution(&self) -> ScreenSize {
        self.resolution
    }

    pub fn passes(&self) -> &[u32] {
        &self.passes
    }

    pub fn target(&self) -> &ImageTarget {
        &self.target
    }

    pub(crate) fn assign_id(&mut self, id: JobId) {
        self.id = Some(id);
    }

    pub(crate) fn take_on_end(&self) -> Option<JobEndedCallback> {
        self.on_end.lock().expect("Poisoned lock!").take()
    }
}

impl<S> fmt::Debug for Job<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("resolution", &self.resolution)
            .field("passes", &self.passes)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

/// Why a job stopped.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum JobEndReason {
    /// Every tile was rendered.
    Completed,
    Cancelled,
    /// Ended without being cancelled and without rendering all tiles.
    Failed,
}

/// Immutable snapshot of a job, taken when it ends.
#[derive(Clone, Debug, PartialEq)]
pub struct JobSummary {
    pub id: JobId,
    pub kind: JobKind,
    pub end_reason: JobEndReason,
    pub target: ImageTarget,

    pub tile_count: u32,
    pub tiles_completed: u32,
    pub pixels_completed: u64,
    pub pass_count: u32,

    pub submit_time: Instant,
    pub start_time: Option<Instant>,
    pub last_tile_time: Option<Instant>,
    pub complete_time: Option<Instant>,
}

impl JobSummary {
    /// Time from submission to completion.
    pub fn total_time(&self) -> Option<Duration> {
        self.complete_time
            .map(|complete| complete.saturating_duration_since(self.submit_time))
    }
}

/// Ended job on its way to the finalizer.
pub struct JobToFinalize {
    pub summary: JobSummary,
    pub callback: Option<JobEndedCallback>,
}

impl fmt::Debug for JobToFinalize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobToFinalize")
            .field("summary", &self.summary)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

/// What happened when a tile was handed back to its job.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum TileRelease {
    /// Other tiles are still outstanding.
    Pending,
    /// Every tile of the job is now accounted for, the job needs to be finalized.
    Last,
    /// The job had no outstanding tiles left, the tile was reported twice.
    Overrun,
}

/// Shared lifecycle record of a submitted job.
///
/// Counters and flags are atomics so that workers can update them without going through the
/// scheduler lock.
pub struct JobState<S> {
    id: JobId,
    job: Job<S>,

    tile_count: u32,
    /// Tiles not yet handed back.
    tiles_remaining: AtomicU32,
    /// Handed back tiles whose bookkeeping is done, reaches `tile_count` exactly once.
    tiles_settled: AtomicU32,
    tiles_completed: AtomicU32,
    pixels_completed: AtomicU64,

    started: AtomicBool,
    completed: AtomicBool,
    cancelled: AtomicBool,

    submit_time: Instant,
    start_time: OnceLock<Instant>,
    last_tile_time: Mutex<Option<Instant>>,
    complete_time: OnceLock<Instant>,
}

impl<S> JobState<S> {
    pub(crate) fn new(mut job: Job<S>, id: JobId, tile_count: u32) -> Self {
        job.assign_id(id);

        JobState {
            id,
            job,

            tile_count,
            tiles_remaining: AtomicU32::new(tile_count),
            tiles_settled: AtomicU32::new(0),
            tiles_completed: AtomicU32::new(0),
            pixels_completed: AtomicU64::new(0),

            started: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),

            submit_time: Instant::now(),
            start_time: OnceLock::new(),
            last_tile_time: Mutex::new(None),
            complete_time: OnceLock::new(),
        }
    }

    pub fn job(&self) -> &Job<S> {
        &self.job
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn tile_count(&self) -> u32 {
        self.tile_count
    }

    pub fn tiles_remaining(&self) -> u32 {
        self.tiles_remaining.load(Ordering::Acquire)
    }

    /// Tiles actually rendered, skipped tiles of cancelled jobs don't count.
    pub fn tiles_completed(&self) -> u32 {
        self.tiles_completed.load(Ordering::Acquire)
    }

    pub fn pixels_completed(&self) -> u64 {
        self.pixels_completed.load(Ordering::Acquire)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// True once the job ended, whether all tiles were rendered or not.
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn submit_time(&self) -> Instant {
        self.submit_time
    }

    /// When the first tile of this job was handed to a worker.
    pub fn start_time(&self) -> Option<Instant> {
        self.start_time.get().copied()
    }

    pub fn last_tile_time(&self) -> Option<Instant> {
        *self.last_tile_time.lock().expect("Poisoned lock!")
    }

    pub fn complete_time(&self) -> Option<Instant> {
        self.complete_time.get().copied()
    }

    /// Fraction of tiles no longer outstanding, in 0..=1.
    pub fn progress(&self) -> f32 {
        if self.tile_count == 0 {
            1.0
        } else {
            1.0 - self.tiles_remaining() as f32 / self.tile_count as f32
        }
    }

    /// Builds a snapshot of the current state.
    pub fn summary(&self) -> JobSummary {
        let tiles_completed = self.tiles_completed();
        let end_reason = if tiles_completed == self.tile_count {
            JobEndReason::Completed
        } else if self.is_cancelled() {
            JobEndReason::Cancelled
        } else {
            JobEndReason::Failed
        };

        JobSummary {
            id: self.id(),
            kind: self.job.kind,
            end_reason,
            target: self.job.target.clone(),

            tile_count: self.tile_count,
            tiles_completed,
            pixels_completed: self.pixels_completed(),
            pass_count: self.job.passes.len().max(1) as u32,

            submit_time: self.submit_time,
            start_time: self.start_time(),
            last_tile_time: self.last_tile_time(),
            complete_time: self.complete_time(),
        }
    }

    pub(crate) fn mark_started(&self) {
        self.started.store(true, Ordering::Release);
    }

    pub(crate) fn mark_cancelled(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub(crate) fn stamp_start(&self) {
        self.start_time.get_or_init(Instant::now);
    }

    fn record_rendered(&self, block: &ScreenBlock) {
        *self.last_tile_time.lock().expect("Poisoned lock!") = Some(Instant::now());
        self.tiles_completed.fetch_add(1, Ordering::AcqRel);
        self.pixels_completed
            .fetch_add(block.pixel_count(), Ordering::AcqRel);
    }

    /// Hands one tile back, `rendered` is its block if it was actually rendered.
    ///
    /// A tile reported after the outstanding count hit zero changes nothing and reports
    /// `Overrun`. Otherwise the counters are updated before the tile is settled, and only the
    /// call that settles the last tile reports `Last`, so the summary built afterwards sees
    /// every rendered tile.
    pub(crate) fn release_tile(&self, rendered: Option<&ScreenBlock>) -> TileRelease {
        let claimed = self
            .tiles_remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |remaining| {
                remaining.checked_sub(1)
            });
        if claimed.is_err() {
            return TileRelease::Overrun;
        }

        if let Some(block) = rendered {
            self.record_rendered(block);
        }

        if self.tiles_settled.fetch_add(1, Ordering::AcqRel) + 1 == self.tile_count {
            TileRelease::Last
        } else {
            TileRelease::Pending
        }
    }

    /// Marks the job completed and packages it for the finalizer.
    ///
    /// Returns `None` if the job was already completed before.
    pub(crate) fn finish(&self) -> Option<JobToFinalize> {
        if self.completed.swap(true, Ordering::AcqRel) {
            return None;
        }

        let all_tiles_rendered = self.tiles_completed() == self.tile_count;
        let complete_time = match self.last_tile_time() {
            Some(last_tile) if all_tiles_rendered => last_tile,
            _ => Instant::now(),
        };
        self.complete_time.get_or_init(|| complete_time);

        Some(JobToFinalize {
            summary: self.summary(),
            callback: self.job.take_on_end(),
        })
    }
}

impl<S> fmt::Debug for JobState<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobState")
            .field("job", &self.job)
            .field("tile_count", &self.tile_count)
            .field("tiles_remaining", &self.tiles_remaining())
            .field("tiles_completed", &self.tiles_completed())
            .field("started", &self.is_started())
            .field("completed", &self.is_completed())
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Rectangular part of one pass of a job, the unit of work handed to workers.
pub struct Tile<S> {
    job_id: JobId,
    state: Arc<JobState<S>>,
    priority: PriorityKey,
    block: ScreenBlock,
    pass_index: u32,
    block_size: u32,
    /// Shared by all clones of the tile.
    reported: Arc<AtomicBool>,
}

impl<S> Tile<S> {
    pub(crate) fn new(
        state: Arc<JobState<S>>,
        priority: PriorityKey,
        block: ScreenBlock,
        pass_index: u32,
        block_size: u32,
    ) -> Self {
        Tile {
            job_id: state.id(),
            state,
            priority,
            block,
            pass_index,
            block_size,
            reported: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flags the tile as handed back, returns false if it already was.
    pub(crate) fn mark_reported(&self) -> bool {
        !self.reported.swap(true, Ordering::AcqRel)
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn state(&self) -> &Arc<JobState<S>> {
        &self.state
    }

    pub fn priority(&self) -> PriorityKey {
        self.priority
    }

    pub fn block(&self) -> ScreenBlock {
        self.block
    }

    pub fn pass_index(&self) -> u32 {
        self.pass_index
    }

    /// Edge length of the pixel blocks this pass is rendered with.
    pub fn block_size(&self) -> u32 {
        self.block_size
    }
}

impl<S> Clone for Tile<S> {
    fn clone(&self) -> Self {
        Tile {
            job_id: self.job_id,
            state: Arc::clone(&self.state),
            priority: self.priority,
            block: self.block,
            pass_index: self.pass_index,
            block_size: self.block_size,
            reported: Arc::clone(&self.reported),
        }
    }
}

impl<S> PartialEq for Tile<S> {
    fn eq(&self, other: &Self) -> bool {
        self.block == other.block && self.job_id == other.job_id
    }
}

impl<S> fmt::Debug for Tile<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tile")
            .field("job_id", &self.job_id)
            .field("priority", &self.priority)
            .field("block", &self.block)
            .field("pass_index", &self.pass_index)
            .field("block_size", &self.block_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert2::assert;
    use euclid::point2;

    fn state(tile_count: u32) -> JobState<()> {
        let job = Job::builder()
            .scene(Arc::new(()))
            .kind(JobKind::Background)
            .resolution(ScreenSize::new(64, 32))
            .build();
        JobState::new(job, JobId(7), tile_count)
    }

    fn block() -> ScreenBlock {
        ScreenBlock::new(point2(0, 0), point2(8, 4))
    }

    #[test]
    fn builder_defaults() {
        let job = Job::builder()
            .scene(Arc::new(()))
            .kind(JobKind::Realtime)
            .resolution(ScreenSize::new(10, 20))
            .build();

        assert!(job.id().is_none());
        assert!(job.passes() == [1]);
        assert!(job.target().resolution() == ScreenSize::new(10, 20));
        assert!(job.target().path().is_none());
    }

    #[test]
    fn release_reports_last_tile_once() {
        let state = state(2);
        assert!(state.release_tile(None) == TileRelease::Pending);
        assert!(state.release_tile(None) == TileRelease::Last);
        assert!(state.release_tile(None) == TileRelease::Overrun);
        assert!(state.tiles_remaining() == 0);
    }

    #[test]
    fn overrun_leaves_counters_alone() {
        let state = state(2);
        assert!(state.release_tile(Some(&block())) == TileRelease::Pending);
        assert!(state.release_tile(Some(&block())) == TileRelease::Last);
        let last_tile_time = state.last_tile_time();

        assert!(state.release_tile(Some(&block())) == TileRelease::Overrun);
        assert!(state.tiles_completed() == 2);
        assert!(state.pixels_completed() == 64);
        assert!(state.last_tile_time() == last_tile_time);
    }

    #[test]
    fn concurrent_releases_settle_once() {
        let state = Arc::new(state(1000));
        let last_count = (0..4)
            .map(|_| {
                let state = Arc::clone(&state);
                std::thread::spawn(move || {
                    (0..300)
                        .filter(|_| state.release_tile(Some(&block())) == TileRelease::Last)
                        .count()
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .sum::<usize>();

        assert!(last_count == 1);
        assert!(state.tiles_completed() == 1000);
        assert!(state.summary().end_reason == JobEndReason::Completed);
    }

    #[test]
    fn finish_only_once() {
        let state = state(1);
        assert!(state.release_tile(Some(&block())) == TileRelease::Last);

        let finished = state.finish();
        assert!(finished.is_some());
        assert!(state.is_completed());
        assert!(state.finish().is_none());
    }

    #[test]
    fn complete_time_is_last_tile_when_everything_rendered() {
        let state = state(1);
        state.release_tile(Some(&block()));

        let Some(finished) = state.finish() else {
            panic!("job should finish");
        };
        assert!(finished.summary.end_reason == JobEndReason::Completed);
        assert!(finished.summary.complete_time == state.last_tile_time());
        assert!(finished.summary.pixels_completed == 32);
    }

    #[test]
    fn completed_wins_over_cancelled() {
        let state = state(1);
        state.mark_cancelled();
        state.release_tile(Some(&block()));

        let summary = state.finish().map(|f| f.summary);
        assert!(summary.map(|s| s.end_reason) == Some(JobEndReason::Completed));
    }

    #[test]
    fn partial_cancelled_job() {
        let state = state(3);
        state.release_tile(Some(&block()));
        state.mark_cancelled();
        state.release_tile(None);
        state.release_tile(None);

        let Some(finished) = state.finish() else {
            panic!("job should finish");
        };
        assert!(finished.summary.end_reason == JobEndReason::Cancelled);
        assert!(finished.summary.tiles_completed == 1);
        assert!(finished.summary.complete_time >= state.last_tile_time());
    }

    #[test]
    fn abandoned_job_failed() {
        let state = state(2);
        assert!(state.summary().end_reason == JobEndReason::Failed);
    }

    #[test]
    fn callback_taken_by_finish() {
        let job = Job::builder()
            .scene(Arc::new(()))
            .kind(JobKind::Offline)
            .resolution(ScreenSize::new(4, 4))
            .on_end(Box::new(|_: &JobSummary| {}))
            .build();
        let state = JobState::new(job, JobId(1), 0);
        assert!(state.job().id() == Some(JobId(1)));

        let finished = state.finish().map(|f| f.callback.is_some());
        assert!(finished == Some(true));
    }

    #[test]
    fn callback_only_needs_to_be_send() {
        // Cell is Send but not Sync
        let calls = std::cell::Cell::new(0);
        let (sender, receiver) = crossbeam_channel::unbounded();
        let job = Job::builder()
            .scene(Arc::new(()))
            .kind(JobKind::Offline)
            .resolution(ScreenSize::new(4, 4))
            .on_end(Box::new(move |summary: &JobSummary| {
                calls.set(calls.get() + 1);
                let _ = sender.send((summary.id, calls.get()));
            }))
            .build();
        let state = Arc::new(JobState::new(job, JobId(2), 1));

        let finished = std::thread::spawn({
            let state = Arc::clone(&state);
            move || {
                state.release_tile(None);
                state.finish()
            }
        })
        .join()
        .unwrap();

        let callback = finished.and_then(|f| f.callback.map(|c| (c, f.summary)));
        let Some((callback, summary)) = callback else {
            panic!("job should finish with its callback");
        };
        callback(&summary);
        assert!(receiver.try_recv() == Ok((JobId(2), 1)));
    }

    #[test]
    fn write_block_copies_pixels() {
        let target = ImageTarget::new(ScreenSize::new(16, 16));
        let buffer = RgbaImage::from_pixel(8, 8, image::Rgba([1, 2, 3, 4]));
        let block = ScreenBlock::new(point2(4, 6), point2(10, 9));

        assert!(target.write_block(block, &buffer).is_ok());

        let image = target.image();
        assert!(*image.get_pixel(4, 6) == image::Rgba([1, 2, 3, 4]));
        assert!(*image.get_pixel(9, 8) == image::Rgba([1, 2, 3, 4]));
        assert!(*image.get_pixel(10, 8) == image::Rgba([0, 0, 0, 0]));
        assert!(*image.get_pixel(9, 9) == image::Rgba([0, 0, 0, 0]));
    }

    #[test]
    fn target_equality_ignores_content() {
        let a = ImageTarget::with_path(ScreenSize::new(4, 4), "out.png");
        let b = ImageTarget::with_path(ScreenSize::new(4, 4), "out.png");
        let c = ImageTarget::new(ScreenSize::new(4, 4));
        a.image().put_pixel(0, 0, image::Rgba([255, 0, 0, 255]));

        assert!(a == b);
        assert!(a != c);
    }
}

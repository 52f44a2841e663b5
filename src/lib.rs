pub mod finalizer;
pub mod geometry;
pub mod job;
pub mod priority;
pub mod renderer;
pub mod scheduler;
pub mod screen_block;
mod tiler;
mod util;

#[cfg(test)]
mod test_util;

pub use crate::{
    finalizer::{Finalizer, FinalizerSettings},
    job::{ImageTarget, Job, JobEndReason, JobId, JobState, JobSummary, Tile},
    priority::{JobKind, PriorityKey},
    renderer::{BlockRenderer, TileRenderer, Worker, WorkerCount, WorkerPool},
    scheduler::{Scheduler, SchedulerError, SchedulerSettings},
    util::Rgba,
};

use std::sync::Arc;

use crate::{job::Tile, renderer::TileRenderer, scheduler::Scheduler};

/// Single thread of rendering work.
///
/// Pulls tiles from the scheduler until it shuts down, holding no tile between iterations.
pub struct Worker<S> {
    id: usize,
    scheduler: Arc<Scheduler<S>>,
}

impl<S: Send + Sync + 'static> Worker<S> {
    pub fn new(id: usize, scheduler: Arc<Scheduler<S>>) -> Self {
        Self { id, scheduler }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Renders tiles until the scheduler shuts down.
    /// Returns the number of tiles this worker rendered.
    pub fn run<R: TileRenderer<S>>(&self, renderer: &mut R) -> usize {
        log::debug!("worker {} starting", self.id);
        let mut rendered = 0;

        loop {
            let Some(tile) = self.scheduler.get_next_tile() else {
                if self.scheduler.is_shut_down() {
                    break;
                }
                // Everything queued belonged to cancelled jobs, wait for more
                continue;
            };

            if self.process(&tile, renderer) {
                rendered += 1;
            }
        }

        log::debug!("worker {} stopping after {rendered} tiles", self.id);
        rendered
    }

    /// Renders a single tile and reports it back to the scheduler.
    /// Tiles of cancelled jobs are reported without rendering, returns whether the tile was
    /// rendered.
    pub fn process<R: TileRenderer<S>>(&self, tile: &Tile<S>, renderer: &mut R) -> bool {
        let state = tile.state();
        if state.is_cancelled() {
            log::trace!(
                "worker {} skipping tile {:?} of cancelled job {}",
                self.id,
                tile.block(),
                tile.job_id()
            );
            self.scheduler.set_tile_skipped(tile);
            return false;
        }

        let job = state.job();
        renderer.render_tile(job.scene(), tile.block(), tile.block_size(), job.target());
        self.scheduler.set_tile_complete(tile);
        true
    }
}

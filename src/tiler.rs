//! Splitting jobs into prioritized tiles.

use std::{num::NonZeroU32, sync::Arc};

use crate::{
    geometry::{ScreenSize, full_block},
    job::{Job, JobState, Tile},
    priority::PriorityKey,
    scheduler::SchedulerError,
    screen_block::ScreenBlockExt,
};

/// Checks that a job can be tiled.
pub fn validate<S>(job: &Job<S>) -> Result<(), SchedulerError> {
    let resolution = job.resolution();
    if resolution.width == 0 || resolution.height == 0 {
        return Err(SchedulerError::EmptyImage(resolution.width, resolution.height));
    }

    let pass_count = job.passes().len();
    if pass_count == 0 {
        return Err(SchedulerError::NoPasses);
    }
    if pass_count > PriorityKey::MAX_PASS_INDEX as usize + 1 {
        return Err(SchedulerError::TooManyPasses(pass_count));
    }

    Ok(())
}

/// Number of tiles a job with the given resolution and pass count splits into.
pub fn tile_count(resolution: ScreenSize, pass_count: usize, tile_size: NonZeroU32) -> u64 {
    let tile_size = tile_size.get();
    let per_pass = u64::from(resolution.width.div_ceil(tile_size))
        * u64::from(resolution.height.div_ceil(tile_size));
    per_pass * pass_count as u64
}

/// Splits a submitted job into tiles, one full partition of the image per progressive pass.
///
/// Passes are emitted in order and every pass covers the image row by row with
/// `tile_size` x `tile_size` tiles, clipped at the right and bottom edge.
/// Each tile's priority is computed from its center.
pub fn tile<S>(
    state: &Arc<JobState<S>>,
    tile_size: NonZeroU32,
) -> Result<Vec<Tile<S>>, SchedulerError> {
    let job = state.job();
    validate(job)?;

    let resolution = job.resolution();
    let image = full_block(resolution);

    let mut tiles = Vec::with_capacity(state.tile_count() as usize);
    for (pass_index, &block_size) in job.passes().iter().enumerate() {
        let pass_index = pass_index as u32;
        let block_size = block_size.max(1);

        tiles.extend(image.chunks(tile_size.get()).map(|block| {
            let center = block.center();
            let priority = PriorityKey::compute(
                job.kind(),
                pass_index,
                center.x,
                center.y,
                resolution.width,
                resolution.height,
            );
            Tile::new(Arc::clone(state), priority, block, pass_index, block_size)
        }));
    }

    debug_assert!(tiles.len() as u64 == tile_count(resolution, job.passes().len(), tile_size));
    Ok(tiles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        geometry::{ScreenBlock, test::ScreenSizeWrapper},
        job::JobId,
        priority::JobKind,
    };
    use assert2::{assert, let_assert};
    use euclid::point2;
    use test_strategy::proptest;

    fn job_state(resolution: ScreenSize, passes: Vec<u32>) -> Arc<JobState<()>> {
        let job = Job::builder()
            .scene(Arc::new(()))
            .kind(JobKind::Realtime)
            .resolution(resolution)
            .passes(passes)
            .build();
        let count = tile_count(resolution, job.passes().len(), tile_size(32)) as u32;
        Arc::new(JobState::new(job, JobId(3), count))
    }

    fn tile_size(size: u32) -> NonZeroU32 {
        NonZeroU32::new(size).expect("tile size must be non-zero")
    }

    /// Tiles of a single pass cover the image exactly once
    #[proptest]
    fn single_pass_partitions_image(size: ScreenSizeWrapper, tile_size_minus_one: u8) {
        let tile_size = tile_size(tile_size_minus_one as u32 + 1);
        let state = job_state(*size, vec![1]);
        let_assert!(Ok(tiles) = tile(&state, tile_size));

        let area: u64 = tiles.iter().map(|t| t.block().pixel_count()).sum();
        assert!(area == size.width as u64 * size.height as u64);

        let image = full_block(*size);
        let mut covered = vec![false; area as usize];
        for t in &tiles {
            assert!(image.contains_box(&t.block()));
            for p in t.block().internal_points() {
                let index = (p.x + p.y * size.width) as usize;
                assert!(!covered[index]);
                covered[index] = true;
            }
        }
        assert!(covered.into_iter().all(|c| c));
        assert!(tiles.len() as u64 == tile_count(*size, 1, tile_size));
    }

    #[test]
    fn progressive_passes_are_independent() {
        let state = job_state(ScreenSize::new(256, 256), vec![16, 8, 4, 1]);
        let_assert!(Ok(tiles) = tile(&state, tile_size(32)));

        assert!(tiles.len() == 4 * 8 * 8);
        for (pass_index, pass) in tiles.chunks(64).enumerate() {
            let expected_block_size = [16, 8, 4, 1][pass_index];
            for t in pass {
                assert!(t.pass_index() == pass_index as u32);
                assert!(t.block_size() == expected_block_size);
                assert!(t.priority().pass_bits() == pass_index as u8);
                assert!(t.job_id() == JobId(3));
            }
            let area: u64 = pass.iter().map(|t| t.block().pixel_count()).sum();
            assert!(area == 256 * 256);
        }
    }

    #[test]
    fn edge_tiles_are_clipped() {
        let state = job_state(ScreenSize::new(40, 33), vec![1]);
        let_assert!(Ok(tiles) = tile(&state, tile_size(32)));

        let blocks: Vec<_> = tiles.iter().map(|t| t.block()).collect();
        assert!(
            blocks
                == vec![
                    ScreenBlock::new(point2(0, 0), point2(32, 32)),
                    ScreenBlock::new(point2(32, 0), point2(40, 32)),
                    ScreenBlock::new(point2(0, 32), point2(32, 33)),
                    ScreenBlock::new(point2(32, 32), point2(40, 33)),
                ]
        );
    }

    #[test]
    fn zero_block_size_is_one() {
        let state = job_state(ScreenSize::new(8, 8), vec![0]);
        let_assert!(Ok(tiles) = tile(&state, tile_size(32)));
        assert!(tiles[0].block_size() == 1);
    }

    #[test]
    fn central_tiles_have_higher_priority() {
        let state = job_state(ScreenSize::new(96, 96), vec![1]);
        let_assert!(Ok(tiles) = tile(&state, tile_size(32)));

        let best = tiles.iter().min_by_key(|t| t.priority());
        let_assert!(Some(best) = best);
        assert!(best.block() == ScreenBlock::new(point2(32, 32), point2(64, 64)));
    }

    #[test]
    fn rejects_untileable_jobs() {
        let empty = job_state(ScreenSize::new(0, 10), vec![1]);
        let_assert!(Err(SchedulerError::EmptyImage(0, 10)) = tile(&empty, tile_size(32)));

        let no_passes = job_state(ScreenSize::new(10, 10), vec![]);
        let_assert!(Err(SchedulerError::NoPasses) = tile(&no_passes, tile_size(32)));

        let too_many = job_state(ScreenSize::new(10, 10), vec![1; 257]);
        let_assert!(Err(SchedulerError::TooManyPasses(257)) = tile(&too_many, tile_size(32)));

        let most = job_state(ScreenSize::new(10, 10), vec![1; 256]);
        let_assert!(Ok(tiles) = tile(&most, tile_size(32)));
        assert!(tiles.len() == 256);
    }
}

//! Workers and the seam to whatever computes pixel colors.

mod machinery;
mod worker;

use std::num::NonZeroU32;

use image::RgbaImage;

pub use crate::renderer::{
    machinery::{WorkerCount, WorkerPool},
    worker::Worker,
};
use crate::{
    geometry::{ScreenBlock, ScreenPoint},
    job::ImageTarget,
    screen_block::ScreenBlockExt,
    util::{Rgba, color_to_image},
};

/// Renders the pixels of one tile into a job's target.
///
/// Every worker owns its own renderer, so implementations can keep scratch buffers or random
/// number generators around without synchronization.
pub trait TileRenderer<S>: Send {
    /// Writes the pixels of `block` into `target`.
    /// `block_size` is the edge length of the pixel blocks of the current progressive pass,
    /// one means full resolution.
    fn render_tile(&mut self, scene: &S, block: ScreenBlock, block_size: u32, target: &ImageTarget);
}

impl<S, F> TileRenderer<S> for F
where
    F: FnMut(&S, ScreenBlock, u32, &ImageTarget) + Send,
{
    fn render_tile(&mut self, scene: &S, block: ScreenBlock, block_size: u32, target: &ImageTarget) {
        self(scene, block, block_size, target)
    }
}

/// Tile renderer built from a per-pixel shading function.
///
/// Coarse passes shade only the top left pixel of every `block_size` x `block_size` cell and
/// fill the whole cell with it. The tile is assembled in a private buffer and copied into the
/// target in one go.
pub struct BlockRenderer<F> {
    shade: F,
    buffer: RgbaImage,
}

impl<F> BlockRenderer<F> {
    pub fn new(tile_size: NonZeroU32, shade: F) -> Self {
        BlockRenderer {
            shade,
            buffer: RgbaImage::new(tile_size.get(), tile_size.get()),
        }
    }
}

impl<S, F> TileRenderer<S> for BlockRenderer<F>
where
    F: FnMut(&S, ScreenPoint) -> Rgba + Send,
{
    fn render_tile(&mut self, scene: &S, block: ScreenBlock, block_size: u32, target: &ImageTarget) {
        if self.buffer.width() < block.width() || self.buffer.height() < block.height() {
            self.buffer = RgbaImage::new(block.width(), block.height());
        }

        for cell in block.chunks(block_size.max(1)) {
            let pixel = color_to_image((self.shade)(scene, cell.min));
            for point in cell.internal_points() {
                let buffer_position = point - block.min;
                self.buffer
                    .put_pixel(buffer_position.x, buffer_position.y, pixel);
            }
        }

        target
            .write_block(block, &self.buffer)
            .unwrap_or_else(|_| unreachable!("The buffer should always fit into the output"));
    }
}

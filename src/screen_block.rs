use std::iter::FusedIterator;

use euclid::{Box2D, point2, vec2};

use crate::geometry::{ScreenBlock, ScreenPoint};

pub trait ScreenBlockExt {
    fn internal_points(&self) -> InternalPoints;
    fn chunks(&self, chunk_size: u32) -> Chunks;
    fn pixel_count(&self) -> u64;
}

impl ScreenBlockExt for ScreenBlock {
    /// Pixels of the block row by row, top left first.
    fn internal_points(&self) -> InternalPoints {
        if self.is_empty() {
            return InternalPoints::exhausted();
        }
        InternalPoints {
            row_start: self.min.x,
            end: self.max,
            next: self.min,
        }
    }

    /// Create an iterator over sub blocks in row-major order, starting in the top left corner.
    /// Chunks are chunk_size * chunk_size large, except on the bottom and right side of the
    /// block, where they are clipped if chunk size doesn't evenly divide block size.
    /// Chunk size must be non zero.
    fn chunks(&self, chunk_size: u32) -> Chunks {
        assert!(chunk_size > 0);

        if self.is_empty() {
            return Chunks::empty();
        }

        let columns = self.width().div_ceil(chunk_size) as usize;
        let rows = self.height().div_ceil(chunk_size) as usize;

        Chunks {
            block: *self,
            chunk_size,
            columns,
            index: 0,
            count: columns * rows,
        }
    }

    /// Number of pixels inside the block, zero for empty blocks.
    fn pixel_count(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            self.width() as u64 * self.height() as u64
        }
    }
}

/// Row-major iterator over the pixels of a [`ScreenBlock`].
#[derive(Copy, Clone, Debug)]
pub struct InternalPoints {
    row_start: u32,
    end: ScreenPoint,
    /// Pixel returned by the following call to `next`, past the last row when done.
    next: ScreenPoint,
}

impl InternalPoints {
    fn exhausted() -> Self {
        InternalPoints {
            row_start: 0,
            end: ScreenPoint::zero(),
            next: ScreenPoint::zero(),
        }
    }

    fn is_done(&self) -> bool {
        self.next.y >= self.end.y
    }
}

impl Iterator for InternalPoints {
    type Item = ScreenPoint;

    fn next(&mut self) -> Option<ScreenPoint> {
        if self.is_done() {
            return None;
        }

        let point = self.next;
        debug_assert!(point.x < self.end.x);

        if point.x + 1 < self.end.x {
            self.next.x += 1;
        } else {
            self.next = point2(self.row_start, point.y + 1);
        }
        Some(point)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.len(), Some(self.len()))
    }
}

impl ExactSizeIterator for InternalPoints {
    fn len(&self) -> usize {
        if self.is_done() {
            return 0;
        }
        let rest_of_row = u64::from(self.end.x - self.next.x);
        let rows_below = Box2D::new(point2(self.row_start, self.next.y + 1), self.end);
        (rest_of_row + rows_below.pixel_count()) as usize
    }
}

impl FusedIterator for InternalPoints {}

/// Iterator over (mostly) square blocks within a rectangular box in row-major order.
#[derive(Copy, Clone, Debug)]
pub struct Chunks {
    block: ScreenBlock,
    chunk_size: u32,

    columns: usize,
    index: usize,
    count: usize,
}

impl Chunks {
    /// Constructs an iterator that returns no blocks.
    fn empty() -> Chunks {
        Chunks {
            block: Box2D::zero(),
            chunk_size: 1,

            columns: 0,
            index: 0,
            count: 0,
        }
    }

    /// Returns a new screen block that corresponds to the current iterator position.
    fn current_block(&self) -> ScreenBlock {
        let column = (self.index % self.columns) as u32;
        let row = (self.index / self.columns) as u32;

        let min = self.block.min + vec2(column, row) * self.chunk_size;
        let chunk = ScreenBlock::new(
            min,
            point2(
                self.block.max.x.min(min.x.saturating_add(self.chunk_size)),
                self.block.max.y.min(min.y.saturating_add(self.chunk_size)),
            ),
        );
        debug_assert!(self.block.contains_box(&chunk));
        debug_assert!(!chunk.is_empty());
        chunk
    }
}

impl Iterator for Chunks {
    type Item = ScreenBlock;

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.len();
        (remaining, Some(remaining))
    }

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.count {
            return None;
        }

        let chunk = self.current_block();
        self.index += 1;
        Some(chunk)
    }
}

impl ExactSizeIterator for Chunks {
    fn len(&self) -> usize {
        self.count - self.index
    }
}

impl FusedIterator for Chunks {}

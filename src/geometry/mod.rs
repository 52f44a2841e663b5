pub struct ScreenSpace;
pub type ScreenPoint = euclid::Point2D<u32, ScreenSpace>;
pub type ScreenSize = euclid::Size2D<u32, ScreenSpace>;
/// Half-open pixel rectangle `[min.x, max.x) × [min.y, max.y)`.
pub type ScreenBlock = euclid::Box2D<u32, ScreenSpace>;

/// Block covering the whole image of the given size, anchored at the origin.
pub fn full_block(size: ScreenSize) -> ScreenBlock {
    ScreenBlock::from_size(size)
}

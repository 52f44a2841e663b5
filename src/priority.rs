//! Packed tile priorities.
//!
//! A [`PriorityKey`] is a 64 bit value where smaller means more urgent. The bits are laid out as
//! `[job kind:8 | pass index:8 | distance to center:16 | reserved:32]`, most significant first,
//! so a plain integer comparison ranks tiles by kind, then by progressive pass, then by how
//! close they are to the middle of the image.

use std::fmt;

use crate::scheduler::SchedulerError;

/// Class of a render job, in order of decreasing urgency.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum JobKind {
    /// Interactive previews that someone is looking at right now.
    Realtime = 0,
    /// Thumbnails, caches and other work nobody waits for.
    Background = 1,
    /// Final quality renders to disk.
    Offline = 2,
}

impl JobKind {
    fn priority_class(self) -> u64 {
        self as u64
    }
}

impl TryFrom<u8> for JobKind {
    type Error = SchedulerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(JobKind::Realtime),
            1 => Ok(JobKind::Background),
            2 => Ok(JobKind::Offline),
            other => Err(SchedulerError::InvalidJobKind(other)),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PriorityKey(u64);

impl PriorityKey {
    const KIND_SHIFT: u32 = 56;
    const PASS_SHIFT: u32 = 48;
    const DISTANCE_SHIFT: u32 = 32;
    const DISTANCE_MAX: u64 = 0xFFFF;

    /// Largest pass index representable in a key.
    pub const MAX_PASS_INDEX: u32 = 0xFF;

    /// Computes the key of a tile centered at `(center_x, center_y)` in a `width` x `height`
    /// image.
    ///
    /// The distance term is the Manhattan distance to the image center, normalized by
    /// `width / 2 + height / 2` and quantized to 16 bits, so images of different sizes produce
    /// comparable keys. Pass indices above 255 are a caller bug; they trip a debug assertion and
    /// are truncated to 8 bits otherwise.
    pub fn compute(
        kind: JobKind,
        pass_index: u32,
        center_x: u32,
        center_y: u32,
        width: u32,
        height: u32,
    ) -> Self {
        debug_assert!(
            pass_index <= Self::MAX_PASS_INDEX,
            "pass index {pass_index} doesn't fit into a priority key"
        );

        let kind_bits = kind.priority_class() << Self::KIND_SHIFT;
        let pass_bits = u64::from(pass_index & Self::MAX_PASS_INDEX) << Self::PASS_SHIFT;

        let image_cx = i64::from(width / 2);
        let image_cy = i64::from(height / 2);
        let distance =
            (i64::from(center_x) - image_cx).abs() + (i64::from(center_y) - image_cy).abs();
        let max_distance = image_cx + image_cy;
        let normalized = if max_distance == 0 {
            0.0
        } else {
            (distance as f64 / max_distance as f64).min(1.0)
        };
        let distance_bits =
            ((normalized * Self::DISTANCE_MAX as f64) as u64) << Self::DISTANCE_SHIFT;

        PriorityKey(kind_bits | pass_bits | distance_bits)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn kind_bits(self) -> u8 {
        (self.0 >> Self::KIND_SHIFT) as u8
    }

    pub fn pass_bits(self) -> u8 {
        (self.0 >> Self::PASS_SHIFT) as u8
    }

    pub fn distance_bits(self) -> u16 {
        (self.0 >> Self::DISTANCE_SHIFT) as u16
    }
}

impl fmt::Display for PriorityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

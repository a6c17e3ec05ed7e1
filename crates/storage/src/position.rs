//! Log positions and their allocation.

/// A partition-scoped, strictly increasing record position.
pub type Position = i64;

/// Marker for "no position", used before anything was written or processed.
pub const NO_POSITION: Position = -1;

/// Hands out contiguous position ranges.
///
/// A range is only reserved by [`PositionAllocator::reserve`]; the
/// allocator advances when the caller confirms the write with
/// [`PositionAllocator::commit`]. A failed write therefore leaves no gap.
#[derive(Debug, Clone)]
pub struct PositionAllocator {
    next: Position,
}

impl PositionAllocator {
    /// Allocator whose first position follows `last` (use [`NO_POSITION`]
    /// for an empty log, which starts at 1).
    pub fn starting_after(last: Position) -> Self {
        Self {
            next: last.max(0) + 1,
        }
    }

    /// The position the next reservation starts at.
    pub fn next_position(&self) -> Position {
        self.next
    }

    /// Reserve `count` positions without advancing.
    ///
    /// Returns `(lowest, highest)`; `count` must be at least one.
    pub fn reserve(&self, count: usize) -> (Position, Position) {
        let count = count.max(1) as Position;
        (self.next, self.next + count - 1)
    }

    /// Advance past a successfully written range.
    pub fn commit(&mut self, highest: Position) {
        if highest >= self.next {
            self.next = highest + 1;
        }
    }
}

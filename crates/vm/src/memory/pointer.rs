//! Defines the [`Pointer`] type.

use std::fmt;

use num_traits::ToPrimitive;
use starknet_types_core::felt::Felt;

use crate::error::MathError;

/// A pointer within a [`Memory`](super::Memory) segment.
///
/// The segment index can be thought of as the provenance of the pointer: two
/// pointers may only be compared or subtracted when they share it. Negative
/// indices refer to *temporary* segments, which are moved onto a real
/// segment by a relocation rule before final relocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pointer {
    /// The index of the segment in the memory.
    ///
    /// Non-negative indices refer to real segments, negative indices to
    /// temporary ones.
    pub segment: isize,
    /// The offset within the segment.
    pub offset: usize,
}

impl Pointer {
    /// Creates a new [`Pointer`] from a segment index and an offset.
    #[inline(always)]
    pub const fn new(segment: isize, offset: usize) -> Self {
        Self { segment, offset }
    }

    /// Returns whether this pointer refers to a temporary segment.
    #[inline(always)]
    pub const fn is_temporary(self) -> bool {
        self.segment < 0
    }

    /// Adds `rhs` to the offset of this pointer.
    ///
    /// # Returns
    ///
    /// The advanced pointer, or [`MathError::OffsetOverflow`] if the new
    /// offset does not fit in a `usize`.
    pub fn add(self, rhs: usize) -> Result<Self, MathError> {
        let offset = self
            .offset
            .checked_add(rhs)
            .ok_or(MathError::OffsetOverflow(self, rhs as isize))?;
        Ok(Self::new(self.segment, offset))
    }

    /// Adds a signed `rhs` to the offset of this pointer.
    ///
    /// # Returns
    ///
    /// The adjusted pointer, or [`MathError::OffsetOverflow`] if the new
    /// offset leaves the representable range.
    pub fn add_signed(self, rhs: isize) -> Result<Self, MathError> {
        let offset = self
            .offset
            .checked_add_signed(rhs)
            .ok_or(MathError::OffsetOverflow(self, rhs))?;
        Ok(Self::new(self.segment, offset))
    }

    /// Adds a scalar to the offset of this pointer.
    ///
    /// The scalar must represent a nonnegative integer small enough for the
    /// resulting offset to fit in a `usize`.
    pub fn add_felt(self, rhs: &Felt) -> Result<Self, MathError> {
        let new_offset = Felt::from(self.offset) + rhs;
        let offset = new_offset
            .to_usize()
            .ok_or_else(|| MathError::ValueTooLarge(Box::new(new_offset)))?;
        Ok(Self::new(self.segment, offset))
    }

    /// Subtracts `rhs` from the offset of this pointer.
    pub fn sub(self, rhs: usize) -> Result<Self, MathError> {
        let offset = self
            .offset
            .checked_sub(rhs)
            .ok_or(MathError::OffsetUnderflow(self, rhs))?;
        Ok(Self::new(self.segment, offset))
    }

    /// Returns the distance between `self` and `other`, given that both
    /// refer to the same segment and `other` does not lie past `self`.
    pub fn subtract(self, other: Self) -> Result<usize, MathError> {
        if self.segment != other.segment {
            return Err(MathError::SegmentMismatch(self, other));
        }
        self.offset
            .checked_sub(other.offset)
            .ok_or(MathError::OffsetUnderflow(self, other.offset))
    }
}

impl From<(isize, usize)> for Pointer {
    #[inline(always)]
    fn from((segment, offset): (isize, usize)) -> Self {
        Self::new(segment, offset)
    }
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment, self.offset)
    }
}

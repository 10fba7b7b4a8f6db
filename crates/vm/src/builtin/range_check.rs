//! Defines the [`RangeCheck`] builtin.

use std::any::Any;

use starknet_types_core::felt::Felt;

use crate::error::MemoryError;
use crate::memory::{Memory, SegmentManager, ValidationRule, Value};

use super::{Builtin, BuiltinName, BuiltinState};

/// The number of 16-bit parts a range-checked value is split into.
pub const RC_N_PARTS: u32 = 8;

/// The range-check builtin.
///
/// Every cell of its segment must hold a scalar in `[0, 2^128)`; the
/// constraint is enforced by a validation rule that runs on every write, so
/// there is nothing to deduce.
#[derive(Debug)]
pub struct RangeCheck {
    state: BuiltinState,
    n_parts: u32,
}

impl RangeCheck {
    /// Creates a new [`RangeCheck`] builtin.
    pub fn new(included: bool, ratio: Option<u32>) -> Self {
        Self {
            state: BuiltinState::new(included, ratio),
            n_parts: RC_N_PARTS,
        }
    }

    /// Returns the upper bound enforced on the segment's cells:
    /// `2^(16 * RC_N_PARTS)`.
    pub fn bound() -> Felt {
        Felt::from_hex_unchecked("0x100000000000000000000000000000000")
    }
}

impl Builtin for RangeCheck {
    fn name(&self) -> BuiltinName {
        BuiltinName::RangeCheck
    }

    fn state(&self) -> &BuiltinState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut BuiltinState {
        &mut self.state
    }

    fn add_validation_rule(&self, memory: &mut Memory) {
        let Some(base) = self.state.base else { return };
        let bound = Self::bound();
        memory.add_validation_rule(
            base,
            ValidationRule(Box::new(move |memory, addr| match memory.get(addr) {
                Some(Value::Scalar(felt)) => {
                    if felt < bound {
                        Ok(vec![addr])
                    } else {
                        Err(MemoryError::RangeCheckOutOfBounds(Box::new(felt)))
                    }
                }
                Some(Value::Pointer(_)) => Err(MemoryError::RangeCheckFoundPointer(addr)),
                // The rule only runs against asserted cells.
                None => Ok(Vec::new()),
            })),
        );
    }

    fn used_perm_range_check_units(&self, segments: &SegmentManager) -> usize {
        self.used_cells(segments).unwrap_or(0) * self.n_parts as usize
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Pointer;
    use assert_matches::assert_matches;

    fn checked_segments() -> (RangeCheck, SegmentManager) {
        let mut rc = RangeCheck::new(true, Some(8));
        let mut segments = SegmentManager::new();
        rc.init_segments(&mut segments);
        rc.add_validation_rule(&mut segments.memory);
        (rc, segments)
    }

    #[test]
    fn accepts_values_below_the_bound() {
        let (_, mut segments) = checked_segments();
        let addr = Pointer::new(0, 0);
        segments
            .memory
            .set(addr, RangeCheck::bound() - Felt::ONE)
            .unwrap();
        assert!(segments.memory.is_validated(addr));
    }

    #[test]
    fn rejects_values_at_the_bound() {
        let (_, mut segments) = checked_segments();
        assert_matches!(
            segments.memory.set(Pointer::new(0, 0), RangeCheck::bound()),
            Err(MemoryError::RangeCheckOutOfBounds(_))
        );
    }

    #[test]
    fn rejects_pointers() {
        let (_, mut segments) = checked_segments();
        assert_matches!(
            segments.memory.set(Pointer::new(0, 0), Pointer::new(1, 0)),
            Err(MemoryError::RangeCheckFoundPointer(_))
        );
    }

    #[test]
    fn perm_units_count_eight_per_cell() {
        let (rc, mut segments) = checked_segments();
        for i in 0..3 {
            segments
                .memory
                .set(Pointer::new(0, i), Felt::from(i))
                .unwrap();
        }
        segments.compute_effective_sizes();
        assert_eq!(rc.used_perm_range_check_units(&segments), 24);
    }
}

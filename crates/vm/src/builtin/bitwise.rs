//! Defines the [`Bitwise`] builtin.

use std::any::Any;

use num_bigint::BigUint;
use starknet_types_core::felt::Felt;

use crate::error::BuiltinError;
use crate::memory::{Memory, Pointer, Value};

use super::{input_felt, Builtin, BuiltinName, BuiltinState};

/// The number of bits a bitwise operand may use.
pub const BITWISE_TOTAL_N_BITS: u32 = 251;

/// The number of memory cells of one bitwise instance:
/// `(x, y, x & y, x ^ y, x | y)`.
const CELLS_PER_INSTANCE: usize = 5;

/// The bitwise builtin.
///
/// Each instance holds two input cells and three output cells; an output
/// cell is deduced from the inputs as their AND, XOR or OR, provided both
/// inputs fit in [`BITWISE_TOTAL_N_BITS`] bits.
#[derive(Debug)]
pub struct Bitwise {
    state: BuiltinState,
}

impl Bitwise {
    /// Creates a new [`Bitwise`] builtin.
    pub fn new(included: bool, ratio: Option<u32>) -> Self {
        Self {
            state: BuiltinState::new(included, ratio),
        }
    }
}

impl Builtin for Bitwise {
    fn name(&self) -> BuiltinName {
        BuiltinName::Bitwise
    }

    fn state(&self) -> &BuiltinState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut BuiltinState {
        &mut self.state
    }

    fn cells_per_instance(&self) -> usize {
        CELLS_PER_INSTANCE
    }

    fn input_cells(&self) -> usize {
        2
    }

    fn deduce(&self, addr: Pointer, memory: &Memory) -> Result<Option<Value>, BuiltinError> {
        let index = addr.offset % CELLS_PER_INSTANCE;
        if index < 2 {
            return Ok(None);
        }
        let x_addr = Pointer::new(addr.segment, addr.offset - index);
        let (Some(x), Some(y)) = (
            input_felt(memory, x_addr)?,
            input_felt(memory, Pointer::new(addr.segment, x_addr.offset + 1))?,
        ) else {
            return Ok(None);
        };
        for value in [&x, &y] {
            if value.to_biguint().bits() > BITWISE_TOTAL_N_BITS as u64 {
                return Err(BuiltinError::BitwiseOutsideBounds(
                    Box::new(*value),
                    BITWISE_TOTAL_N_BITS,
                ));
            }
        }
        let (x, y) = (x.to_biguint(), y.to_biguint());
        let result = match index {
            2 => x & y,
            3 => x ^ y,
            _ => x | y,
        };
        Ok(Some(Value::Scalar(Felt::from_bytes_le_slice(
            &result.to_bytes_le(),
        ))))
    }

    fn used_diluted_check_units(&self, spacing: u32, n_bits: u32) -> usize {
        let total_n_bits = BITWISE_TOTAL_N_BITS;
        let mut partition = Vec::new();
        for i in (0..total_n_bits).step_by((spacing * n_bits) as usize) {
            for j in 0..spacing {
                if i + j < total_n_bits {
                    partition.push(i + j);
                }
            }
        }
        let num_trimmed = partition
            .iter()
            .filter(|start| *start + spacing * (n_bits - 1) + 1 > total_n_bits)
            .count();
        4 * partition.len() + num_trimmed
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SegmentManager;
    use assert_matches::assert_matches;

    fn bitwise_segment(x: u64, y: u64) -> (Bitwise, SegmentManager) {
        let mut bitwise = Bitwise::new(true, Some(256));
        let mut segments = SegmentManager::new();
        bitwise.init_segments(&mut segments);
        segments.memory.set(Pointer::new(0, 0), Felt::from(x)).unwrap();
        segments.memory.set(Pointer::new(0, 1), Felt::from(y)).unwrap();
        (bitwise, segments)
    }

    #[test]
    fn deduces_and_xor_or() {
        let (bitwise, segments) = bitwise_segment(12, 10);
        let memory = &segments.memory;
        assert_eq!(
            bitwise.deduce(Pointer::new(0, 2), memory).unwrap(),
            Some(Value::from(8u64))
        );
        assert_eq!(
            bitwise.deduce(Pointer::new(0, 3), memory).unwrap(),
            Some(Value::from(6u64))
        );
        assert_eq!(
            bitwise.deduce(Pointer::new(0, 4), memory).unwrap(),
            Some(Value::from(14u64))
        );
    }

    #[test]
    fn input_cells_are_not_deduced() {
        let (bitwise, segments) = bitwise_segment(12, 10);
        assert_eq!(bitwise.deduce(Pointer::new(0, 0), &segments.memory).unwrap(), None);
        assert_eq!(bitwise.deduce(Pointer::new(0, 1), &segments.memory).unwrap(), None);
    }

    #[test]
    fn missing_inputs_yield_no_deduction() {
        let mut bitwise = Bitwise::new(true, Some(256));
        let mut segments = SegmentManager::new();
        bitwise.init_segments(&mut segments);
        segments.memory.set(Pointer::new(0, 0), Felt::from(1)).unwrap();
        assert_eq!(
            bitwise.deduce(Pointer::new(0, 2), &segments.memory).unwrap(),
            None
        );
    }

    #[test]
    fn oversized_inputs_are_rejected() {
        let mut bitwise = Bitwise::new(true, Some(256));
        let mut segments = SegmentManager::new();
        bitwise.init_segments(&mut segments);
        let too_wide = Felt::from_hex_unchecked(
            "0x800000000000000000000000000000000000000000000000000000000000000",
        );
        segments.memory.set(Pointer::new(0, 0), too_wide).unwrap();
        segments.memory.set(Pointer::new(0, 1), Felt::ONE).unwrap();
        assert_matches!(
            bitwise.deduce(Pointer::new(0, 2), &segments.memory),
            Err(BuiltinError::BitwiseOutsideBounds(_, BITWISE_TOTAL_N_BITS))
        );
    }

    #[test]
    fn diluted_units_match_the_standard_pool() {
        let bitwise = Bitwise::new(true, Some(256));
        // 16 partition starts per step of 64 bits, of which the last 4 are
        // trimmed by the 251-bit width.
        assert_eq!(bitwise.used_diluted_check_units(4, 16), 68);
    }
}

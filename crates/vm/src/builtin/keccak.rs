//! Defines the [`Keccak`] builtin.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;

use starknet_types_core::felt::Felt;

use crate::error::BuiltinError;
use crate::memory::{Memory, Pointer, Value};

use super::{input_felt, Builtin, BuiltinName, BuiltinState};

/// The number of input cells of one Keccak instance.
pub const KECCAK_INPUT_CELLS: usize = 8;

/// The number of memory cells of one Keccak instance.
const CELLS_PER_INSTANCE: usize = 16;

/// The number of bits carried by each input or output cell.
const BITS_PER_CELL: u64 = 200;

/// The Keccak builtin.
///
/// Each instance holds eight 200-bit input cells assembling a 1600-bit
/// sponge state, and eight output cells holding the state after one
/// Keccak-f\[1600\] permutation. The permutation runs once per instance and
/// every output cell is cached.
#[derive(Debug)]
pub struct Keccak {
    state: BuiltinState,
    cache: RefCell<HashMap<usize, Felt>>,
}

impl Keccak {
    /// Creates a new [`Keccak`] builtin.
    pub fn new(included: bool, ratio: Option<u32>) -> Self {
        Self {
            state: BuiltinState::new(included, ratio),
            cache: RefCell::new(HashMap::new()),
        }
    }
}

impl Builtin for Keccak {
    fn name(&self) -> BuiltinName {
        BuiltinName::Keccak
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
        KECCAK_INPUT_CELLS
    }

    fn deduce(&self, addr: Pointer, memory: &Memory) -> Result<Option<Value>, BuiltinError> {
        let index = addr.offset % CELLS_PER_INSTANCE;
        if index < KECCAK_INPUT_CELLS {
            return Ok(None);
        }
        if let Some(output) = self.cache.borrow().get(&addr.offset) {
            return Ok(Some(Value::Scalar(*output)));
        }
        let first_input = addr.offset - index;

        // Assemble the 1600-bit state from eight little-endian 200-bit
        // words, 25 bytes per cell.
        let mut state_bytes = [0u8; 200];
        for i in 0..KECCAK_INPUT_CELLS {
            let Some(felt) = input_felt(memory, Pointer::new(addr.segment, first_input + i))?
            else {
                return Ok(None);
            };
            let word = felt.to_biguint();
            if word.bits() > BITS_PER_CELL {
                return Err(BuiltinError::KeccakOutsideBounds(Box::new(felt)));
            }
            let bytes = word.to_bytes_le();
            state_bytes[i * 25..i * 25 + bytes.len()].copy_from_slice(&bytes);
        }
        let mut lanes = [0u64; 25];
        for (i, lane) in lanes.iter_mut().enumerate() {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&state_bytes[i * 8..i * 8 + 8]);
            *lane = u64::from_le_bytes(bytes);
        }
        keccak::f1600(&mut lanes);
        let mut output_bytes = [0u8; 200];
        for (i, lane) in lanes.iter().enumerate() {
            output_bytes[i * 8..i * 8 + 8].copy_from_slice(&lane.to_le_bytes());
        }

        let mut cache = self.cache.borrow_mut();
        for i in 0..KECCAK_INPUT_CELLS {
            let word = Felt::from_bytes_le_slice(&output_bytes[i * 25..i * 25 + 25]);
            cache.insert(first_input + KECCAK_INPUT_CELLS + i, word);
        }
        Ok(cache.get(&addr.offset).copied().map(Value::Scalar))
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

    fn keccak_with_inputs(inputs: &[Felt]) -> (Keccak, SegmentManager) {
        let mut keccak = Keccak::new(true, Some(2048));
        let mut segments = SegmentManager::new();
        keccak.init_segments(&mut segments);
        for (i, input) in inputs.iter().enumerate() {
            segments.memory.set(Pointer::new(0, i), *input).unwrap();
        }
        (keccak, segments)
    }

    #[test]
    fn permutes_the_zero_state() {
        let (keccak, segments) = keccak_with_inputs(&[Felt::ZERO; 8]);
        // First 200-bit word of keccak-f[1600] over the all-zero state:
        // lanes 0..3 and the low 8 bytes of lane 3.
        let mut lanes = [0u64; 25];
        keccak::f1600(&mut lanes);
        let mut expected_bytes = [0u8; 25];
        for (i, lane) in lanes.iter().take(4).enumerate() {
            let bytes = lane.to_le_bytes();
            let end = (i * 8 + 8).min(25);
            expected_bytes[i * 8..end].copy_from_slice(&bytes[..end - i * 8]);
        }
        let expected = Felt::from_bytes_le_slice(&expected_bytes);
        assert_eq!(
            keccak.deduce(Pointer::new(0, 8), &segments.memory).unwrap(),
            Some(Value::Scalar(expected))
        );
    }

    #[test]
    fn missing_inputs_yield_no_deduction() {
        let (keccak, segments) = keccak_with_inputs(&[Felt::ZERO; 5]);
        assert_eq!(
            keccak.deduce(Pointer::new(0, 8), &segments.memory).unwrap(),
            None
        );
        assert_eq!(
            keccak.deduce(Pointer::new(0, 0), &segments.memory).unwrap(),
            None
        );
    }

    #[test]
    fn oversized_inputs_are_rejected() {
        let mut inputs = [Felt::ZERO; 8];
        inputs[0] = Felt::from_hex_unchecked("0x100000000000000000000000000000000000000000000000000");
        let (keccak, segments) = keccak_with_inputs(&inputs);
        assert_matches!(
            keccak.deduce(Pointer::new(0, 8), &segments.memory),
            Err(BuiltinError::KeccakOutsideBounds(_))
        );
    }

    #[test]
    fn every_output_cell_is_produced() {
        let inputs: Vec<Felt> = (0..8).map(Felt::from).collect();
        let (keccak, segments) = keccak_with_inputs(&inputs);
        for i in 8..16 {
            let output = keccak
                .deduce(Pointer::new(0, i), &segments.memory)
                .unwrap()
                .expect("output cell should be deduced");
            let Value::Scalar(word) = output else {
                panic!("expected a scalar output");
            };
            assert!(word.to_biguint().bits() <= 200);
        }
    }
}

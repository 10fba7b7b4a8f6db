//! Defines the [`Poseidon`] builtin.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;

use starknet_types_core::felt::Felt;
use starknet_types_core::hash::Poseidon as PoseidonHash;

use crate::error::BuiltinError;
use crate::memory::{Memory, Pointer, Value};

use super::{input_felt, Builtin, BuiltinName, BuiltinState};

/// The number of memory cells of one Poseidon instance:
/// `(x0, x1, x2, y0, y1, y2)`.
const CELLS_PER_INSTANCE: usize = 6;

/// The Poseidon builtin.
///
/// Each instance holds a full three-element state as input and its image
/// under the Hades permutation as output. One permutation produces all
/// three outputs, so they are cached per address on first deduction.
#[derive(Debug)]
pub struct Poseidon {
    state: BuiltinState,
    cache: RefCell<HashMap<usize, Felt>>,
}

impl Poseidon {
    /// Creates a new [`Poseidon`] builtin.
    pub fn new(included: bool, ratio: Option<u32>) -> Self {
        Self {
            state: BuiltinState::new(included, ratio),
            cache: RefCell::new(HashMap::new()),
        }
    }
}

impl Builtin for Poseidon {
    fn name(&self) -> BuiltinName {
        BuiltinName::Poseidon
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
        3
    }

    fn deduce(&self, addr: Pointer, memory: &Memory) -> Result<Option<Value>, BuiltinError> {
        let index = addr.offset % CELLS_PER_INSTANCE;
        if index < 3 {
            return Ok(None);
        }
        if let Some(output) = self.cache.borrow().get(&addr.offset) {
            return Ok(Some(Value::Scalar(*output)));
        }
        let first_input = addr.offset - index;
        let mut state = [Felt::ZERO; 3];
        for (i, slot) in state.iter_mut().enumerate() {
            match input_felt(memory, Pointer::new(addr.segment, first_input + i))? {
                Some(felt) => *slot = felt,
                None => return Ok(None),
            }
        }
        PoseidonHash::hades_permutation(&mut state);
        let mut cache = self.cache.borrow_mut();
        for (i, output) in state.iter().enumerate() {
            cache.insert(first_input + 3 + i, *output);
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

    #[test]
    fn deduces_the_permuted_state() {
        let mut poseidon = Poseidon::new(true, Some(32));
        let mut segments = SegmentManager::new();
        poseidon.init_segments(&mut segments);
        for i in 0..3u64 {
            segments
                .memory
                .set(Pointer::new(0, i as usize), Felt::from(i + 1))
                .unwrap();
        }
        let mut expected = [Felt::from(1), Felt::from(2), Felt::from(3)];
        PoseidonHash::hades_permutation(&mut expected);
        for (i, output) in expected.iter().enumerate() {
            assert_eq!(
                poseidon
                    .deduce(Pointer::new(0, 3 + i), &segments.memory)
                    .unwrap(),
                Some(Value::Scalar(*output))
            );
        }
    }

    #[test]
    fn inputs_and_incomplete_states_yield_no_deduction() {
        let mut poseidon = Poseidon::new(true, Some(32));
        let mut segments = SegmentManager::new();
        poseidon.init_segments(&mut segments);
        segments.memory.set(Pointer::new(0, 0), Felt::ONE).unwrap();
        assert_eq!(
            poseidon.deduce(Pointer::new(0, 0), &segments.memory).unwrap(),
            None
        );
        assert_eq!(
            poseidon.deduce(Pointer::new(0, 3), &segments.memory).unwrap(),
            None
        );
    }
}

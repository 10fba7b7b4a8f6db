//! Defines the [`Pedersen`] hash builtin.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;

use starknet_types_core::felt::Felt;
use starknet_types_core::hash::{Pedersen as PedersenHash, StarkHash};

use crate::error::BuiltinError;
use crate::memory::{Memory, Pointer, Value};

use super::{input_felt, Builtin, BuiltinName, BuiltinState};

/// The number of memory cells of one hash instance: `(x, y, h)`.
const CELLS_PER_INSTANCE: usize = 3;

/// The Pedersen hash builtin.
///
/// Each instance holds the two hash inputs followed by the output cell,
/// deduced as `pedersen(x, y)`. Hashing is expensive, so deduced outputs
/// are cached per address; the cache is internally mutable and only
/// touched from the single-threaded deduction path.
#[derive(Debug)]
pub struct Pedersen {
    state: BuiltinState,
    cache: RefCell<HashMap<usize, Felt>>,
}

impl Pedersen {
    /// Creates a new [`Pedersen`] builtin.
    pub fn new(included: bool, ratio: Option<u32>) -> Self {
        Self {
            state: BuiltinState::new(included, ratio),
            cache: RefCell::new(HashMap::new()),
        }
    }
}

impl Builtin for Pedersen {
    fn name(&self) -> BuiltinName {
        BuiltinName::Pedersen
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
        if addr.offset % CELLS_PER_INSTANCE != 2 {
            return Ok(None);
        }
        if let Some(hash) = self.cache.borrow().get(&addr.offset) {
            return Ok(Some(Value::Scalar(*hash)));
        }
        let (Some(x), Some(y)) = (
            input_felt(memory, Pointer::new(addr.segment, addr.offset - 2))?,
            input_felt(memory, Pointer::new(addr.segment, addr.offset - 1))?,
        ) else {
            return Ok(None);
        };
        let hash = PedersenHash::hash(&x, &y);
        self.cache.borrow_mut().insert(addr.offset, hash);
        Ok(Some(Value::Scalar(hash)))
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

//! Defines the [`SegmentArena`] builtin.

use std::any::Any;

use starknet_types_core::felt::Felt;

use crate::error::MemoryError;
use crate::memory::{Memory, Pointer, SegmentManager, ValidationRule, Value};

use super::{Builtin, BuiltinName, BuiltinState};

/// The number of memory cells of one arena instance:
/// `(info_ptr, n_segments, n_finalized)`.
const CELLS_PER_INSTANCE: usize = 3;

/// The segment-arena builtin.
///
/// The arena tracks dictionary-like segments allocated by the program. Its
/// segment holds one info triple per state: a pointer into a side *info*
/// segment, the number of allocated segments and the number of finalized
/// ones. The initial triple is written at initialization, so callers start
/// from `base + 3`.
#[derive(Debug)]
pub struct SegmentArena {
    state: BuiltinState,
}

impl SegmentArena {
    /// Creates a new [`SegmentArena`] builtin.
    pub fn new(included: bool) -> Self {
        Self {
            state: BuiltinState::new(included, None),
        }
    }
}

impl Builtin for SegmentArena {
    fn name(&self) -> BuiltinName {
        BuiltinName::SegmentArena
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

    fn init_segments(&mut self, segments: &mut SegmentManager) {
        let info = segments.add();
        let base = segments.add();
        // The initial state: an empty arena pointing at the info segment.
        segments
            .load_data(
                base,
                &[
                    Value::Pointer(info),
                    Value::Scalar(Felt::ZERO),
                    Value::Scalar(Felt::ZERO),
                ],
            )
            .expect("freshly allocated segment cannot reject writes");
        self.state.base = Some(base.segment as usize);
    }

    fn initial_stack(&self) -> Vec<Value> {
        if !self.state.included {
            return Vec::new();
        }
        let base = self.state.base.expect("builtin segment not initialized");
        vec![Value::Pointer(Pointer::new(
            base as isize,
            CELLS_PER_INSTANCE,
        ))]
    }

    fn add_validation_rule(&self, memory: &mut Memory) {
        let Some(base) = self.state.base else { return };
        memory.add_validation_rule(
            base,
            ValidationRule(Box::new(|memory, addr| {
                let first = addr.offset - addr.offset % CELLS_PER_INSTANCE;
                let cells: Vec<_> = (0..CELLS_PER_INSTANCE)
                    .map(|i| memory.get(Pointer::new(addr.segment, first + i)))
                    .collect();
                // Structural checks only fire once the triple completes.
                let [Some(info), Some(n_segments), Some(n_finalized)] = cells.as_slice() else {
                    return Ok(Vec::new());
                };
                let (Value::Pointer(_), Value::Scalar(n_segments), Value::Scalar(n_finalized)) =
                    (info, n_segments, n_finalized)
                else {
                    return Err(MemoryError::InvalidSegmentArena(Pointer::new(
                        addr.segment,
                        first,
                    )));
                };
                if n_finalized > n_segments {
                    return Err(MemoryError::InvalidSegmentArena(Pointer::new(
                        addr.segment,
                        first,
                    )));
                }
                Ok((0..CELLS_PER_INSTANCE)
                    .map(|i| Pointer::new(addr.segment, first + i))
                    .collect())
            })),
        );
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

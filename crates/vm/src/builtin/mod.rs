//! Defines the [`Builtin`] trait responsible for executing built-in
//! pre-defined functions.
//!
//! # Segments
//!
//! Each builtin owns a memory segment. A program talks to a builtin by
//! writing *input* cells into that segment and reading the *output* cells
//! of the same instance; the machine fills an output cell on demand by
//! *deducing* it from its peers ([`Builtin::deduce`]). Some builtins
//! instead constrain their inputs with a validation rule that runs on
//! every write ([`Builtin::add_validation_rule`]).
//!
//! The caller's function prologue receives the builtin's base pointer on
//! the stack ([`Builtin::initial_stack`]) and hands back a *stop pointer*
//! on return, which must match the cells actually used
//! ([`Builtin::final_stack`]).

mod bitwise;
mod ec_op;
mod keccak;
mod output;
mod pedersen;
mod poseidon;
mod range_check;
mod segment_arena;
mod signature;

pub use self::bitwise::*;
pub use self::ec_op::*;
pub use self::keccak::*;
pub use self::output::*;
pub use self::pedersen::*;
pub use self::poseidon::*;
pub use self::range_check::*;
pub use self::segment_arena::*;
pub use self::signature::*;

use std::any::Any;

use crate::error::{BuiltinError, MathError, RunnerError};
use crate::memory::{Memory, Pointer, SegmentManager, Value};

/// The name of a builtin, in the canonical order programs must declare
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinName {
    /// The write-through output builtin.
    Output,
    /// The Pedersen hash builtin.
    Pedersen,
    /// The 128-bit range-check builtin.
    RangeCheck,
    /// The ECDSA signature-verification builtin.
    Ecdsa,
    /// The bitwise AND/XOR/OR builtin.
    Bitwise,
    /// The STARK-curve operation builtin.
    EcOp,
    /// The Keccak-f\[1600\] builtin.
    Keccak,
    /// The Poseidon permutation builtin.
    Poseidon,
    /// The segment-arena bookkeeping builtin.
    SegmentArena,
}

impl BuiltinName {
    /// Every builtin, in the canonical declaration order.
    pub const ALL: [Self; 9] = [
        Self::Output,
        Self::Pedersen,
        Self::RangeCheck,
        Self::Ecdsa,
        Self::Bitwise,
        Self::EcOp,
        Self::Keccak,
        Self::Poseidon,
        Self::SegmentArena,
    ];

    /// Returns the name as it appears in compiled programs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Output => "output",
            Self::Pedersen => "pedersen",
            Self::RangeCheck => "range_check",
            Self::Ecdsa => "ecdsa",
            Self::Bitwise => "bitwise",
            Self::EcOp => "ec_op",
            Self::Keccak => "keccak",
            Self::Poseidon => "poseidon",
            Self::SegmentArena => "segment_arena",
        }
    }

    /// Parses a builtin name as it appears in compiled programs.
    pub fn from_str(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.as_str() == name)
    }
}

impl std::fmt::Display for BuiltinName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The bookkeeping state shared by every builtin implementation.
#[derive(Debug, Clone, Default)]
pub struct BuiltinState {
    /// The index of the segment owned by the builtin, once allocated.
    pub(crate) base: Option<usize>,
    /// The offset of the stop pointer collected on return, if any.
    pub(crate) stop_ptr: Option<usize>,
    /// Whether the program actually declared this builtin.
    ///
    /// A builtin present in the layout but not declared by the program is
    /// constructed un-included: it still owns a segment but contributes an
    /// empty initial stack and skips stop-pointer processing.
    pub(crate) included: bool,
    /// The instances-per-step ratio of the layout, when the builtin has
    /// one.
    pub(crate) ratio: Option<u32>,
}

impl BuiltinState {
    /// Creates the state of an included builtin with the provided ratio.
    pub fn new(included: bool, ratio: Option<u32>) -> Self {
        Self {
            base: None,
            stop_ptr: None,
            included,
            ratio,
        }
    }
}

/// A builtin that may be executed by the virtual machine.
///
/// Implementations provide the deduction or validation semantics; segment
/// allocation, stack processing and usage accounting share the default
/// methods, which go through [`Builtin::state`].
pub trait Builtin: Any {
    /// Returns the name of this builtin.
    fn name(&self) -> BuiltinName;

    /// Returns the shared bookkeeping state of this builtin.
    fn state(&self) -> &BuiltinState;

    /// Returns the shared bookkeeping state of this builtin, mutably.
    fn state_mut(&mut self) -> &mut BuiltinState;

    /// Returns the number of memory cells of one instance of this builtin.
    fn cells_per_instance(&self) -> usize {
        1
    }

    /// Returns the number of input cells of one instance of this builtin.
    fn input_cells(&self) -> usize {
        self.cells_per_instance()
    }

    /// Allocates the builtin's segment and stores its base.
    fn init_segments(&mut self, segments: &mut SegmentManager) {
        self.state_mut().base = Some(segments.add().segment as usize);
    }

    /// Returns the values the caller must push on function entry.
    ///
    /// # Panics
    ///
    /// Panics if the builtin is included and its segment has not been
    /// initialized; runners always initialize segments first.
    fn initial_stack(&self) -> Vec<Value> {
        if !self.state().included {
            return Vec::new();
        }
        let base = self.state().base.expect("builtin segment not initialized");
        vec![Value::Pointer(Pointer::new(base as isize, 0))]
    }

    /// Registers the builtin's validation rule on its segment, if it has
    /// one.
    fn add_validation_rule(&self, memory: &mut Memory) {
        let _ = memory;
    }

    /// Attempts to deduce the value of the cell at `addr` from its peer
    /// cells.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(_))` with the deduced value;
    ///
    /// - `Ok(None)` when the cell is an input cell, or when the peers
    ///   needed for the deduction are not known yet;
    ///
    /// - `Err(_)` when the peers are known but violate the builtin's
    ///   constraints.
    fn deduce(&self, addr: Pointer, memory: &Memory) -> Result<Option<Value>, BuiltinError> {
        let _ = (addr, memory);
        Ok(None)
    }

    /// Returns the index of the segment owned by this builtin, once
    /// allocated.
    fn base(&self) -> Option<usize> {
        self.state().base
    }

    /// Returns the builtin's segment index and collected stop offset, for
    /// relocation reporting.
    fn segment_addresses(&self) -> (Option<usize>, Option<usize>) {
        (self.state().base, self.state().stop_ptr)
    }

    /// Returns the number of cells of the builtin's segment the program
    /// used.
    ///
    /// Requires effective sizes to have been computed.
    fn used_cells(&self, segments: &SegmentManager) -> Option<usize> {
        segments.used_size(self.state().base?)
    }

    /// Returns the number of instances of this builtin the program used.
    fn used_instances(&self, segments: &SegmentManager) -> Option<usize> {
        Some(self.used_cells(segments)?.div_ceil(self.cells_per_instance()))
    }

    /// Returns this builtin's contribution to the permanent range-check
    /// unit budget.
    fn used_perm_range_check_units(&self, segments: &SegmentManager) -> usize {
        let _ = segments;
        0
    }

    /// Returns this builtin's contribution to the diluted-check pool for
    /// one full ratio of instances.
    fn used_diluted_check_units(&self, spacing: u32, n_bits: u32) -> usize {
        let _ = (spacing, n_bits);
        0
    }

    /// Returns the number of memory cells this builtin is allocated for a
    /// run of `steps` steps.
    fn allocated_memory_units(&self, steps: usize) -> Result<usize, MathError> {
        let Some(ratio) = self.state().ratio else {
            return Ok(0);
        };
        let ratio = ratio as usize;
        if steps % ratio != 0 {
            return Err(MathError::NotDivisible(steps, ratio));
        }
        Ok(self.cells_per_instance() * (steps / ratio))
    }

    /// Consumes the builtin's stop pointer from the caller's return stack.
    ///
    /// # Returns
    ///
    /// The stack pointer below the consumed cell, or the unchanged pointer
    /// for a builtin the program did not include.
    fn final_stack(
        &mut self,
        segments: &SegmentManager,
        pointer: Pointer,
    ) -> Result<Pointer, RunnerError> {
        let name = self.name().as_str();
        if !self.state().included {
            self.state_mut().stop_ptr = Some(0);
            return Ok(pointer);
        }
        let stop_addr = pointer
            .sub(1)
            .map_err(|_| RunnerError::NoStopPointer(name))?;
        let stop = segments
            .memory
            .get_pointer(stop_addr)
            .map_err(|_| RunnerError::NoStopPointer(name))?;
        let base = self.state().base.ok_or(RunnerError::NoStopPointer(name))?;
        let used = self
            .used_cells(segments)
            .ok_or(RunnerError::BaseNotFinished(base))?;
        let expected = Pointer::new(base as isize, used);
        if stop != expected {
            return Err(RunnerError::InvalidStopPointer {
                name,
                expected,
                got: stop,
            });
        }
        self.state_mut().stop_ptr = Some(stop.offset);
        Ok(stop_addr)
    }

    /// Returns this builtin as a mutable [`Any`], for callers that need a
    /// concrete runner (e.g. to feed signatures).
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Reads the scalar input cell at `addr`, mapping a pointer to the
/// builtin-input error and a missing cell to `None`.
pub(crate) fn input_felt(
    memory: &Memory,
    addr: Pointer,
) -> Result<Option<starknet_types_core::felt::Felt>, BuiltinError> {
    match memory.get(addr) {
        None => Ok(None),
        Some(Value::Scalar(felt)) => Ok(Some(felt)),
        Some(Value::Pointer(_)) => Err(BuiltinError::ExpectedScalar(addr)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use starknet_types_core::felt::Felt;

    #[test]
    fn canonical_order_round_trips_through_names() {
        for name in BuiltinName::ALL {
            assert_eq!(BuiltinName::from_str(name.as_str()), Some(name));
        }
        assert_eq!(BuiltinName::from_str("blake2s"), None);
    }

    #[test]
    fn unincluded_builtins_contribute_an_empty_stack() {
        let mut output = Output::new(false);
        let mut segments = SegmentManager::new();
        output.init_segments(&mut segments);
        assert!(output.initial_stack().is_empty());
        let ptr = Pointer::new(1, 4);
        assert_eq!(output.final_stack(&segments, ptr).unwrap(), ptr);
        assert_eq!(output.segment_addresses(), (Some(0), Some(0)));
    }

    #[test]
    fn final_stack_consumes_the_stop_pointer() {
        let mut output = Output::new(true);
        let mut segments = SegmentManager::new();
        output.init_segments(&mut segments);
        let exec = segments.add();
        // The builtin used two cells; the caller returns `base + 2`.
        let base = Pointer::new(output.base().unwrap() as isize, 0);
        segments.memory.set(base, Felt::from(1)).unwrap();
        segments.memory.set(base.add(1).unwrap(), Felt::from(2)).unwrap();
        segments
            .memory
            .set(exec, base.add(2).unwrap())
            .unwrap();
        segments.compute_effective_sizes();
        let new_ptr = output
            .final_stack(&segments, exec.add(1).unwrap())
            .unwrap();
        assert_eq!(new_ptr, exec);
        assert_eq!(output.segment_addresses(), (Some(0), Some(2)));
    }

    #[test]
    fn final_stack_rejects_a_wrong_stop_pointer() {
        use assert_matches::assert_matches;

        let mut output = Output::new(true);
        let mut segments = SegmentManager::new();
        output.init_segments(&mut segments);
        let exec = segments.add();
        let base = Pointer::new(output.base().unwrap() as isize, 0);
        segments.memory.set(base, Felt::from(1)).unwrap();
        // Stop pointer claims zero used cells while one is in use.
        segments.memory.set(exec, base).unwrap();
        segments.compute_effective_sizes();
        assert_matches!(
            output.final_stack(&segments, exec.add(1).unwrap()),
            Err(RunnerError::InvalidStopPointer { name: "output", .. })
        );
    }
}

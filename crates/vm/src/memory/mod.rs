//! Defines the [`Memory`] type, responsible for representing the memory of
//! a Cairo virtual machine.
//!
//! # Immutable Memory
//!
//! The memory of a Cairo virtual machine does not work the way regular
//! computer memory does. Instead, it is mathematically immutable: every
//! operation that would normally mutate memory instead *asserts* a memory
//! cell to a specific value. The value was previously unknown, and now it is
//! defined. Any later write to that cell must confirm the value it was
//! asserted to, otherwise the machine is caught in a contradiction and the
//! run aborts.
//!
//! # Segments
//!
//! The address space of the machine has the size of the field, which cannot
//! be represented in a real computer's memory. Programs therefore split
//! their memory into *segments*, contiguous blocks whose final location is
//! only decided once the program has finished running. Real segments carry
//! non-negative indices. *Temporary* segments carry negative indices and
//! exist so hints can allocate scratch space without knowing the real
//! layout; a relocation rule moves each of them onto a real segment before
//! final relocation.

mod pointer;
mod segment;
mod segments;
mod value;

pub use self::pointer::*;
pub use self::segment::*;
pub use self::segments::*;
pub use self::value::*;

use std::collections::HashMap;
use std::fmt;

use bitvec::vec::BitVec;
use starknet_types_core::felt::Felt;

use crate::error::MemoryError;

/// Splits a [`Pointer`] into the index of its backing segment array and the
/// offset within it.
///
/// Temporary segment `-1` maps to index `0`, `-2` to `1`, and so on.
#[inline]
pub(crate) fn storage_index(p: Pointer) -> (usize, usize) {
    if p.segment < 0 {
        ((-(p.segment + 1)) as usize, p.offset)
    } else {
        (p.segment as usize, p.offset)
    }
}

/// The set of addresses that have passed a validation rule.
///
/// Only real segments can hold validated addresses; temporary addresses are
/// never validated.
#[derive(Debug, Default)]
pub(crate) struct AddressSet(Vec<BitVec>);

impl AddressSet {
    pub(crate) const fn new() -> Self {
        Self(Vec::new())
    }

    pub(crate) fn contains(&self, addr: Pointer) -> bool {
        if addr.segment < 0 {
            return false;
        }
        self.0
            .get(addr.segment as usize)
            .and_then(|segment| segment.get(addr.offset))
            .map(|bit| *bit)
            .unwrap_or(false)
    }

    pub(crate) fn extend(&mut self, addresses: &[Pointer]) {
        for addr in addresses {
            if addr.segment < 0 {
                continue;
            }
            let segment = addr.segment as usize;
            if segment >= self.0.len() {
                self.0.resize(segment + 1, BitVec::new());
            }
            if addr.offset >= self.0[segment].len() {
                self.0[segment].resize(addr.offset + 1, false);
            }
            self.0[segment].set(addr.offset, true);
        }
    }
}

/// A predicate run against every cell asserted in a segment.
///
/// The rule either rejects the write or returns the list of addresses it
/// validated, which are recorded so the rule is not run twice for the same
/// cell.
pub struct ValidationRule(
    #[allow(clippy::type_complexity)]
    pub Box<dyn Fn(&Memory, Pointer) -> Result<Vec<Pointer>, MemoryError>>,
);

impl fmt::Debug for ValidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ValidationRule")
    }
}

/// Represents the memory of the Cairo virtual machine.
///
/// More information on the memory model can be found in the
/// [module-level documentation](self).
#[derive(Default)]
pub struct Memory {
    /// The real segments, indexed by their segment index.
    pub(crate) data: Vec<Segment>,
    /// The temporary segments; segment index `-i` lives at `i - 1`.
    pub(crate) temp_data: Vec<Segment>,
    /// Addresses that have passed the validation rule of their segment.
    validated_addresses: AddressSet,
    /// One optional validation rule per real segment.
    validation_rules: Vec<Option<ValidationRule>>,
    /// Destination of each temporary segment; keys index `temp_data`.
    relocation_rules: HashMap<usize, Pointer>,
}

impl Memory {
    /// Creates a new, empty [`Memory`] with no allocated segments.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of real segments allocated so far.
    #[inline(always)]
    pub fn segment_count(&self) -> usize {
        self.data.len()
    }

    /// Returns the number of temporary segments allocated so far.
    #[inline(always)]
    pub fn temp_segment_count(&self) -> usize {
        self.temp_data.len()
    }

    /// Returns a [`Segment`] of the memory, real or temporary.
    pub fn segment(&self, segment: isize) -> Option<&Segment> {
        let data = if segment < 0 { &self.temp_data } else { &self.data };
        data.get(storage_index(Pointer::new(segment, 0)).0)
    }

    fn segment_mut(&mut self, segment: isize) -> Result<&mut Segment, MemoryError> {
        let data = if segment < 0 {
            &mut self.temp_data
        } else {
            &mut self.data
        };
        let len = data.len();
        data.get_mut(storage_index(Pointer::new(segment, 0)).0)
            .ok_or(MemoryError::UnallocatedSegment {
                index: segment,
                len,
            })
    }

    /// Attempts to assert the cell at `addr` to `value`.
    ///
    /// # Returns
    ///
    /// - `Ok(())` if the cell was unknown (it now holds `value`) or already
    ///   held exactly `value`.
    ///
    /// - [`MemoryError::Inconsistent`] if the cell was already asserted to
    ///   a different value.
    ///
    /// - [`MemoryError::UnallocatedSegment`] if no segment exists at the
    ///   address.
    ///
    /// If the target segment carries a validation rule, the rule runs
    /// against the freshly asserted cell and its failure aborts the write.
    pub fn set(&mut self, addr: Pointer, value: impl Into<Value>) -> Result<(), MemoryError> {
        let value = value.into();
        let (_, offset) = storage_index(addr);
        self.segment_mut(addr.segment)?
            .set(offset, value)
            .map_err(|existing| MemoryError::Inconsistent {
                at: addr,
                existing: Box::new(existing),
                attempted: Box::new(value),
            })?;
        self.validate_cell(addr)
    }

    /// Returns the value asserted at `addr`, if any.
    ///
    /// Pointers read from memory are passed through the relocation rules,
    /// so a reference into an already-relocated temporary segment reads as
    /// its final destination.
    pub fn get(&self, addr: Pointer) -> Option<Value> {
        let (index, offset) = storage_index(addr);
        let data = if addr.segment < 0 { &self.temp_data } else { &self.data };
        let cell = data.get(index)?.get(offset)?;
        Some(self.relocate_value(cell.value()))
    }

    /// Returns the scalar asserted at `addr`.
    ///
    /// # Returns
    ///
    /// [`MemoryError::UnknownCell`] if the cell was never asserted, and
    /// [`MemoryError::ExpectedScalar`] if it holds a pointer.
    pub fn get_felt(&self, addr: Pointer) -> Result<Felt, MemoryError> {
        match self.get(addr).ok_or(MemoryError::UnknownCell(addr))? {
            Value::Scalar(felt) => Ok(felt),
            Value::Pointer(_) => Err(MemoryError::ExpectedScalar(addr)),
        }
    }

    /// Returns the pointer asserted at `addr`.
    ///
    /// # Returns
    ///
    /// [`MemoryError::UnknownCell`] if the cell was never asserted, and
    /// [`MemoryError::ExpectedPointer`] if it holds a scalar.
    pub fn get_pointer(&self, addr: Pointer) -> Result<Pointer, MemoryError> {
        match self.get(addr).ok_or(MemoryError::UnknownCell(addr))? {
            Value::Pointer(pointer) => Ok(pointer),
            Value::Scalar(_) => Err(MemoryError::ExpectedPointer(addr)),
        }
    }

    /// Reads `len` consecutive cells starting at `addr`.
    ///
    /// Gaps in the underlying segment read as `None`.
    pub fn get_range(&self, addr: Pointer, len: usize) -> Vec<Option<Value>> {
        (0..len)
            .map(|i| addr.add(i).ok().and_then(|addr| self.get(addr)))
            .collect()
    }

    /// Reads `len` consecutive cells starting at `addr`, failing on gaps.
    pub fn get_value_range(&self, addr: Pointer, len: usize) -> Result<Vec<Value>, MemoryError> {
        (0..len)
            .map(|i| {
                self.get(addr.add(i)?)
                    .ok_or(MemoryError::RangeGap { at: addr, len })
            })
            .collect()
    }

    /// Reads `len` consecutive scalars starting at `addr`, failing on gaps
    /// and on any pointer in the range.
    pub fn get_felt_range(&self, addr: Pointer, len: usize) -> Result<Vec<Felt>, MemoryError> {
        (0..len).map(|i| self.get_felt(addr.add(i)?)).collect()
    }

    /// Marks the cell at `addr` as accessed by the running program.
    pub fn mark_accessed(&mut self, addr: Pointer) {
        let (index, offset) = storage_index(addr);
        let data = if addr.segment < 0 {
            &mut self.temp_data
        } else {
            &mut self.data
        };
        if let Some(segment) = data.get_mut(index) {
            segment.mark_accessed(offset);
        }
    }

    /// Returns the number of accessed cells in the real segment `index`.
    pub fn accessed_count(&self, index: usize) -> Option<usize> {
        Some(self.data.get(index)?.accessed_count())
    }

    /// Registers a validation rule for the real segment `index`.
    ///
    /// The rule runs against every cell already asserted in the segment
    /// when [`Memory::validate_existing_memory`] is called, and against
    /// each new cell as it is asserted.
    pub fn add_validation_rule(&mut self, index: usize, rule: ValidationRule) {
        if index >= self.validation_rules.len() {
            self.validation_rules.resize_with(index + 1, || None);
        }
        self.validation_rules[index] = Some(rule);
    }

    /// Returns whether `addr` has passed its segment's validation rule.
    pub fn is_validated(&self, addr: Pointer) -> bool {
        self.validated_addresses.contains(addr)
    }

    fn validate_cell(&mut self, addr: Pointer) -> Result<(), MemoryError> {
        if addr.segment < 0 {
            return Ok(());
        }
        if let Some(Some(rule)) = self.validation_rules.get(addr.segment as usize) {
            if !self.validated_addresses.contains(addr) {
                let validated = rule.0(self, addr)?;
                self.validated_addresses.extend(&validated);
            }
        }
        Ok(())
    }

    /// Applies every registered validation rule to the cells currently
    /// asserted in its segment.
    pub fn validate_existing_memory(&mut self) -> Result<(), MemoryError> {
        for index in 0..self.validation_rules.len().min(self.data.len()) {
            if self.validation_rules[index].is_none() {
                continue;
            }
            for offset in 0..self.data[index].len() {
                if self.data[index].get(offset).is_none() {
                    continue;
                }
                self.validate_cell(Pointer::new(index as isize, offset))?;
            }
        }
        Ok(())
    }

    /// Registers a relocation rule moving the temporary segment at
    /// `src` onto `dst`.
    ///
    /// # Returns
    ///
    /// An error if `src` is not the base of a temporary segment
    /// ([`MemoryError::AddressNotTemporary`], [`MemoryError::NonZeroOffset`])
    /// or if the segment already has a rule
    /// ([`MemoryError::DuplicatedRelocation`]).
    pub fn add_relocation_rule(&mut self, src: Pointer, dst: Pointer) -> Result<(), MemoryError> {
        if src.segment >= 0 {
            return Err(MemoryError::AddressNotTemporary(src.segment));
        }
        if src.offset != 0 {
            return Err(MemoryError::NonZeroOffset(src.offset));
        }
        let index = (-(src.segment + 1)) as usize;
        if self.relocation_rules.contains_key(&index) {
            return Err(MemoryError::DuplicatedRelocation(src.segment));
        }
        self.relocation_rules.insert(index, dst);
        Ok(())
    }

    /// Rewrites a pointer through the relocation rules.
    ///
    /// Pointers into real segments, and into temporary segments with no
    /// rule yet, are returned unchanged.
    pub fn relocate_pointer(&self, addr: Pointer) -> Pointer {
        if addr.segment >= 0 {
            return addr;
        }
        match self.relocation_rules.get(&((-(addr.segment + 1)) as usize)) {
            // The rule destination is a segment base, so the add cannot
            // leave the representable range before memory itself does.
            Some(dst) => Pointer::new(dst.segment, dst.offset + addr.offset),
            None => addr,
        }
    }

    /// Rewrites a value through the relocation rules.
    #[inline]
    pub fn relocate_value(&self, value: Value) -> Value {
        match value {
            Value::Scalar(_) => value,
            Value::Pointer(addr) => Value::Pointer(self.relocate_pointer(addr)),
        }
    }

    /// Applies the relocation rules to the whole memory, moving each
    /// temporary segment with a rule onto its destination, and clears the
    /// rules.
    ///
    /// Moved cells are asserted at their destination under the usual
    /// frozen-value semantics, so a destination cell that already holds a
    /// contradicting value fails the relocation.
    pub fn relocate_memory(&mut self) -> Result<(), MemoryError> {
        if self.relocation_rules.is_empty() || self.temp_data.is_empty() {
            return Ok(());
        }
        let rules = std::mem::take(&mut self.relocation_rules);
        let relocate = |addr: Pointer| -> Pointer {
            if addr.segment >= 0 {
                return addr;
            }
            match rules.get(&((-(addr.segment + 1)) as usize)) {
                Some(dst) => Pointer::new(dst.segment, dst.offset + addr.offset),
                None => addr,
            }
        };
        for segment in self.data.iter_mut().chain(self.temp_data.iter_mut()) {
            segment.relocate_values(relocate);
        }
        for index in (0..self.temp_data.len()).rev() {
            let Some(base) = rules.get(&index) else { continue };
            let segment = self.temp_data.remove(index);
            let mut addr = *base;
            for cell in segment.iter() {
                if let Some(cell) = cell {
                    self.set(addr, cell.value())?;
                }
                addr = addr.add(1)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memory")
            .field("segments", &self.data.len())
            .field("temp_segments", &self.temp_data.len())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.temp_data.iter().enumerate() {
            for (j, cell) in segment.iter().enumerate() {
                if let Some(cell) = cell {
                    writeln!(f, "(-{},{j}) : {}", i + 1, cell.value())?;
                }
            }
        }
        for (i, segment) in self.data.iter().enumerate() {
            for (j, cell) in segment.iter().enumerate() {
                if let Some(cell) = cell {
                    writeln!(f, "({i},{j}) : {}", cell.value())?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use starknet_types_core::felt::Felt;

    fn memory_with_segments(real: usize, temp: usize) -> Memory {
        let mut memory = Memory::new();
        memory.data.resize_with(real, Segment::new);
        memory.temp_data.resize_with(temp, Segment::new);
        memory
    }

    #[test]
    fn set_and_get() {
        let mut memory = memory_with_segments(1, 0);
        let addr = Pointer::new(0, 0);
        memory.set(addr, Felt::from(5)).unwrap();
        assert_eq!(memory.get(addr), Some(Value::from(5u64)));
    }

    #[test]
    fn set_rejects_contradiction() {
        let mut memory = memory_with_segments(1, 0);
        let addr = Pointer::new(0, 0);
        memory.set(addr, Felt::from(1)).unwrap();
        assert_matches!(
            memory.set(addr, Felt::from(2)),
            Err(MemoryError::Inconsistent { at, existing, attempted })
                if at == addr
                    && *existing == Value::from(1u64)
                    && *attempted == Value::from(2u64)
        );
    }

    #[test]
    fn set_unallocated_segment_fails() {
        let mut memory = memory_with_segments(1, 0);
        assert_matches!(
            memory.set(Pointer::new(3, 0), Felt::ONE),
            Err(MemoryError::UnallocatedSegment { index: 3, len: 1 })
        );
    }

    #[test]
    fn temporary_segments_have_their_own_storage() {
        let mut memory = memory_with_segments(1, 1);
        memory.set(Pointer::new(-1, 2), Felt::from(8)).unwrap();
        assert_eq!(memory.get(Pointer::new(-1, 2)), Some(Value::from(8u64)));
        assert_eq!(memory.get(Pointer::new(0, 2)), None);
    }

    #[test]
    fn typed_accessors_check_the_variant() {
        let mut memory = memory_with_segments(2, 0);
        memory.set(Pointer::new(0, 0), Felt::from(5)).unwrap();
        memory.set(Pointer::new(0, 1), Pointer::new(1, 0)).unwrap();
        assert_eq!(memory.get_felt(Pointer::new(0, 0)).unwrap(), Felt::from(5));
        assert_matches!(
            memory.get_felt(Pointer::new(0, 1)),
            Err(MemoryError::ExpectedScalar(_))
        );
        assert_matches!(
            memory.get_pointer(Pointer::new(0, 0)),
            Err(MemoryError::ExpectedPointer(_))
        );
        assert_matches!(
            memory.get_felt(Pointer::new(0, 2)),
            Err(MemoryError::UnknownCell(_))
        );
    }

    #[test]
    fn range_reads() {
        let mut memory = memory_with_segments(1, 0);
        memory.set(Pointer::new(0, 0), Felt::from(1)).unwrap();
        memory.set(Pointer::new(0, 2), Felt::from(3)).unwrap();
        let range = memory.get_range(Pointer::new(0, 0), 3);
        assert_eq!(
            range,
            vec![Some(Value::from(1u64)), None, Some(Value::from(3u64))]
        );
        assert_matches!(
            memory.get_value_range(Pointer::new(0, 0), 3),
            Err(MemoryError::RangeGap { .. })
        );
        memory.set(Pointer::new(0, 1), Felt::from(2)).unwrap();
        assert_eq!(
            memory.get_felt_range(Pointer::new(0, 0), 3).unwrap(),
            vec![Felt::from(1), Felt::from(2), Felt::from(3)]
        );
    }

    #[test]
    fn relocation_rule_preconditions() {
        let mut memory = memory_with_segments(1, 2);
        assert_matches!(
            memory.add_relocation_rule(Pointer::new(0, 0), Pointer::new(0, 0)),
            Err(MemoryError::AddressNotTemporary(0))
        );
        assert_matches!(
            memory.add_relocation_rule(Pointer::new(-1, 3), Pointer::new(0, 0)),
            Err(MemoryError::NonZeroOffset(3))
        );
        memory
            .add_relocation_rule(Pointer::new(-1, 0), Pointer::new(0, 0))
            .unwrap();
        assert_matches!(
            memory.add_relocation_rule(Pointer::new(-1, 0), Pointer::new(0, 5)),
            Err(MemoryError::DuplicatedRelocation(-1))
        );
    }

    #[test]
    fn reads_are_rewritten_through_relocation_rules() {
        let mut memory = memory_with_segments(1, 1);
        memory
            .set(Pointer::new(0, 0), Pointer::new(-1, 2))
            .unwrap();
        memory
            .add_relocation_rule(Pointer::new(-1, 0), Pointer::new(0, 10))
            .unwrap();
        assert_eq!(
            memory.get(Pointer::new(0, 0)),
            Some(Value::Pointer(Pointer::new(0, 12)))
        );
    }

    #[test]
    fn relocate_memory_moves_temporary_segments() {
        let mut memory = memory_with_segments(1, 1);
        memory.set(Pointer::new(-1, 0), Felt::from(1)).unwrap();
        memory.set(Pointer::new(-1, 1), Felt::from(2)).unwrap();
        memory
            .set(Pointer::new(0, 0), Pointer::new(-1, 1))
            .unwrap();
        memory
            .add_relocation_rule(Pointer::new(-1, 0), Pointer::new(0, 4))
            .unwrap();
        memory.relocate_memory().unwrap();
        assert_eq!(memory.temp_segment_count(), 0);
        assert_eq!(
            memory.get(Pointer::new(0, 0)),
            Some(Value::Pointer(Pointer::new(0, 5)))
        );
        assert_eq!(memory.get(Pointer::new(0, 4)), Some(Value::from(1u64)));
        assert_eq!(memory.get(Pointer::new(0, 5)), Some(Value::from(2u64)));
    }

    #[test]
    fn validation_rule_runs_on_write() {
        let mut memory = memory_with_segments(1, 0);
        memory.add_validation_rule(
            0,
            ValidationRule(Box::new(|memory, addr| {
                let felt = memory.get_felt(addr)?;
                if felt < Felt::from(100) {
                    Ok(vec![addr])
                } else {
                    Err(MemoryError::RangeCheckOutOfBounds(Box::new(felt)))
                }
            })),
        );
        memory.set(Pointer::new(0, 0), Felt::from(5)).unwrap();
        assert!(memory.is_validated(Pointer::new(0, 0)));
        assert_matches!(
            memory.set(Pointer::new(0, 1), Felt::from(200)),
            Err(MemoryError::RangeCheckOutOfBounds(_))
        );
        assert!(!memory.is_validated(Pointer::new(0, 1)));
    }

    #[test]
    fn validate_existing_memory_covers_prior_writes() {
        let mut memory = memory_with_segments(1, 0);
        memory.set(Pointer::new(0, 0), Felt::from(5)).unwrap();
        memory.add_validation_rule(
            0,
            ValidationRule(Box::new(|memory, addr| {
                memory.get_felt(addr)?;
                Ok(vec![addr])
            })),
        );
        assert!(!memory.is_validated(Pointer::new(0, 0)));
        memory.validate_existing_memory().unwrap();
        assert!(memory.is_validated(Pointer::new(0, 0)));
    }
}

//! Defines the [`SegmentManager`] type, responsible for segment-level
//! bookkeeping on top of [`Memory`].
//!
//! The manager allocates real and temporary segments, loads data into them,
//! computes the effective (used) size of every segment once a run is over,
//! produces the relocation base table, and keeps track of finalized sizes
//! and public-memory offsets for the prover.

use std::collections::HashMap;

use starknet_types_core::felt::Felt;

use crate::error::MemoryError;

use super::{Memory, Pointer, Segment, Value};

/// An argument that can be materialized into memory by
/// [`SegmentManager::gen_arg`].
#[derive(Debug, Clone)]
pub enum Arg {
    /// A single value, passed through unchanged.
    Value(Value),
    /// A flat sequence of values, loaded into a fresh segment.
    Values(Vec<Value>),
    /// A sequence of arguments, each materialized on its own, whose
    /// resulting values are loaded into a fresh segment.
    Composed(Vec<Arg>),
}

impl From<Felt> for Arg {
    fn from(value: Felt) -> Self {
        Self::Value(Value::Scalar(value))
    }
}

impl From<Pointer> for Arg {
    fn from(value: Pointer) -> Self {
        Self::Value(Value::Pointer(value))
    }
}

/// Wraps a [`Memory`] with segment-level bookkeeping.
#[derive(Debug, Default)]
pub struct SegmentManager {
    /// The managed memory.
    pub memory: Memory,
    /// The used size of every real segment, computed after the run.
    segment_used_sizes: Option<Vec<usize>>,
    /// Finalized sizes, overriding used sizes during relocation.
    segment_sizes: HashMap<usize, usize>,
    /// Public memory offsets per segment, as `(offset, page)` pairs.
    public_memory_offsets: HashMap<usize, Vec<(usize, usize)>>,
}

impl SegmentManager {
    /// Creates a manager over an empty [`Memory`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a new real segment and returns its base pointer.
    pub fn add(&mut self) -> Pointer {
        self.memory.data.push(Segment::new());
        Pointer::new((self.memory.data.len() - 1) as isize, 0)
    }

    /// Allocates a new temporary segment and returns its base pointer.
    ///
    /// The returned segment index is negative; the segment's contents will
    /// only survive relocation if a relocation rule is registered for it.
    pub fn add_temp(&mut self) -> Pointer {
        self.memory.temp_data.push(Segment::new());
        Pointer::new(-(self.memory.temp_data.len() as isize), 0)
    }

    /// Writes `data` consecutively starting at `ptr`.
    ///
    /// # Returns
    ///
    /// The first address past the written range.
    pub fn load_data(&mut self, ptr: Pointer, data: &[Value]) -> Result<Pointer, MemoryError> {
        for (i, value) in data.iter().enumerate() {
            self.memory.set(ptr.add(i)?, *value)?;
        }
        ptr.add(data.len()).map_err(MemoryError::Math)
    }

    /// Populates the used size of every real segment from the current
    /// cells.
    ///
    /// The computation is idempotent: once populated, the recorded sizes
    /// are returned unchanged. Temporary segments are not sized; they must
    /// have been moved by their relocation rules for the result to be
    /// meaningful.
    pub fn compute_effective_sizes(&mut self) -> &[usize] {
        self.segment_used_sizes
            .get_or_insert_with(|| self.memory.data.iter().map(Segment::len).collect())
    }

    /// Returns the used size of the real segment `index`, if sizes have
    /// been computed.
    pub fn used_size(&self, index: usize) -> Option<usize> {
        self.segment_used_sizes.as_ref()?.get(index).copied()
    }

    /// Returns the size the real segment `index` will occupy after
    /// relocation: its finalized size if one was recorded, its used size
    /// otherwise.
    pub fn segment_size(&self, index: usize) -> Option<usize> {
        self.segment_sizes
            .get(&index)
            .copied()
            .or_else(|| self.used_size(index))
    }

    /// Builds the relocation base table.
    ///
    /// Flat addresses start at 1, so `base[0] = 1` and each subsequent
    /// segment starts where the previous one ends.
    ///
    /// # Returns
    ///
    /// [`MemoryError::MissingSegmentSizes`] if
    /// [`SegmentManager::compute_effective_sizes`] has not run yet.
    pub fn relocate_segments(&self) -> Result<Vec<usize>, MemoryError> {
        let used_sizes = self
            .segment_used_sizes
            .as_ref()
            .ok_or(MemoryError::MissingSegmentSizes)?;
        let mut bases = Vec::with_capacity(used_sizes.len() + 1);
        let mut base = 1;
        for index in 0..used_sizes.len() {
            bases.push(base);
            // A finalized size overrides the observed one.
            base += self.segment_size(index).unwrap_or(used_sizes[index]);
        }
        Ok(bases)
    }

    /// Records the final size and public-memory offsets of the real
    /// segment `index`.
    ///
    /// Both parts are optional: a builtin may finalize only its size, while
    /// the execution segment finalizes only its public offsets.
    pub fn finalize(
        &mut self,
        index: usize,
        size: Option<usize>,
        public_memory: Option<Vec<(usize, usize)>>,
    ) {
        if let Some(size) = size {
            self.segment_sizes.insert(index, size);
        }
        if let Some(public_memory) = public_memory {
            self.public_memory_offsets.insert(index, public_memory);
        }
    }

    /// Emits the flat addresses of the public memory.
    ///
    /// # Returns
    ///
    /// `(flat_address, page_id)` pairs for every finalized public entry, or
    /// [`MemoryError::MalformedPublicMemory`] when the base table does not
    /// cover a segment with public offsets.
    pub fn get_public_memory_addresses(
        &self,
        bases: &[usize],
    ) -> Result<Vec<(usize, usize)>, MemoryError> {
        let mut addresses = Vec::new();
        for index in 0..self.memory.data.len() {
            let Some(offsets) = self.public_memory_offsets.get(&index) else {
                continue;
            };
            let base = *bases
                .get(index)
                .ok_or(MemoryError::MalformedPublicMemory(index))?;
            addresses.extend(offsets.iter().map(|(off, page)| (base + off, *page)));
        }
        Ok(addresses)
    }

    /// Returns the public-memory offsets finalized for segment `index`.
    pub fn public_memory_offsets(&self, index: usize) -> Option<&[(usize, usize)]> {
        self.public_memory_offsets.get(&index).map(Vec::as_slice)
    }

    /// Counts the memory holes of every real segment not owned by a
    /// builtin.
    ///
    /// A hole is an offset inside a segment's size whose cell was never
    /// accessed. Builtin segments are excluded because their cells are
    /// allocated by ratio, not by access.
    ///
    /// # Returns
    ///
    /// [`MemoryError::MoreAccessedThanSize`] when a segment counts more
    /// accessed cells than its recorded size.
    pub fn memory_holes(&self, builtin_segments: &[usize]) -> Result<usize, MemoryError> {
        let mut holes = 0;
        for index in 0..self.memory.data.len() {
            if builtin_segments.contains(&index) {
                continue;
            }
            let size = self
                .segment_size(index)
                .ok_or(MemoryError::MissingSegmentSizes)?;
            let accessed = self.memory.accessed_count(index).unwrap_or(0);
            if accessed > size {
                return Err(MemoryError::MoreAccessedThanSize {
                    index,
                    accessed,
                    size,
                });
            }
            holes += size - accessed;
        }
        Ok(holes)
    }

    /// Materializes `arg` into memory.
    ///
    /// Sequences are loaded into a fresh segment and replaced by their base
    /// pointer; single values pass through unchanged.
    pub fn gen_arg(&mut self, arg: &Arg) -> Result<Value, MemoryError> {
        match arg {
            Arg::Value(value) => Ok(*value),
            Arg::Values(values) => {
                let base = self.add();
                self.load_data(base, values)?;
                Ok(Value::Pointer(base))
            }
            Arg::Composed(args) => {
                let values = args
                    .iter()
                    .map(|arg| self.gen_arg(arg))
                    .collect::<Result<Vec<_>, _>>()?;
                let base = self.add();
                self.load_data(base, &values)?;
                Ok(Value::Pointer(base))
            }
        }
    }

    /// Writes a flat sequence argument at `ptr`.
    ///
    /// # Returns
    ///
    /// The first address past the written range, or
    /// [`MemoryError::WriteArg`] if `arg` is not a flat sequence.
    pub fn write_arg(&mut self, ptr: Pointer, arg: &Arg) -> Result<Value, MemoryError> {
        match arg {
            Arg::Values(values) => self.load_data(ptr, values).map(Value::Pointer),
            Arg::Value(_) | Arg::Composed(_) => Err(MemoryError::WriteArg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn add_returns_consecutive_bases() {
        let mut segments = SegmentManager::new();
        assert_eq!(segments.add(), Pointer::new(0, 0));
        assert_eq!(segments.add(), Pointer::new(1, 0));
        assert_eq!(segments.add_temp(), Pointer::new(-1, 0));
        assert_eq!(segments.add_temp(), Pointer::new(-2, 0));
        assert_eq!(segments.memory.segment_count(), 2);
        assert_eq!(segments.memory.temp_segment_count(), 2);
    }

    #[test]
    fn load_data_returns_end_pointer() {
        let mut segments = SegmentManager::new();
        let base = segments.add();
        let end = segments
            .load_data(
                base,
                &[Value::from(1u64), Value::from(2u64), Value::from(3u64)],
            )
            .unwrap();
        assert_eq!(end, Pointer::new(0, 3));
        assert_eq!(segments.memory.get(Pointer::new(0, 1)), Some(Value::from(2u64)));
    }

    #[test]
    fn effective_sizes_are_idempotent() {
        let mut segments = SegmentManager::new();
        let base = segments.add();
        segments.add();
        segments
            .load_data(base, &[Value::from(1u64), Value::from(2u64)])
            .unwrap();
        assert_eq!(segments.compute_effective_sizes(), &[2, 0]);
        // Later writes do not change the recorded sizes.
        segments.memory.set(Pointer::new(0, 7), Felt::ONE).unwrap();
        assert_eq!(segments.compute_effective_sizes(), &[2, 0]);
    }

    #[test]
    fn effective_size_covers_highest_offset() {
        let mut segments = SegmentManager::new();
        segments.add();
        segments.memory.set(Pointer::new(0, 5), Felt::ONE).unwrap();
        assert_eq!(segments.compute_effective_sizes(), &[6]);
    }

    #[test]
    fn relocate_segments_requires_sizes() {
        let segments = SegmentManager::new();
        assert_matches!(
            segments.relocate_segments(),
            Err(MemoryError::MissingSegmentSizes)
        );
    }

    #[test]
    fn relocate_segments_accumulates_bases() {
        let mut segments = SegmentManager::new();
        for size in [3usize, 2, 4] {
            let base = segments.add();
            for i in 0..size {
                segments.memory.set(base.add(i).unwrap(), Felt::ONE).unwrap();
            }
        }
        segments.compute_effective_sizes();
        assert_eq!(segments.relocate_segments().unwrap(), vec![1, 4, 6]);
    }

    #[test]
    fn finalized_sizes_override_used_sizes() {
        let mut segments = SegmentManager::new();
        segments.add();
        segments.memory.set(Pointer::new(0, 0), Felt::ONE).unwrap();
        segments.finalize(0, Some(10), None);
        segments.compute_effective_sizes();
        assert_eq!(segments.segment_size(0), Some(10));
        assert_eq!(segments.relocate_segments().unwrap(), vec![1]);
    }

    #[test]
    fn public_memory_addresses() {
        let mut segments = SegmentManager::new();
        for _ in 0..5 {
            segments.add();
        }
        segments.finalize(0, Some(3), Some(vec![(0, 0), (1, 1)]));
        segments.finalize(1, Some(8), Some((0..8).map(|i| (i, 0)).collect()));
        segments.finalize(2, Some(0), None);
        segments.finalize(3, Some(1), None);
        segments.finalize(4, Some(2), Some(vec![(1, 2)]));
        let bases = [1, 4, 12, 12, 13, 15, 20];
        assert_eq!(
            segments.get_public_memory_addresses(&bases).unwrap(),
            vec![
                (1, 0),
                (2, 1),
                (4, 0),
                (5, 0),
                (6, 0),
                (7, 0),
                (8, 0),
                (9, 0),
                (10, 0),
                (11, 0),
                (14, 2),
            ]
        );
    }

    #[test]
    fn public_memory_requires_a_covering_base_table() {
        let mut segments = SegmentManager::new();
        segments.add();
        segments.finalize(0, None, Some(vec![(0, 0)]));
        assert_matches!(
            segments.get_public_memory_addresses(&[]),
            Err(MemoryError::MalformedPublicMemory(0))
        );
    }

    #[test]
    fn memory_holes_balance_accessed_cells() {
        let mut segments = SegmentManager::new();
        let base = segments.add();
        for i in 0..4 {
            segments.memory.set(base.add(i).unwrap(), Felt::ONE).unwrap();
        }
        segments.memory.mark_accessed(Pointer::new(0, 0));
        segments.memory.mark_accessed(Pointer::new(0, 2));
        segments.compute_effective_sizes();
        assert_eq!(segments.memory_holes(&[]).unwrap(), 2);
        // A builtin segment never counts holes.
        assert_eq!(segments.memory_holes(&[0]).unwrap(), 0);
    }

    #[test]
    fn memory_holes_reject_accessed_past_size() {
        let mut segments = SegmentManager::new();
        let base = segments.add();
        for i in 0..4 {
            segments.memory.set(base.add(i).unwrap(), Felt::ONE).unwrap();
            segments.memory.mark_accessed(Pointer::new(0, i));
        }
        segments.compute_effective_sizes();
        segments.finalize(0, Some(2), None);
        assert_matches!(
            segments.memory_holes(&[]),
            Err(MemoryError::MoreAccessedThanSize {
                index: 0,
                accessed: 4,
                size: 2
            })
        );
    }

    #[test]
    fn gen_arg_materializes_nested_sequences() {
        let mut segments = SegmentManager::new();
        let arg = Arg::Composed(vec![
            Arg::Values(vec![Value::from(1u64), Value::from(2u64)]),
            Arg::Values(vec![Value::from(3u64)]),
        ]);
        let base = segments.gen_arg(&arg).unwrap();
        let Value::Pointer(base) = base else {
            panic!("expected a pointer");
        };
        let inner0 = segments.memory.get_pointer(base).unwrap();
        let inner1 = segments.memory.get_pointer(base.add(1).unwrap()).unwrap();
        assert_eq!(segments.memory.get_felt(inner0).unwrap(), Felt::from(1));
        assert_eq!(
            segments.memory.get_felt(inner0.add(1).unwrap()).unwrap(),
            Felt::from(2)
        );
        assert_eq!(segments.memory.get_felt(inner1).unwrap(), Felt::from(3));
    }

    #[test]
    fn write_arg_requires_a_flat_sequence() {
        let mut segments = SegmentManager::new();
        let base = segments.add();
        assert_matches!(
            segments.write_arg(base, &Arg::Value(Value::from(1u64))),
            Err(MemoryError::WriteArg)
        );
        let end = segments
            .write_arg(base, &Arg::Values(vec![Value::from(1u64), Value::from(2u64)]))
            .unwrap();
        assert_eq!(end, Value::Pointer(Pointer::new(0, 2)));
    }
}

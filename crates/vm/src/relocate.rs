//! Defines the flat relocation of the segmented memory.
//!
//! After a run, the 2-D segmented address space is mapped onto a flat 1-D
//! address space: each real segment `i` occupies the contiguous range
//! `[base[i], base[i] + size[i])`, with `base[0] = 1` and address 0
//! reserved. Values are rewritten along the way: a pointer becomes the
//! scalar flat address it denotes.

use std::io::{self, Write};

use starknet_types_core::felt::Felt;

use crate::error::MemoryError;
use crate::memory::{Memory, Value};

/// Rewrites one value to its flat form through the segment base table.
pub(crate) fn relocate_value(value: Value, bases: &[usize]) -> Result<Felt, MemoryError> {
    match value {
        Value::Scalar(felt) => Ok(felt),
        Value::Pointer(p) => {
            if p.segment < 0 {
                // A temporary pointer surviving to this point has no
                // relocation rule and therefore no flat address.
                return Err(MemoryError::UnresolvedTemporarySegment(p.segment));
            }
            let base = bases
                .get(p.segment as usize)
                .ok_or(MemoryError::MalformedPublicMemory(p.segment as usize))?;
            Ok(Felt::from(base + p.offset))
        }
    }
}

/// Produces the flat memory: one optional value per flat address, index 0
/// reserved and always `None`.
///
/// The layout follows the base table exactly; a gap inside a segment stays
/// a gap in the flat array.
pub(crate) fn relocate_memory(
    memory: &Memory,
    bases: &[usize],
) -> Result<Vec<Option<Felt>>, MemoryError> {
    let mut relocated = vec![None];
    for (index, segment) in memory.data.iter().enumerate() {
        let base = *bases
            .get(index)
            .ok_or(MemoryError::MalformedPublicMemory(index))?;
        if relocated.len() != base {
            // Segment sizes and bases must tile the flat space exactly.
            return Err(MemoryError::MissingSegmentSizes);
        }
        for cell in segment.iter() {
            match cell {
                Some(cell) => relocated.push(Some(relocate_value(cell.value(), bases)?)),
                None => relocated.push(None),
            }
        }
        // A finalized size may extend past the highest asserted cell.
        let next = bases.get(index + 1).copied().unwrap_or(relocated.len());
        while relocated.len() < next {
            relocated.push(None);
        }
    }
    Ok(relocated)
}

/// Writes a relocated memory in its binary form: one little-endian
/// `(address, value)` pair per asserted cell, 8 bytes of address and 32
/// bytes of value, in ascending address order. Address 0 is reserved and
/// never written.
pub fn write_memory_file(
    writer: &mut impl Write,
    relocated: &[Option<Felt>],
) -> io::Result<()> {
    for (addr, value) in relocated.iter().enumerate() {
        let Some(value) = value else { continue };
        writer.write_all(&(addr as u64).to_le_bytes())?;
        writer.write_all(&value.to_bytes_le())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Pointer, SegmentManager};
    use assert_matches::assert_matches;

    #[test]
    fn pointers_become_flat_addresses() {
        let bases = [1, 4, 6];
        assert_eq!(
            relocate_value(Value::Pointer(Pointer::new(2, 3)), &bases).unwrap(),
            Felt::from(9)
        );
        assert_eq!(
            relocate_value(Value::Scalar(Felt::from(7)), &bases).unwrap(),
            Felt::from(7)
        );
    }

    #[test]
    fn unresolved_temporary_pointers_are_rejected() {
        assert_matches!(
            relocate_value(Value::Pointer(Pointer::new(-1, 0)), &[1]),
            Err(MemoryError::UnresolvedTemporarySegment(-1))
        );
    }

    #[test]
    fn flat_memory_tiles_the_segments() {
        let mut segments = SegmentManager::new();
        for size in [3usize, 2, 4] {
            let base = segments.add();
            for i in 0..size {
                if (base.segment, i) == (1, 1) {
                    continue;
                }
                segments
                    .memory
                    .set(base.add(i).unwrap(), Felt::from(i))
                    .unwrap();
            }
        }
        // Segment sizes [3, 2, 4] produce bases [1, 4, 6].
        segments
            .memory
            .set(Pointer::new(1, 1), Pointer::new(2, 3))
            .unwrap();
        segments.compute_effective_sizes();
        let bases = segments.relocate_segments().unwrap();
        assert_eq!(bases, vec![1, 4, 6]);
        let flat = relocate_memory(&segments.memory, &bases).unwrap();
        assert_eq!(flat.len(), 10);
        assert_eq!(flat[0], None);
        assert_eq!(flat[1], Some(Felt::from(0)));
        assert_eq!(flat[4], Some(Felt::from(0)));
        // The pointer (2, 3) stored at (1, 1) lands at flat address 5 and
        // reads as flat address 9.
        assert_eq!(flat[5], Some(Felt::from(9)));
        assert_eq!(flat[6], Some(Felt::from(0)));
        assert_eq!(flat[9], Some(Felt::from(3)));
    }

    #[test]
    fn binary_encoding_skips_gaps() {
        let relocated = vec![None, Some(Felt::from(5)), None, Some(Felt::from(9))];
        let mut buffer = Vec::new();
        write_memory_file(&mut buffer, &relocated).unwrap();
        assert_eq!(buffer.len(), 2 * 40);
        assert_eq!(&buffer[0..8], &1u64.to_le_bytes());
        assert_eq!(&buffer[8..40], &Felt::from(5).to_bytes_le());
        assert_eq!(&buffer[40..48], &3u64.to_le_bytes());
    }
}

//! Defines the execution trace types and their binary encoding.
//!
//! While the machine runs, each step appends one [`TraceEntry`] holding the
//! three registers as pointers. At the end of the run the trace is
//! *relocated*: every register becomes a flat address through the segment
//! base table, producing [`RelocatedTraceEntry`] values suitable for the
//! prover.

use std::io::{self, Write};

use crate::error::TraceError;
use crate::memory::Pointer;

/// One entry of the execution trace: the register values before an
/// instruction was executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceEntry {
    /// The program counter.
    pub pc: Pointer,
    /// The allocation pointer.
    pub ap: Pointer,
    /// The frame pointer.
    pub fp: Pointer,
}

/// One entry of the execution trace after relocation to flat addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocatedTraceEntry {
    /// The program counter.
    pub pc: u64,
    /// The allocation pointer.
    pub ap: u64,
    /// The frame pointer.
    pub fp: u64,
}

/// Relocates one trace register through the segment base table.
pub(crate) fn relocate_trace_register(
    register: Pointer,
    bases: &[usize],
) -> Result<u64, TraceError> {
    if register.segment < 0 {
        return Err(TraceError::NoRelocationFound(register.segment));
    }
    let segment = register.segment as usize;
    let base = bases
        .get(segment)
        .ok_or(TraceError::NoRelocationFound(register.segment))?;
    Ok((base + register.offset) as u64)
}

/// Relocates a whole trace through the segment base table.
pub(crate) fn relocate_trace(
    trace: &[TraceEntry],
    bases: &[usize],
) -> Result<Vec<RelocatedTraceEntry>, TraceError> {
    trace
        .iter()
        .map(|entry| {
            Ok(RelocatedTraceEntry {
                pc: relocate_trace_register(entry.pc, bases)?,
                ap: relocate_trace_register(entry.ap, bases)?,
                fp: relocate_trace_register(entry.fp, bases)?,
            })
        })
        .collect()
}

/// Writes a relocated trace in its binary form: one little-endian
/// `(ap, fp, pc)` triple of 8-byte words per step, in step order.
pub fn write_trace_file(
    writer: &mut impl Write,
    trace: &[RelocatedTraceEntry],
) -> io::Result<()> {
    for entry in trace {
        writer.write_all(&entry.ap.to_le_bytes())?;
        writer.write_all(&entry.fp.to_le_bytes())?;
        writer.write_all(&entry.pc.to_le_bytes())?;
    }
    Ok(())
}

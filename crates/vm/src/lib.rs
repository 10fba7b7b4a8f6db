//! # Groudon
//!
//! A Cairo virtual machine with builtin, hint and relocation support.
//!
//! # Documentation
//!
//! - [The Cairo Whitepaper](https://www.cairo-lang.org/cairo-whitepaper/).
//!
//! # Field
//!
//! Technically, the Cairo language allows any prime field to be used as the
//! underlying field for the virtual machine. However, in practice, the only
//! field this crate is meant to be used with is the Starknet field element
//! [`Felt`]. For this reason, it is not possible to change the underlying
//! field of the virtual machine.
//!
//! # Components
//!
//! The [`CairoVM`] is composed of three main components:
//!
//! - [`Cpu`]: the register file of the machine, holding the program
//!   counter, allocation pointer and frame pointer.
//!
//! - [`SegmentManager`]: the segmented, write-once memory of the machine
//!   and its bookkeeping. Instructions and working memory are stored here.
//!
//! - [`Builtin`]s: specialized memory segments whose cells are deduced
//!   from their peers under arithmetic or cryptographic constraints.
//!
//! Driving a whole program — loading it, choosing a run mode, relocating
//! the result — is the business of [`runner::Runner`].

#![warn(missing_docs, missing_debug_implementations)]
#![deny(unsafe_code)]

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use bitflags::bitflags;
use num_traits::ToPrimitive;
use starknet_types_core::felt::Felt;

use builtin::{Builtin, BuiltinName, Signature};
use cpu::Cpu;
use error::VmError;
use hint::{ExecutionScopes, HintProcessor};
use instr::{ApUpdate, FpUpdate, Instruction, OpCode, PcUpdate, ResultLogic};
use memory::{Pointer, SegmentManager, Value};
use trace::TraceEntry;

pub mod builtin;
pub mod cpu;
pub mod error;
pub mod hint;
pub mod instr;
pub mod memory;
pub mod program;
pub mod relocate;
pub mod runner;
pub mod trace;

bitflags! {
    /// Records which operands of an instruction were produced by deduction
    /// rather than read from memory.
    ///
    /// Deduced operands are the only ones written back to memory at the
    /// end of operand computation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct OperandFlags: u8 {
        /// The destination was deduced from the other operands.
        const DST_DEDUCED = 1 << 0;
        /// The first operand was deduced from the other operands or a
        /// builtin.
        const OP0_DEDUCED = 1 << 1;
        /// The second operand was deduced from the other operands or a
        /// builtin.
        const OP1_DEDUCED = 1 << 2;
    }
}

/// The four operands of an instruction, once known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operands {
    /// The destination operand.
    pub dst: Value,
    /// The result of the instruction, when its logic constrains one.
    pub res: Option<Value>,
    /// The first operand.
    pub op0: Value,
    /// The second operand.
    pub op1: Value,
}

/// The effective addresses the operands were read from or deduced at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OperandAddrs {
    dst: Pointer,
    op0: Pointer,
    op1: Pointer,
}

/// Contains the full state of a Cairo virtual machine.
///
/// This includes memory, registers, builtins, the execution trace and the
/// step counter. It executes one instruction at a time through
/// [`CairoVM::step`]; everything around the step loop — program loading,
/// run modes, relocation — lives in [`runner::Runner`].
pub struct CairoVM {
    /// The register file of the machine.
    pub(crate) cpu: Cpu,
    /// The segmented memory of the machine and its bookkeeping.
    ///
    /// Hints are allowed to allocate segments and assert cells through
    /// this field; registers are off limits to them.
    pub segments: SegmentManager,
    /// The builtins of the current run, in program order.
    pub(crate) builtins: Vec<Box<dyn Builtin>>,
    /// The execution trace, when tracing is enabled.
    pub(crate) trace: Option<Vec<TraceEntry>>,
    /// The number of steps executed so far.
    pub(crate) current_step: usize,
    /// The smallest and largest raw instruction offsets seen so far.
    rc_limits: Option<(u16, u16)>,
}

impl CairoVM {
    /// Creates a new [`CairoVM`] with an empty memory and zeroed
    /// registers.
    pub fn new(trace_enabled: bool) -> Self {
        Self {
            cpu: Cpu::new(
                Pointer::new(0, 0),
                Pointer::new(0, 0),
                Pointer::new(0, 0),
            ),
            segments: SegmentManager::new(),
            builtins: Vec::new(),
            trace: trace_enabled.then(Vec::new),
            current_step: 0,
            rc_limits: None,
        }
    }

    /// Returns the current state of the [`Cpu`].
    #[inline(always)]
    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    /// Returns the builtins of the current run, in program order.
    #[inline(always)]
    pub fn builtins(&self) -> &[Box<dyn Builtin>] {
        &self.builtins
    }

    /// Returns the number of steps executed so far.
    #[inline(always)]
    pub fn current_step(&self) -> usize {
        self.current_step
    }

    /// Returns the execution trace recorded so far.
    ///
    /// `None` when tracing was disabled at construction.
    pub fn trace(&self) -> Option<&[TraceEntry]> {
        self.trace.as_deref()
    }

    /// Returns the smallest and largest raw instruction offsets decoded so
    /// far, for the range-check unit budget.
    pub fn rc_limits(&self) -> Option<(u16, u16)> {
        self.rc_limits
    }

    /// Returns the signature builtin of the current run, if any, so hints
    /// can feed it signatures.
    pub fn signature_builtin_mut(&mut self) -> Option<&mut Signature> {
        self.builtins
            .iter_mut()
            .find(|b| b.name() == BuiltinName::Ecdsa)?
            .as_any_mut()
            .downcast_mut()
    }

    /// Fetches and decodes the instruction word at the program counter.
    fn fetch_instruction(&self) -> Result<Instruction, VmError> {
        let word = match self.segments.memory.get(self.cpu.pc) {
            Some(Value::Scalar(word)) => word,
            Some(Value::Pointer(_)) | None => {
                return Err(VmError::InstructionFetch(self.cpu.pc));
            }
        };
        let encoded = word
            .to_u64()
            .ok_or_else(|| VmError::InstructionTooLarge(Box::new(word)))?;
        Instruction::new(encoded)
    }

    /// Attempts to deduce the value of the memory cell at `addr` using the
    /// builtin owning its segment.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(_))` if a builtin owns the segment and could deduce the
    ///   cell from its peers.
    ///
    /// - `Ok(None)` if no builtin owns the segment, or the builtin had
    ///   nothing to say.
    ///
    /// - `Err(_)` if the owning builtin rejected its input cells.
    fn deduce_builtin_cell(&self, addr: Pointer) -> Result<Option<Value>, VmError> {
        if addr.segment < 0 {
            return Ok(None);
        }
        for builtin in &self.builtins {
            if builtin.base() == Some(addr.segment as usize) {
                return Ok(builtin.deduce(addr, &self.segments.memory)?);
            }
        }
        Ok(None)
    }

    /// Populates the four operands of `instruction` from memory and from
    /// deduction.
    ///
    /// The order is fixed: the destination and first operand are read
    /// first; a missing first operand goes through builtin deduction and
    /// then arithmetic deduction; the second operand (whose address may
    /// depend on the first) follows with arithmetic deduction first and
    /// builtin deduction second; the result and destination close the
    /// chain. Deduced operands are recorded in the returned flags and only
    /// written back by the caller.
    fn compute_operands(
        &mut self,
        instruction: &Instruction,
    ) -> Result<(Operands, OperandAddrs, OperandFlags), VmError> {
        let memory = &self.segments.memory;
        let mut flags = OperandFlags::empty();
        let mut res: Option<Value> = None;

        let dst_addr = self.cpu.dst_addr(instruction)?;
        let mut dst = memory.get(dst_addr);
        let op0_addr = self.cpu.op0_addr(instruction)?;
        let mut op0 = memory.get(op0_addr);

        if op0.is_none() {
            op0 = self.deduce_builtin_cell(op0_addr)?;
            if op0.is_some() {
                flags |= OperandFlags::OP0_DEDUCED;
            }
        }
        if op0.is_none() {
            // The op1 cell can only help here when its address does not
            // itself depend on op0.
            let op1_hint = self
                .cpu
                .op1_addr(instruction, None)
                .ok()
                .and_then(|addr| self.segments.memory.get(addr));
            let (deduced, deduced_res) =
                deduce_op0(instruction, &self.cpu, dst.as_ref(), op1_hint.as_ref())?;
            if deduced.is_some() {
                flags |= OperandFlags::OP0_DEDUCED;
                op0 = deduced;
            }
            res = deduced_res;
        }
        let op0 = op0.ok_or(VmError::FailedToComputeOp0(op0_addr))?;

        let op1_addr = self.cpu.op1_addr(instruction, Some(&op0))?;
        let mut op1 = self.segments.memory.get(op1_addr);
        if op1.is_none() {
            let (deduced, deduced_res) = deduce_op1(instruction, dst.as_ref(), &op0)?;
            if deduced.is_some() {
                flags |= OperandFlags::OP1_DEDUCED;
                op1 = deduced;
            }
            if res.is_none() {
                res = deduced_res;
            }
        }
        if op1.is_none() {
            op1 = self.deduce_builtin_cell(op1_addr)?;
            if op1.is_some() {
                flags |= OperandFlags::OP1_DEDUCED;
            }
        }
        let op1 = op1.ok_or(VmError::FailedToComputeOp1(op1_addr))?;

        if res.is_none() {
            res = compute_res(instruction, &op0, &op1)?;
        }

        let dst = match dst.take() {
            Some(dst) => dst,
            None => {
                let deduced = match instruction.op_code()? {
                    OpCode::AssertEq => res.ok_or(VmError::UnconstrainedResAssertEq)?,
                    OpCode::Call => Value::Pointer(self.cpu.fp),
                    _ => return Err(VmError::NoDst(dst_addr)),
                };
                flags |= OperandFlags::DST_DEDUCED;
                deduced
            }
        };

        Ok((
            Operands { dst, res, op0, op1 },
            OperandAddrs {
                dst: dst_addr,
                op0: op0_addr,
                op1: op1_addr,
            },
            flags,
        ))
    }

    /// Writes the operands produced by deduction back to their addresses.
    ///
    /// Writing happens after both operands and the result are known, so
    /// that a disagreement between arithmetic deduction and an existing
    /// cell surfaces as a memory inconsistency instead of a silent
    /// overwrite.
    fn insert_deduced_operands(
        &mut self,
        flags: OperandFlags,
        operands: &Operands,
        addrs: &OperandAddrs,
    ) -> Result<(), VmError> {
        if flags.contains(OperandFlags::OP0_DEDUCED) {
            self.segments.memory.set(addrs.op0, operands.op0)?;
        }
        if flags.contains(OperandFlags::OP1_DEDUCED) {
            self.segments.memory.set(addrs.op1, operands.op1)?;
        }
        if flags.contains(OperandFlags::DST_DEDUCED) {
            self.segments.memory.set(addrs.dst, operands.dst)?;
        }
        Ok(())
    }

    /// Enforces the invariants the OP code imposes on the operands.
    fn opcode_assertions(
        &self,
        instruction: &Instruction,
        operands: &Operands,
    ) -> Result<(), VmError> {
        match instruction.op_code()? {
            OpCode::AssertEq => match &operands.res {
                Some(res) if *res == operands.dst => Ok(()),
                Some(res) => Err(VmError::DiffAssertValues {
                    dst: Box::new(operands.dst),
                    res: Box::new(*res),
                }),
                None => Err(VmError::UnconstrainedResAssertEq),
            },
            OpCode::Call => {
                let ret_pc = Value::Pointer(self.cpu.pc.add(instruction.size())?);
                if operands.op0 != ret_pc {
                    return Err(VmError::CantWriteReturnPc {
                        op0: Box::new(operands.op0),
                        ret_pc: Box::new(ret_pc),
                    });
                }
                let ret_fp = Value::Pointer(self.cpu.fp);
                if operands.dst != ret_fp {
                    return Err(VmError::CantWriteReturnFp {
                        dst: Box::new(operands.dst),
                        fp: Box::new(ret_fp),
                    });
                }
                Ok(())
            }
            OpCode::Ret | OpCode::NOp => Ok(()),
        }
    }

    /// Applies the register update rules of `instruction`.
    fn update_registers(
        &mut self,
        instruction: &Instruction,
        operands: &Operands,
    ) -> Result<(), VmError> {
        let ap_update = instruction.ap_update()?;
        if instruction.op_code()? == OpCode::Call && ap_update != ApUpdate::Add2 {
            return Err(VmError::CallApUpdate);
        }

        let new_fp = match instruction.fp_update()? {
            FpUpdate::Regular => self.cpu.fp,
            FpUpdate::ApPlus2 => self.cpu.ap.add(2)?,
            FpUpdate::Dst => match &operands.dst {
                Value::Pointer(dst) => *dst,
                Value::Scalar(dst) => self.cpu.fp.add_felt(dst)?,
            },
        };

        let new_ap = match ap_update {
            ApUpdate::Regular => self.cpu.ap,
            ApUpdate::Add => match &operands.res {
                Some(Value::Scalar(res)) => self.cpu.ap.add_felt(res)?,
                Some(Value::Pointer(res)) => {
                    return Err(error::MathError::PointerAdd(self.cpu.ap, *res).into());
                }
                None => return Err(VmError::ApUpdateAddUnconstrained),
            },
            ApUpdate::Add1 => self.cpu.ap.add(1)?,
            ApUpdate::Add2 => self.cpu.ap.add(2)?,
        };

        let new_pc = match instruction.pc_update()? {
            PcUpdate::Regular => self.cpu.pc.add(instruction.size())?,
            PcUpdate::Jump => match &operands.res {
                Some(Value::Pointer(res)) => *res,
                Some(Value::Scalar(_)) => return Err(VmError::JumpResNotPointer),
                None => return Err(VmError::JumpResUnconstrained),
            },
            PcUpdate::JumpRel => match &operands.res {
                Some(Value::Scalar(res)) => self.cpu.pc.add_felt(res)?,
                Some(Value::Pointer(_)) => return Err(VmError::JumpRelResNotScalar),
                None => return Err(VmError::JumpResUnconstrained),
            },
            PcUpdate::Jnz => {
                if operands.dst.is_zero() {
                    self.cpu.pc.add(instruction.size())?
                } else {
                    match &operands.op1 {
                        Value::Scalar(op1) => self.cpu.pc.add_felt(op1)?,
                        Value::Pointer(_) => return Err(VmError::JnzOffsetNotScalar),
                    }
                }
            }
        };

        self.cpu.fp = new_fp;
        self.cpu.ap = new_ap;
        self.cpu.pc = new_pc;
        Ok(())
    }

    /// Widens the recorded raw-offset range with the offsets of
    /// `instruction`.
    fn update_rc_limits(&mut self, instruction: &Instruction) {
        let offsets = [
            (instruction.dst_offset() as i32 + 0x8000) as u16,
            (instruction.op0_offset() as i32 + 0x8000) as u16,
            (instruction.op1_offset() as i32 + 0x8000) as u16,
        ];
        let (mut min, mut max) = self.rc_limits.unwrap_or((u16::MAX, u16::MIN));
        for offset in offsets {
            min = min.min(offset);
            max = max.max(offset);
        }
        self.rc_limits = Some((min, max));
    }

    /// Executes the hints attached to the current program counter.
    ///
    /// Hint errors propagate and abort the run.
    pub fn step_hint(
        &mut self,
        hint_processor: &mut dyn HintProcessor,
        exec_scopes: &mut ExecutionScopes,
        hint_datas: &[Box<dyn Any>],
        constants: &HashMap<String, Felt>,
    ) -> Result<(), VmError> {
        for hint_data in hint_datas {
            hint_processor
                .execute_hint(self, exec_scopes, hint_data.as_ref(), constants)
                .map_err(VmError::Hint)?;
        }
        Ok(())
    }

    /// Executes the instruction at the current program counter.
    pub fn step_instruction(&mut self) -> Result<(), VmError> {
        let instruction = self.fetch_instruction()?;
        tracing::trace!(pc = %self.cpu.pc, step = self.current_step, "executing instruction");

        let (operands, addrs, flags) = self.compute_operands(&instruction)?;
        self.opcode_assertions(&instruction, &operands)?;

        if let Some(trace) = &mut self.trace {
            trace.push(TraceEntry {
                pc: self.cpu.pc,
                ap: self.cpu.ap,
                fp: self.cpu.fp,
            });
        }

        self.insert_deduced_operands(flags, &operands, &addrs)?;
        for addr in [addrs.dst, addrs.op0, addrs.op1] {
            self.segments.memory.mark_accessed(addr);
        }
        for i in 0..instruction.size() {
            let addr = self.cpu.pc.add(i)?;
            self.segments.memory.mark_accessed(addr);
        }

        self.update_rc_limits(&instruction);
        self.update_registers(&instruction, &operands)?;
        self.current_step += 1;
        Ok(())
    }

    /// Advances the virtual machine by a single step: the hints attached
    /// to the current program counter first, then the instruction it
    /// points to.
    pub fn step(
        &mut self,
        hint_processor: &mut dyn HintProcessor,
        exec_scopes: &mut ExecutionScopes,
        hint_datas: &[Box<dyn Any>],
        constants: &HashMap<String, Felt>,
    ) -> Result<(), VmError> {
        self.step_hint(hint_processor, exec_scopes, hint_datas, constants)?;
        self.step_instruction()
    }

    /// Checks every asserted cell of every builtin segment against the
    /// value its builtin deduces from the peers.
    ///
    /// # Returns
    ///
    /// [`VmError::InconsistentAutoDeduction`] on the first disagreeing
    /// cell.
    pub fn verify_auto_deductions(&self) -> Result<(), VmError> {
        for builtin in &self.builtins {
            let Some(base) = builtin.base() else { continue };
            let Some(segment) = self.segments.memory.segment(base as isize) else {
                continue;
            };
            for (offset, cell) in segment.iter().enumerate() {
                let Some(cell) = cell else { continue };
                let addr = Pointer::new(base as isize, offset);
                let Some(deduced) = builtin.deduce(addr, &self.segments.memory)? else {
                    continue;
                };
                if deduced != cell.value() {
                    return Err(VmError::InconsistentAutoDeduction {
                        at: addr,
                        stored: Box::new(cell.value()),
                        deduced: Box::new(deduced),
                    });
                }
            }
        }
        Ok(())
    }

    /// Marks the `len` cells starting at `addr` as accessed.
    ///
    /// Exposed for hints that consume memory without going through
    /// instruction operands.
    pub fn mark_range_accessed(&mut self, addr: Pointer, len: usize) -> Result<(), VmError> {
        for i in 0..len {
            let addr = addr.add(i)?;
            self.segments.memory.mark_accessed(addr);
        }
        Ok(())
    }
}

impl fmt::Debug for CairoVM {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CairoVM")
            .field("cpu", &self.cpu)
            .field("segments", &self.segments)
            .field("builtins", &self.builtins.len())
            .field("current_step", &self.current_step)
            .finish_non_exhaustive()
    }
}

/// Attempts to deduce the first operand from the OP code, the destination
/// and the second operand.
///
/// A `Call` instruction pins `op0` to the return program counter. An
/// `AssertEq` instruction inverts its result logic when the other two
/// values are known; a division by zero simply deduces nothing.
fn deduce_op0(
    instruction: &Instruction,
    cpu: &Cpu,
    dst: Option<&Value>,
    op1: Option<&Value>,
) -> Result<(Option<Value>, Option<Value>), VmError> {
    match instruction.op_code()? {
        OpCode::Call => {
            let ret_pc = cpu.pc.add(instruction.size())?;
            Ok((Some(Value::Pointer(ret_pc)), None))
        }
        OpCode::AssertEq => {
            let (Some(dst), Some(op1)) = (dst, op1) else {
                return Ok((None, None));
            };
            match instruction.result_logic()? {
                //     dst = op0 + op1
                // =>  op0 = dst - op1
                ResultLogic::Add => Ok((dst.subtract(op1).ok(), Some(*dst))),
                //     dst = op0 * op1
                // =>  op0 = dst / op1
                ResultLogic::Mul => match dst.divide(op1) {
                    Ok(op0) => Ok((Some(op0), Some(*dst))),
                    Err(_) => Ok((None, None)),
                },
                ResultLogic::Op1 | ResultLogic::Unconstrained => Ok((None, None)),
            }
        }
        _ => Ok((None, None)),
    }
}

/// Attempts to deduce the second operand from the OP code, the destination
/// and the first operand.
fn deduce_op1(
    instruction: &Instruction,
    dst: Option<&Value>,
    op0: &Value,
) -> Result<(Option<Value>, Option<Value>), VmError> {
    if instruction.op_code()? != OpCode::AssertEq {
        return Ok((None, None));
    }
    let Some(dst) = dst else {
        return Ok((None, None));
    };
    match instruction.result_logic()? {
        //    dst = op1
        ResultLogic::Op1 => Ok((Some(*dst), Some(*dst))),
        //     dst = op0 + op1
        // =>  op1 = dst - op0
        ResultLogic::Add => Ok((dst.subtract(op0).ok(), Some(*dst))),
        //     dst = op0 * op1
        // =>  op1 = dst / op0
        ResultLogic::Mul => match dst.divide(op0) {
            Ok(op1) => Ok((Some(op1), Some(*dst))),
            Err(_) => Ok((None, None)),
        },
        ResultLogic::Unconstrained => Ok((None, None)),
    }
}

/// Computes the result of an instruction from its two operands.
fn compute_res(
    instruction: &Instruction,
    op0: &Value,
    op1: &Value,
) -> Result<Option<Value>, VmError> {
    match instruction.result_logic()? {
        ResultLogic::Op1 => Ok(Some(*op1)),
        ResultLogic::Add => Ok(Some(op0.add(op1)?)),
        ResultLogic::Mul => Ok(Some(op0.multiply(op1)?)),
        ResultLogic::Unconstrained => Ok(None),
    }
}

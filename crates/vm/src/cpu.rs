//! Defines the [`Cpu`] type, responsible for describing the state of the
//! CPU.
//!
//! More information in the documentation for [`Cpu`].

use crate::error::VmError;
use crate::instr::{DstRegister, Instruction, Op0Register, Op1Source};
use crate::memory::{Pointer, Value};

/// The Central Processing Unit (CPU) responsible for executing Cairo
/// bytecode instructions.
///
/// By itself, a [`Cpu`] is not enough to execute a Cairo program. In order
/// to do anything useful, it has to be connected to a
/// [`Memory`](crate::memory::Memory).
#[derive(Debug, Clone)]
pub struct Cpu {
    /// The Program Counter of the CPU, pointing to the next instruction to
    /// be fetched from working memory.
    ///
    /// It is possible to change the segment in which **PC** points to using
    /// an absolute jump, preventing us from assuming that **PC** is always
    /// part of the same segment.
    pub pc: Pointer,
    /// The Allocation Pointer, incremented by most instructions that need
    /// to write to working memory.
    ///
    /// It is not possible to modify the segment in which **AP** points to,
    /// enabling us to assume that **AP** stays in the execution segment for
    /// the whole run.
    pub ap: Pointer,
    /// The Frame Pointer, pointing to the base of the current frame.
    ///
    /// Just like the Allocation Pointer, the Frame Pointer cannot change
    /// segments.
    pub fp: Pointer,
}

impl Cpu {
    /// Creates a new [`Cpu`] with the provided initial registers.
    #[inline(always)]
    pub const fn new(pc: Pointer, ap: Pointer, fp: Pointer) -> Self {
        Self { pc, ap, fp }
    }

    /// Computes the address of the destination operand of `instruction`.
    pub fn dst_addr(&self, instruction: &Instruction) -> Result<Pointer, VmError> {
        let base = match instruction.dst_register() {
            DstRegister::AP => self.ap,
            DstRegister::FP => self.fp,
        };
        Ok(base.add_signed(instruction.dst_offset() as isize)?)
    }

    /// Computes the address of the first operand of `instruction`.
    pub fn op0_addr(&self, instruction: &Instruction) -> Result<Pointer, VmError> {
        let base = match instruction.op0_register() {
            Op0Register::AP => self.ap,
            Op0Register::FP => self.fp,
        };
        Ok(base.add_signed(instruction.op0_offset() as isize)?)
    }

    /// Computes the address of the second operand of `instruction`.
    ///
    /// The second operand may be based on the first one, in which case the
    /// already-fetched `op0` must be provided and must be a pointer. An
    /// immediate operand always sits right after the instruction word, so
    /// its offset must be `1`.
    pub fn op1_addr(
        &self,
        instruction: &Instruction,
        op0: Option<&Value>,
    ) -> Result<Pointer, VmError> {
        let offset = instruction.op1_offset() as isize;
        let base = match instruction.op1_source()? {
            Op1Source::AP => self.ap,
            Op1Source::FP => self.fp,
            Op1Source::Imm => {
                if offset != 1 {
                    return Err(VmError::ImmediateOffset(instruction.op1_offset()));
                }
                self.pc
            }
            Op1Source::Op0 => match op0 {
                Some(Value::Pointer(p)) => *p,
                Some(Value::Scalar(_)) | None => {
                    return Err(VmError::FailedToComputeOp1(self.ap));
                }
            },
        };
        Ok(base.add_signed(offset)?)
    }
}

//! Defines the error types of the crate.
//!
//! Errors are split by subsystem: [`MathError`] for value arithmetic,
//! [`MemoryError`] for the segmented memory, [`BuiltinError`] for builtin
//! deductions, [`VmError`] for the fetch-decode-execute cycle,
//! [`TraceError`] for trace relocation and [`RunnerError`] for run
//! initialization and finalization. Every error aborts the current run; the
//! only condition recovered from internally is a missing memory cell during
//! operand computation, which is retried through deduction before becoming
//! a [`VmError`].

use starknet_types_core::felt::Felt;
use thiserror::Error;

use crate::memory::{Pointer, Value};

/// An error that may occur when performing arithmetic on [`Value`]s and
/// [`Pointer`]s.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MathError {
    /// Attempted to add two pointers together.
    #[error("cannot add two pointers: {0} + {1}")]
    PointerAdd(Pointer, Pointer),
    /// Attempted to multiply a pointer.
    #[error("cannot multiply pointer {0}")]
    PointerMul(Pointer),
    /// Attempted to subtract a pointer from a scalar.
    #[error("cannot subtract pointer {0} from a scalar")]
    PointerSubFromScalar(Pointer),
    /// A scalar was too large to be used as a pointer offset.
    #[error("value {0} is too large for a pointer offset")]
    ValueTooLarge(Box<Felt>),
    /// A pointer offset computation went out of the representable range.
    #[error("offset arithmetic on {0} overflowed with operand {1}")]
    OffsetOverflow(Pointer, isize),
    /// Subtraction of two pointers that do not share a segment.
    #[error("cannot subtract pointers of different segments: {0} - {1}")]
    SegmentMismatch(Pointer, Pointer),
    /// Subtraction of a larger offset from a smaller one.
    #[error("offset subtraction underflowed: {0} - {1}")]
    OffsetUnderflow(Pointer, usize),
    /// Attempted to divide by zero.
    #[error("division by zero")]
    DivideByZero,
    /// An exact division left a remainder.
    #[error("{0} is not divisible by {1}")]
    NotDivisible(usize, usize),
}

/// An error that may occur while reading from or asserting the segmented
/// memory.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// The value of a memory cell contradicted a previous assertion on that
    /// same cell.
    #[error("inconsistent write at {at}: cell holds {existing}, attempted {attempted}")]
    Inconsistent {
        /// The address of the contradicted cell.
        at: Pointer,
        /// The value the cell was previously asserted to.
        existing: Box<Value>,
        /// The value the write attempted to assert.
        attempted: Box<Value>,
    },
    /// An access referenced a segment that was never allocated.
    #[error("segment {index} has not been allocated ({len} segments exist)")]
    UnallocatedSegment {
        /// The segment index of the faulty access.
        index: isize,
        /// The number of segments currently allocated on that side.
        len: usize,
    },
    /// A cell expected to hold a scalar held a pointer.
    #[error("expected a scalar at {0}")]
    ExpectedScalar(Pointer),
    /// A cell expected to hold a pointer held a scalar.
    #[error("expected a pointer at {0}")]
    ExpectedPointer(Pointer),
    /// A cell required by the operation was never asserted.
    #[error("unknown memory cell at {0}")]
    UnknownCell(Pointer),
    /// A range read went through a gap in the segment.
    #[error("missing cell in range of {len} starting at {at}")]
    RangeGap {
        /// The base address of the range.
        at: Pointer,
        /// The length of the range.
        len: usize,
    },
    /// A relocation rule source was not a temporary segment.
    #[error("relocation source segment {0} is not temporary")]
    AddressNotTemporary(isize),
    /// A relocation rule source had a non-zero offset.
    #[error("relocation source offset {0} is not zero")]
    NonZeroOffset(usize),
    /// Two relocation rules were registered for the same temporary segment.
    #[error("temporary segment {0} already has a relocation rule")]
    DuplicatedRelocation(isize),
    /// A temporary pointer reached flat relocation without a relocation
    /// rule.
    #[error("temporary segment {0} has no relocation rule")]
    UnresolvedTemporarySegment(isize),
    /// A segment counted more accessed cells than its size.
    #[error("segment {index} has {accessed} accessed cells but size {size}")]
    MoreAccessedThanSize {
        /// The segment index.
        index: usize,
        /// The number of accessed cells in the segment.
        accessed: usize,
        /// The size of the segment.
        size: usize,
    },
    /// Effective segment sizes were required but never computed.
    #[error("effective segment sizes have not been computed")]
    MissingSegmentSizes,
    /// The public memory references a segment outside the base table.
    #[error("public memory references segment {0} outside the relocation table")]
    MalformedPublicMemory(usize),
    /// `write_arg` was given an argument that is not a flat sequence.
    #[error("write_arg expects a flat sequence of values")]
    WriteArg,
    /// The flat memory was already produced.
    #[error("memory has already been relocated")]
    AlreadyRelocated,
    /// A range-check cell was asserted to an out-of-range value.
    #[error("range check: {0} is not in [0, 2^128)")]
    RangeCheckOutOfBounds(Box<Felt>),
    /// A range-check cell was asserted to a pointer.
    #[error("range check: cell at {0} holds a pointer")]
    RangeCheckFoundPointer(Pointer),
    /// No signature was registered for a signature-builtin instance.
    #[error("no signature registered for public key cell {0}")]
    SignatureNotFound(Pointer),
    /// A registered signature did not verify against its message.
    #[error("signature verification failed for public key {pub_key}")]
    InvalidSignature {
        /// The public key of the failing instance.
        pub_key: Box<Felt>,
        /// The signed message of the failing instance.
        msg: Box<Felt>,
    },
    /// A signature-builtin cell held a pointer instead of a scalar.
    #[error("signature builtin: cell at {0} holds a pointer")]
    SignatureFoundPointer(Pointer),
    /// A segment-arena info triple was structurally invalid.
    #[error("segment arena: inconsistent info triple at {0}")]
    InvalidSegmentArena(Pointer),
    /// A builtin ran out of allocated cells for the current step count.
    #[error("insufficient allocated cells for {0}")]
    InsufficientAllocatedCells(InsufficientAllocatedCellsKind),
    /// Offset arithmetic failed while walking memory.
    #[error(transparent)]
    Math(#[from] MathError),
}

/// The budget that ran out in a
/// [`MemoryError::InsufficientAllocatedCells`] failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsufficientAllocatedCellsKind {
    /// The permanent range-check unit budget.
    RangeCheck,
    /// The memory-unit budget consumed by holes.
    MemoryHoles,
    /// The diluted-check pool.
    DilutedCheck,
}

impl std::fmt::Display for InsufficientAllocatedCellsKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RangeCheck => f.write_str("range check units"),
            Self::MemoryHoles => f.write_str("memory holes"),
            Self::DilutedCheck => f.write_str("diluted check units"),
        }
    }
}

/// An error produced by a builtin while deducing a memory cell.
#[derive(Debug, Error)]
pub enum BuiltinError {
    /// A bitwise input did not fit in the builtin's bit width.
    #[error("bitwise input {0} exceeds {1} bits")]
    BitwiseOutsideBounds(Box<Felt>, u32),
    /// A Keccak input cell did not fit in a 200-bit word.
    #[error("keccak input {0} exceeds 200 bits")]
    KeccakOutsideBounds(Box<Felt>),
    /// An EC-op input point was not on the STARK curve.
    #[error("ec op: point ({}, {}) is not on the curve", .0.0, .0.1)]
    PointNotOnCurve(Box<(Felt, Felt)>),
    /// The EC-op doubling chain met the partial sum.
    #[error("ec op: the doubling chain for scalar {0} met the partial sum")]
    EcOpSameXCoordinate(Box<Felt>),
    /// A builtin input cell held a pointer instead of a scalar.
    #[error("builtin input cell at {0} holds a pointer")]
    ExpectedScalar(Pointer),
    /// Memory access failed while gathering builtin inputs.
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// An error that may occur while executing a Cairo instruction.
#[derive(Debug, Error)]
pub enum VmError {
    /// The program counter referenced a cell that holds no instruction.
    #[error("failed to fetch an instruction at {0}")]
    InstructionFetch(Pointer),
    /// A fetched instruction word did not fit in 63 bits.
    #[error("instruction word {0} does not fit in 63 bits")]
    InstructionTooLarge(Box<Felt>),
    /// The reserved high bit of an instruction word was set.
    #[error("reserved instruction bit is set")]
    ReservedBitSet,
    /// The source of the second operand of an instruction was invalid.
    #[error("undefined op1 source")]
    UndefinedOp1Source,
    /// The result logic of an instruction was invalid.
    #[error("undefined result logic")]
    UndefinedResultLogic,
    /// The program-counter update of an instruction was invalid.
    #[error("undefined pc update")]
    UndefinedPcUpdate,
    /// The allocation-pointer update of an instruction was invalid.
    #[error("undefined ap update")]
    UndefinedApUpdate,
    /// The OP code of an instruction was invalid.
    #[error("undefined op code")]
    UndefinedOpCode,
    /// An immediate operand carried an op1 offset other than one.
    #[error("op1 offset must be 1 for an immediate operand, got {0}")]
    ImmediateOffset(i16),
    /// The first operand could not be read or deduced.
    #[error("failed to compute op0 at {0}")]
    FailedToComputeOp0(Pointer),
    /// The second operand could not be read or deduced.
    #[error("failed to compute op1 at {0}")]
    FailedToComputeOp1(Pointer),
    /// The destination operand could not be read or deduced.
    #[error("no destination operand at {0}")]
    NoDst(Pointer),
    /// An `AssertEq` instruction had an unconstrained result.
    #[error("assert-eq with an unconstrained result")]
    UnconstrainedResAssertEq,
    /// An `AssertEq` instruction related two different values.
    #[error("assert-eq failed: {dst} != {res}")]
    DiffAssertValues {
        /// The destination operand.
        dst: Box<Value>,
        /// The computed result.
        res: Box<Value>,
    },
    /// A `Call` instruction found a return address other than the next pc.
    #[error("call: return pc cell holds {op0}, expected {ret_pc}")]
    CantWriteReturnPc {
        /// The first operand found in memory.
        op0: Box<Value>,
        /// The expected return program counter.
        ret_pc: Box<Value>,
    },
    /// A `Call` instruction found a saved frame pointer other than `fp`.
    #[error("call: return fp cell holds {dst}, expected {fp}")]
    CantWriteReturnFp {
        /// The destination operand found in memory.
        dst: Box<Value>,
        /// The current frame pointer.
        fp: Box<Value>,
    },
    /// An absolute jump computed a scalar result.
    #[error("jump target is not a pointer")]
    JumpResNotPointer,
    /// An absolute or relative jump had an unconstrained result.
    #[error("jump with an unconstrained result")]
    JumpResUnconstrained,
    /// A relative jump computed a pointer result.
    #[error("relative jump offset is not a scalar")]
    JumpRelResNotScalar,
    /// A conditional jump read a pointer as its branch offset.
    #[error("jnz branch offset is not a scalar")]
    JnzOffsetNotScalar,
    /// An `ap += res` update had an unconstrained result.
    #[error("ap update with an unconstrained result")]
    ApUpdateAddUnconstrained,
    /// A `Call` instruction carried an explicit ap update.
    #[error("call must use the regular ap update")]
    CallApUpdate,
    /// A stored builtin cell disagreed with its deduced value.
    #[error("auto deduction mismatch at {at}: stored {stored}, deduced {deduced}")]
    InconsistentAutoDeduction {
        /// The address of the disagreeing cell.
        at: Pointer,
        /// The value found in memory.
        stored: Box<Value>,
        /// The value the builtin deduced from its peers.
        deduced: Box<Value>,
    },
    /// The bound resource tracker ran out of steps.
    #[error("run resources exhausted")]
    RunResourcesExhausted,
    /// A hint aborted the run.
    #[error(transparent)]
    Hint(#[from] HintError),
    /// A builtin deduction failed.
    #[error(transparent)]
    Builtin(#[from] BuiltinError),
    /// A memory operation failed.
    #[error(transparent)]
    Memory(#[from] MemoryError),
    /// A value arithmetic operation failed.
    #[error(transparent)]
    Math(#[from] MathError),
}

/// An error that may occur while relocating or encoding the execution
/// trace.
#[derive(Debug, Error)]
pub enum TraceError {
    /// The trace was requested but tracing was disabled at construction.
    #[error("tracing is not enabled for this run")]
    NotEnabled,
    /// The trace was already relocated.
    #[error("trace has already been relocated")]
    AlreadyRelocated,
    /// The relocated trace was requested before relocation.
    #[error("trace has not been relocated")]
    NotRelocated,
    /// A trace register referenced a segment outside the base table.
    #[error("trace register references segment {0} outside the relocation table")]
    NoRelocationFound(isize),
    /// Memory relocation failed while relocating the trace.
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// An error produced by the abstract hint executor.
#[derive(Debug, Error)]
pub enum HintError {
    /// A hint referenced an identifier the processor does not know.
    #[error("unknown identifier {0}")]
    UnknownIdentifier(Box<str>),
    /// A hint could not be compiled.
    #[error("failed to compile hint: {0}")]
    CompileHint(Box<str>),
    /// A variable was missing from the current execution scope.
    #[error("variable {0} is not in the current scope")]
    VariableNotInScope(Box<str>),
    /// The outermost execution scope was exited.
    #[error("cannot exit the main execution scope")]
    CannotExitMainScope,
    /// A custom failure raised by the hint processor.
    #[error("{0}")]
    Custom(Box<str>),
    /// A hint failed a memory operation.
    #[error(transparent)]
    Memory(#[from] MemoryError),
    /// A hint failed a value computation.
    #[error(transparent)]
    Math(#[from] MathError),
}

/// An error that may occur while initializing or finalizing a run.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The requested layout name is not known.
    #[error("unknown layout {0}")]
    InvalidLayoutName(Box<str>),
    /// The program builtins were not in the canonical order.
    #[error("program builtins are not in the canonical order")]
    DisorderedBuiltins,
    /// The layout has no instance of a builtin the program requires.
    #[error("layout {layout} has no builtin {name}")]
    NoBuiltinForInstance {
        /// The name of the missing builtin.
        name: &'static str,
        /// The name of the selected layout.
        layout: Box<str>,
    },
    /// The program has no `main` entrypoint.
    #[error("program has no main entrypoint")]
    MissingMain,
    /// The program has no `start` offset, required in proof mode.
    #[error("program has no start offset")]
    NoProgramStart,
    /// The program has no `end` offset, required in proof mode.
    #[error("program has no end offset")]
    NoProgramEnd,
    /// The program base was required before segments were initialized.
    #[error("program base has not been initialized")]
    NoProgBase,
    /// The execution base was required before segments were initialized.
    #[error("execution base has not been initialized")]
    NoExecBase,
    /// A register was required before the entrypoint was initialized.
    #[error("initial {0} has not been set")]
    NoInitialRegister(&'static str),
    /// Loading the program or stack into memory failed.
    #[error("memory initialization failed: {0}")]
    MemoryInitialization(MemoryError),
    /// Validating the loaded memory failed.
    #[error("memory validation failed: {0}")]
    MemoryValidation(MemoryError),
    /// A builtin stop pointer was missing or mistyped on the return stack.
    #[error("missing stop pointer for builtin {0}")]
    NoStopPointer(&'static str),
    /// A builtin stop pointer did not match the builtin's used segment.
    #[error("invalid stop pointer for builtin {name}: expected {expected}, got {got}")]
    InvalidStopPointer {
        /// The name of the builtin.
        name: &'static str,
        /// The expected stop pointer.
        expected: Pointer,
        /// The pointer found on the stack.
        got: Pointer,
    },
    /// `end_run` was called a second time.
    #[error("end_run has already been called")]
    EndRunAlreadyCalled,
    /// Two builtins reported the same segment name.
    #[error("builtin segment name collision: {0}")]
    BuiltinSegmentNameCollision(&'static str),
    /// A builtin segment size was required before sizes were computed.
    #[error("builtin segment {0} has no finished size")]
    BaseNotFinished(usize),
    /// A finalized segment size did not fit the field used by the prover.
    #[error("finalized size {0} does not fit in 32 bits")]
    FinalizedSizeTooBig(usize),
    /// The run reached the final pc with steps left to execute.
    #[error("program reached its end with {0} steps remaining")]
    EndOfProgram(usize),
    /// Writing the output text to the provided sink failed.
    #[error("failed to write the program output")]
    WriteFail,
    /// A virtual machine error surfaced during the run, with its
    /// location.
    #[error(transparent)]
    VmException(Box<crate::runner::VmException>),
    /// A virtual machine error surfaced during the run.
    #[error(transparent)]
    Vm(#[from] VmError),
    /// A memory error surfaced while finalizing the run.
    #[error(transparent)]
    Memory(#[from] MemoryError),
    /// A trace error surfaced while relocating.
    #[error(transparent)]
    Trace(#[from] TraceError),
    /// A math error surfaced while checking budgets.
    #[error(transparent)]
    Math(#[from] MathError),
}

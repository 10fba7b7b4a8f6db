//! Defines the [`Runner`] type, responsible for driving a whole program
//! through a [`CairoVM`].
//!
//! The runner owns everything around the step loop: building the builtin
//! list against a layout, laying out the program, execution and builtin
//! segments, choosing a run mode, driving execution to the final program
//! counter, processing the return stack, and relocating memory and trace
//! to their flat form.

use std::any::Any;
use std::collections::HashMap;
use std::io::{self, Write};

use starknet_types_core::felt::Felt;

use crate::builtin::{
    Bitwise, Builtin, BuiltinName, EcOp, Keccak, Output, Pedersen, Poseidon, RangeCheck,
    SegmentArena, Signature,
};
use crate::error::{
    InsufficientAllocatedCellsKind, MemoryError, RunnerError, TraceError, VmError,
};
use crate::hint::{ExecutionScopes, HintProcessor};
use crate::memory::{Pointer, Value};
use crate::program::Program;
use crate::relocate::{relocate_memory, relocate_value};
use crate::trace::{relocate_trace, RelocatedTraceEntry};
use crate::CairoVM;

/// A virtual machine error annotated with where it happened.
///
/// This is what a failed run surfaces to the user: the error itself, the
/// program counter and step it fired at, and — when the program carries
/// the metadata — the source location and error-message attributes of the
/// faulty instruction.
#[derive(Debug, thiserror::Error)]
#[error("error at pc {pc} (step {step}): {inner}")]
pub struct VmException {
    /// The program counter the error fired at.
    pub pc: Pointer,
    /// The step the error fired at.
    pub step: usize,
    /// The source location of the faulty instruction, when known.
    pub location: Option<crate::program::InstructionLocation>,
    /// The error-message attribute covering the instruction, when any.
    pub error_attribute: Option<String>,
    /// The underlying error.
    #[source]
    pub inner: VmError,
}

/// A budget consulted by the run loop between steps.
///
/// When the tracker reports itself consumed, the run halts with
/// [`VmError::RunResourcesExhausted`] after the current step completes.
pub trait ResourceTracker {
    /// Returns whether the budget has run out.
    fn consumed(&self) -> bool;

    /// Consumes one step of the budget.
    fn consume_step(&mut self);
}

/// A step-count [`ResourceTracker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunResources {
    n_steps: Option<usize>,
}

impl RunResources {
    /// Creates a budget of `n_steps` steps.
    pub const fn new(n_steps: usize) -> Self {
        Self {
            n_steps: Some(n_steps),
        }
    }

    /// Creates an unlimited budget.
    pub const fn unlimited() -> Self {
        Self { n_steps: None }
    }

    /// Returns the remaining step count, if the budget is bounded.
    pub const fn n_steps(&self) -> Option<usize> {
        self.n_steps
    }
}

impl ResourceTracker for RunResources {
    fn consumed(&self) -> bool {
        self.n_steps == Some(0)
    }

    fn consume_step(&mut self) {
        if let Some(n) = self.n_steps.as_mut() {
            *n = n.saturating_sub(1);
        }
    }
}

/// The diluted-check pool parameters of a layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DilutedPool {
    /// Diluted units available per step.
    pub units_per_step: u32,
    /// The spacing between diluted bits.
    pub spacing: u32,
    /// The number of diluted bits.
    pub n_bits: u32,
}

impl DilutedPool {
    const fn standard() -> Self {
        Self {
            units_per_step: 16,
            spacing: 4,
            n_bits: 16,
        }
    }
}

/// A prover layout: the builtins it instantiates (with their ratios) and
/// its cell budgets.
#[derive(Debug, Clone)]
pub struct Layout {
    /// The layout name, as selected on the command line.
    pub name: &'static str,
    /// The builtins the layout instantiates, with their ratios.
    pub builtins: Vec<(BuiltinName, Option<u32>)>,
    /// Range-check units available per step.
    pub rc_units: u32,
    /// Memory units available per step.
    pub memory_units_per_step: u32,
    /// The fraction of memory units reserved for public memory.
    pub public_memory_fraction: u32,
    /// The diluted-check pool, when the layout has one.
    pub diluted_pool: Option<DilutedPool>,
}

impl Layout {
    /// The `plain` layout: output only.
    pub fn plain() -> Self {
        Self {
            name: "plain",
            builtins: vec![(BuiltinName::Output, None)],
            rc_units: 16,
            memory_units_per_step: 8,
            public_memory_fraction: 4,
            diluted_pool: None,
        }
    }

    /// The `small` layout: output, pedersen, range check and ecdsa.
    pub fn small() -> Self {
        Self {
            name: "small",
            builtins: vec![
                (BuiltinName::Output, None),
                (BuiltinName::Pedersen, Some(8)),
                (BuiltinName::RangeCheck, Some(8)),
                (BuiltinName::Ecdsa, Some(512)),
            ],
            rc_units: 16,
            memory_units_per_step: 8,
            public_memory_fraction: 4,
            diluted_pool: None,
        }
    }

    /// The `all_cairo` layout: every builtin.
    pub fn all_cairo() -> Self {
        Self {
            name: "all_cairo",
            builtins: vec![
                (BuiltinName::Output, None),
                (BuiltinName::Pedersen, Some(256)),
                (BuiltinName::RangeCheck, Some(8)),
                (BuiltinName::Ecdsa, Some(2048)),
                (BuiltinName::Bitwise, Some(16)),
                (BuiltinName::EcOp, Some(1024)),
                (BuiltinName::Keccak, Some(2048)),
                (BuiltinName::Poseidon, Some(256)),
                (BuiltinName::SegmentArena, None),
            ],
            rc_units: 4,
            memory_units_per_step: 8,
            public_memory_fraction: 8,
            diluted_pool: Some(DilutedPool::standard()),
        }
    }

    /// The `dynamic` layout: every builtin, budgets resolved by the
    /// prover.
    pub fn dynamic() -> Self {
        Self {
            name: "dynamic",
            ..Self::all_cairo()
        }
    }

    /// Resolves a layout by its command-line name.
    pub fn from_name(name: &str) -> Result<Self, RunnerError> {
        match name {
            "plain" => Ok(Self::plain()),
            "small" => Ok(Self::small()),
            "dynamic" => Ok(Self::dynamic()),
            "all_cairo" => Ok(Self::all_cairo()),
            other => Err(RunnerError::InvalidLayoutName(other.into())),
        }
    }

    fn ratio(&self, name: BuiltinName) -> Option<(BuiltinName, Option<u32>)> {
        self.builtins.iter().copied().find(|(b, _)| *b == name)
    }
}

/// The run mode of a [`Runner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerMode {
    /// Plain execution: run `main` until its return sentinel.
    Execution,
    /// Proof mode for Cairo 0 programs: run from `start` to `end` with the
    /// canonical `[fp, 0]` stack prefix.
    ProofModeCanonical,
    /// Proof mode for Cairo 1 programs: as canonical, with the return
    /// frame appended after the builtin stacks.
    ProofModeCairo1,
}

impl RunnerMode {
    /// Returns whether this mode produces a proof-shaped run.
    pub const fn is_proof_mode(self) -> bool {
        !matches!(self, Self::Execution)
    }
}

/// The resource usage of a finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResources {
    /// The number of steps executed.
    pub n_steps: usize,
    /// The number of memory holes left in non-builtin segments.
    pub n_memory_holes: usize,
    /// The number of instances used per builtin.
    pub builtin_instance_counter: Vec<(BuiltinName, usize)>,
}

/// The segment of one builtin, for the AIR public input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentInfo {
    /// The segment index.
    pub index: usize,
    /// The segment size.
    pub size: usize,
}

/// Drives a [`Program`] through a [`CairoVM`].
#[derive(Debug)]
pub struct Runner {
    program: Program,
    layout: Layout,
    mode: RunnerMode,
    allow_missing_builtins: bool,
    /// Hint dispatch keyed by full pointer instead of program offset; used
    /// when code may be loaded outside the program segment.
    extensive_hints: bool,
    program_base: Option<Pointer>,
    execution_base: Option<Pointer>,
    initial_pc: Option<Pointer>,
    initial_ap: Option<Pointer>,
    initial_fp: Option<Pointer>,
    final_pc: Option<Pointer>,
    /// Execution-segment offsets that belong to the public memory.
    execution_public_memory: Option<Vec<usize>>,
    run_ended: bool,
    segments_finalized: bool,
    relocation_table: Option<Vec<usize>>,
    relocated_memory: Vec<Option<Felt>>,
    relocated_trace: Option<Vec<RelocatedTraceEntry>>,
    /// The scope stack shared by every hint of the run.
    pub exec_scopes: ExecutionScopes,
}

impl Runner {
    /// Creates a runner for `program` against the named layout.
    pub fn new(program: Program, layout: &str, mode: RunnerMode) -> Result<Self, RunnerError> {
        Ok(Self {
            program,
            layout: Layout::from_name(layout)?,
            mode,
            allow_missing_builtins: false,
            extensive_hints: false,
            program_base: None,
            execution_base: None,
            initial_pc: None,
            initial_ap: None,
            initial_fp: None,
            final_pc: None,
            execution_public_memory: None,
            run_ended: false,
            segments_finalized: false,
            relocation_table: None,
            relocated_memory: Vec::new(),
            relocated_trace: None,
            exec_scopes: ExecutionScopes::new(),
        })
    }

    /// Tolerates program builtins absent from the layout.
    pub fn with_allow_missing_builtins(mut self, allow: bool) -> Self {
        self.allow_missing_builtins = allow;
        self
    }

    /// Keys hint dispatch by full pointer instead of program offset.
    pub fn with_extensive_hints(mut self, extensive: bool) -> Self {
        self.extensive_hints = extensive;
        self
    }

    /// Returns the program driven by this runner.
    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Returns the base of the program segment, once initialized.
    pub fn program_base(&self) -> Option<Pointer> {
        self.program_base
    }

    /// Returns the base of the execution segment, once initialized.
    pub fn execution_base(&self) -> Option<Pointer> {
        self.execution_base
    }

    /// Returns the final program counter of the run, once initialized.
    pub fn final_pc(&self) -> Option<Pointer> {
        self.final_pc
    }

    /// Runs the full initialization sequence.
    ///
    /// # Returns
    ///
    /// The program counter execution must reach for the run to end.
    pub fn initialize(&mut self, vm: &mut CairoVM) -> Result<Pointer, RunnerError> {
        tracing::debug!(layout = self.layout.name, mode = ?self.mode, "initializing runner");
        self.initialize_builtins(vm)?;
        self.initialize_segments(vm, None);
        let end = self.initialize_main_entrypoint(vm)?;
        self.initialize_vm(vm)?;
        Ok(end)
    }

    /// Builds the builtin list of the run.
    ///
    /// Program builtins must form a subsequence of the canonical order.
    /// Builtins the layout does not instantiate are rejected unless
    /// missing builtins are allowed. In proof mode, every layout builtin
    /// is instantiated even when the program does not declare it.
    pub fn initialize_builtins(&self, vm: &mut CairoVM) -> Result<(), RunnerError> {
        let declared: Vec<BuiltinName> = self.program.builtins.clone();
        if !is_subsequence(&declared, &BuiltinName::ALL) {
            return Err(RunnerError::DisorderedBuiltins);
        }

        let mut builtins: Vec<Box<dyn Builtin>> = Vec::new();
        for name in BuiltinName::ALL {
            let included = declared.contains(&name);
            let instance = self.layout.ratio(name);
            if included && instance.is_none() && !self.allow_missing_builtins {
                return Err(RunnerError::NoBuiltinForInstance {
                    name: name.as_str(),
                    layout: self.layout.name.into(),
                });
            }
            if !included && !(self.mode.is_proof_mode() && instance.is_some()) {
                continue;
            }
            let ratio = instance.and_then(|(_, ratio)| ratio);
            builtins.push(match name {
                BuiltinName::Output => Box::new(Output::new(included)),
                BuiltinName::Pedersen => Box::new(Pedersen::new(included, ratio)),
                BuiltinName::RangeCheck => Box::new(RangeCheck::new(included, ratio)),
                BuiltinName::Ecdsa => Box::new(Signature::new(included, ratio)),
                BuiltinName::Bitwise => Box::new(Bitwise::new(included, ratio)),
                BuiltinName::EcOp => Box::new(EcOp::new(included, ratio)),
                BuiltinName::Keccak => Box::new(Keccak::new(included, ratio)),
                BuiltinName::Poseidon => Box::new(Poseidon::new(included, ratio)),
                BuiltinName::SegmentArena => Box::new(SegmentArena::new(included)),
            });
        }
        vm.builtins = builtins;
        Ok(())
    }

    /// Creates the program, execution and builtin segments, storing the
    /// first address of each as its owner's base.
    pub fn initialize_segments(&mut self, vm: &mut CairoVM, program_base: Option<Pointer>) {
        self.program_base = Some(program_base.unwrap_or_else(|| vm.segments.add()));
        self.execution_base = Some(vm.segments.add());
        for builtin in vm.builtins.iter_mut() {
            builtin.init_segments(&mut vm.segments);
        }
    }

    /// Loads the program bytecode and the initial stack into memory.
    fn initialize_state(
        &mut self,
        vm: &mut CairoVM,
        entrypoint: usize,
        stack: Vec<Value>,
    ) -> Result<(), RunnerError> {
        let program_base = self.program_base.ok_or(RunnerError::NoProgBase)?;
        let execution_base = self.execution_base.ok_or(RunnerError::NoExecBase)?;
        self.initial_pc = Some(program_base.add(entrypoint).map_err(VmError::Math)?);
        vm.segments
            .load_data(program_base, &self.program.data)
            .map_err(RunnerError::MemoryInitialization)?;
        vm.segments
            .load_data(execution_base, &stack)
            .map_err(RunnerError::MemoryInitialization)?;
        Ok(())
    }

    /// Initializes state for running from `entrypoint` with a return
    /// frame.
    ///
    /// # Returns
    ///
    /// The end sentinel the run must reach.
    pub fn initialize_function_entrypoint(
        &mut self,
        vm: &mut CairoVM,
        entrypoint: usize,
        mut stack: Vec<Value>,
        return_fp: Value,
    ) -> Result<Pointer, RunnerError> {
        let end = vm.segments.add();
        stack.push(return_fp);
        stack.push(Value::Pointer(end));
        let execution_base = self.execution_base.ok_or(RunnerError::NoExecBase)?;
        let initial_fp = execution_base.add(stack.len()).map_err(VmError::Math)?;
        self.initial_fp = Some(initial_fp);
        self.initial_ap = Some(initial_fp);
        self.initialize_state(vm, entrypoint, stack)?;
        self.final_pc = Some(end);
        Ok(end)
    }

    /// Initializes state for running from the program's entrypoint in the
    /// runner's mode.
    ///
    /// # Returns
    ///
    /// The program counter the run must reach.
    pub fn initialize_main_entrypoint(&mut self, vm: &mut CairoVM) -> Result<Pointer, RunnerError> {
        let mut stack = Vec::new();
        for builtin in vm.builtins.iter() {
            stack.extend(builtin.initial_stack());
        }

        if self.mode == RunnerMode::Execution {
            let main = self.program.main.ok_or(RunnerError::MissingMain)?;
            let return_fp = vm.segments.add();
            return self.initialize_function_entrypoint(
                vm,
                main,
                stack,
                Value::Pointer(return_fp),
            );
        }

        let start = self.program.start.ok_or(RunnerError::NoProgramStart)?;
        let end = self.program.end.ok_or(RunnerError::NoProgramEnd)?;
        let execution_base = self.execution_base.ok_or(RunnerError::NoExecBase)?;
        let program_base = self.program_base.ok_or(RunnerError::NoProgBase)?;

        let stack = match self.mode {
            RunnerMode::ProofModeCanonical => {
                // The canonical prefix: the frame pointer the proof
                // starts from, and a zeroed return address.
                let target = execution_base.add(2).map_err(VmError::Math)?;
                let mut full = vec![Value::Pointer(target), Value::Scalar(Felt::ZERO)];
                full.extend(stack);
                full
            }
            RunnerMode::ProofModeCairo1 => {
                // Cairo 1 keeps the builtin stacks first and appends the
                // return frame.
                let return_fp = vm.segments.add();
                let end_segment = vm.segments.add();
                stack.push(Value::Pointer(return_fp));
                stack.push(Value::Pointer(end_segment));
                stack
            }
            RunnerMode::Execution => unreachable!("handled above"),
        };

        let target_offset = match self.mode {
            RunnerMode::ProofModeCanonical => 2,
            _ => stack.len(),
        };
        self.execution_public_memory = Some((0..stack.len()).collect());
        self.initialize_state(vm, start, stack)?;
        let initial_fp = execution_base.add(target_offset).map_err(VmError::Math)?;
        self.initial_fp = Some(initial_fp);
        self.initial_ap = Some(initial_fp);
        let final_pc = program_base.add(end).map_err(VmError::Math)?;
        self.final_pc = Some(final_pc);
        Ok(final_pc)
    }

    /// Moves the initial register values into the machine, registers the
    /// builtin validation rules and validates the loaded memory.
    pub fn initialize_vm(&mut self, vm: &mut CairoVM) -> Result<(), RunnerError> {
        vm.cpu.pc = self.initial_pc.ok_or(RunnerError::NoInitialRegister("pc"))?;
        vm.cpu.ap = self.initial_ap.ok_or(RunnerError::NoInitialRegister("ap"))?;
        vm.cpu.fp = self.initial_fp.ok_or(RunnerError::NoInitialRegister("fp"))?;
        for builtin in vm.builtins.iter() {
            builtin.add_validation_rule(&mut vm.segments.memory);
        }
        vm.segments
            .memory
            .validate_existing_memory()
            .map_err(RunnerError::MemoryValidation)
    }

    /// Compiles every hint of the program with `hint_processor`, keyed by
    /// program offset.
    fn compile_hints(
        &self,
        hint_processor: &dyn HintProcessor,
    ) -> Result<HashMap<usize, Vec<Box<dyn Any>>>, VmError> {
        let references = &self.program.reference_manager;
        let mut compiled: HashMap<usize, Vec<Box<dyn Any>>> = HashMap::new();
        for (offset, hints) in self.program.hints.iter() {
            for hint in hints {
                let data = hint_processor
                    .compile_hint(&hint.code, &hint.ap_tracking, &hint.reference_ids, references)
                    .map_err(VmError::Hint)?;
                compiled.entry(*offset).or_default().push(data);
            }
        }
        Ok(compiled)
    }

    /// Returns the compiled hints attached to the current program
    /// counter.
    ///
    /// In the default dispatch mode hints are keyed by offset into the
    /// program segment; the extensive mode keys them by full pointer so
    /// code loaded at arbitrary segments still finds its hints.
    fn hints_at<'a>(
        &self,
        compiled: &'a HashMap<usize, Vec<Box<dyn Any>>>,
        program_base: Pointer,
        pc: Pointer,
    ) -> &'a [Box<dyn Any>] {
        let key = if self.extensive_hints {
            (pc.segment == program_base.segment).then_some(pc.offset)
        } else if pc.segment == program_base.segment {
            pc.offset.checked_sub(program_base.offset)
        } else {
            None
        };
        key.and_then(|key| compiled.get(&key))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Runs the machine until its program counter reaches `address`.
    pub fn run_until_pc(
        &mut self,
        address: Pointer,
        vm: &mut CairoVM,
        hint_processor: &mut dyn HintProcessor,
        resources: &mut dyn ResourceTracker,
    ) -> Result<(), RunnerError> {
        let compiled = self.compile_hints(hint_processor)?;
        let program_base = self.program_base.ok_or(RunnerError::NoProgBase)?;
        while vm.cpu.pc != address {
            if resources.consumed() {
                return Err(VmError::RunResourcesExhausted.into());
            }
            let hint_datas = self.hints_at(&compiled, program_base, vm.cpu.pc);
            vm.step(
                hint_processor,
                &mut self.exec_scopes,
                hint_datas,
                &self.program.constants,
            )
            .map_err(|inner| self.annotate(vm, program_base, inner))?;
            resources.consume_step();
        }
        Ok(())
    }

    /// Wraps a step error with the program counter, step and source
    /// attribution it fired at.
    fn annotate(&self, vm: &CairoVM, program_base: Pointer, inner: VmError) -> RunnerError {
        let pc = vm.cpu.pc;
        let offset = (pc.segment == program_base.segment)
            .then(|| pc.offset.checked_sub(program_base.offset))
            .flatten();
        let location = offset.and_then(|o| self.program.instruction_locations.get(&o).cloned());
        let error_attribute = offset.and_then(|o| {
            self.program
                .attributes_at(o)
                .next()
                .map(|attr| attr.value.clone())
        });
        RunnerError::VmException(Box::new(VmException {
            pc,
            step: vm.current_step,
            location,
            error_attribute,
            inner,
        }))
    }

    /// Executes exactly `steps` steps from the current position.
    ///
    /// # Returns
    ///
    /// [`RunnerError::EndOfProgram`] when the final program counter is
    /// reached with steps still to execute.
    pub fn run_for_steps(
        &mut self,
        steps: usize,
        vm: &mut CairoVM,
        hint_processor: &mut dyn HintProcessor,
    ) -> Result<(), RunnerError> {
        let compiled = self.compile_hints(hint_processor).map_err(RunnerError::Vm)?;
        let program_base = self.program_base.ok_or(RunnerError::NoProgBase)?;
        for remaining in (1..=steps).rev() {
            if self.final_pc == Some(vm.cpu.pc) {
                return Err(RunnerError::EndOfProgram(remaining));
            }
            let hint_datas = self.hints_at(&compiled, program_base, vm.cpu.pc);
            vm.step(
                hint_processor,
                &mut self.exec_scopes,
                hint_datas,
                &self.program.constants,
            )
            .map_err(|inner| self.annotate(vm, program_base, inner))?;
        }
        Ok(())
    }

    /// Executes steps until `steps` steps have run since the start of the
    /// program.
    pub fn run_until_steps(
        &mut self,
        steps: usize,
        vm: &mut CairoVM,
        hint_processor: &mut dyn HintProcessor,
    ) -> Result<(), RunnerError> {
        self.run_for_steps(steps.saturating_sub(vm.current_step), vm, hint_processor)
    }

    /// Ends the run: moves temporary segments onto their destinations,
    /// verifies every builtin cell against its deduction and computes the
    /// effective segment sizes.
    pub fn end_run(&mut self, vm: &mut CairoVM) -> Result<(), RunnerError> {
        if self.run_ended {
            return Err(RunnerError::EndRunAlreadyCalled);
        }
        tracing::debug!(steps = vm.current_step, "ending run");
        vm.segments.memory.relocate_memory()?;
        vm.verify_auto_deductions()?;
        vm.segments.compute_effective_sizes();
        self.run_ended = true;
        Ok(())
    }

    /// Pops every included builtin's stop pointer off the return stack, in
    /// reverse declaration order.
    pub fn read_return_values(&mut self, vm: &mut CairoVM) -> Result<(), RunnerError> {
        let mut pointer = vm.cpu.ap;
        // The builtins vector is detached so their `final_stack` can read
        // the segments.
        let mut builtins = std::mem::take(&mut vm.builtins);
        let result = builtins
            .iter_mut()
            .rev()
            .try_for_each(|builtin| -> Result<(), RunnerError> {
                pointer = builtin.final_stack(&vm.segments, pointer)?;
                Ok(())
            });
        vm.builtins = builtins;
        result
    }

    /// Records the finalized sizes and public memory of every segment for
    /// the prover: the whole program segment, the public portion of the
    /// execution segment and every builtin segment.
    pub fn finalize_segments(&mut self, vm: &mut CairoVM) -> Result<(), RunnerError> {
        if self.segments_finalized {
            return Ok(());
        }
        let program_base = self.program_base.ok_or(RunnerError::NoProgBase)?;
        let execution_base = self.execution_base.ok_or(RunnerError::NoExecBase)?;

        let size = self.program.data.len();
        if u32::try_from(size).is_err() {
            return Err(RunnerError::FinalizedSizeTooBig(size));
        }
        // The whole program is public, on page 0.
        vm.segments.finalize(
            program_base.segment as usize,
            Some(size),
            Some((0..size).map(|i| (i, 0)).collect()),
        );
        let public_memory: Vec<(usize, usize)> = self
            .execution_public_memory
            .clone()
            .unwrap_or_default()
            .into_iter()
            .map(|offset| (offset, 0))
            .collect();
        vm.segments
            .finalize(execution_base.segment as usize, None, Some(public_memory));

        for builtin in vm.builtins.iter() {
            let Some(base) = builtin.base() else { continue };
            let used = builtin
                .used_cells(&vm.segments)
                .ok_or(RunnerError::BaseNotFinished(base))?;
            if u32::try_from(used).is_err() {
                return Err(RunnerError::FinalizedSizeTooBig(used));
            }
            let public = (builtin.name() == BuiltinName::Output)
                .then(|| (0..used).map(|i| (i, 0)).collect());
            vm.segments.finalize(base, Some(used), public);
        }
        self.segments_finalized = true;
        Ok(())
    }

    /// Relocates memory and trace to their flat form.
    ///
    /// Relocation may run only once.
    pub fn relocate(&mut self, vm: &mut CairoVM) -> Result<(), RunnerError> {
        vm.segments.compute_effective_sizes();
        if !self.relocated_memory.is_empty() {
            return Err(MemoryError::AlreadyRelocated.into());
        }
        let table = vm.segments.relocate_segments()?;
        tracing::debug!(segments = table.len(), "relocating memory");
        self.relocated_memory = relocate_memory(&vm.segments.memory, &table)?;
        if let Some(trace) = vm.trace.as_deref() {
            if self.relocated_trace.is_some() {
                return Err(TraceError::AlreadyRelocated.into());
            }
            self.relocated_trace = Some(relocate_trace(trace, &table)?);
        }
        self.relocation_table = Some(table);
        Ok(())
    }

    /// Returns the flat memory produced by [`Runner::relocate`].
    pub fn relocated_memory(&self) -> &[Option<Felt>] {
        &self.relocated_memory
    }

    /// Returns the flat trace produced by [`Runner::relocate`].
    ///
    /// # Returns
    ///
    /// [`TraceError::NotEnabled`] when the machine ran without tracing,
    /// [`TraceError::NotRelocated`] before relocation.
    pub fn relocated_trace(&self) -> Result<&[RelocatedTraceEntry], TraceError> {
        match self.relocated_trace.as_deref() {
            Some(trace) => Ok(trace),
            None if self.relocation_table.is_some() => Err(TraceError::NotEnabled),
            None => Err(TraceError::NotRelocated),
        }
    }

    /// Returns the flat addresses of the public memory, with their page
    /// ids.
    pub fn get_public_memory_addresses(
        &self,
        vm: &CairoVM,
    ) -> Result<Vec<(usize, usize)>, RunnerError> {
        let table = self
            .relocation_table
            .as_ref()
            .ok_or(MemoryError::MissingSegmentSizes)?;
        Ok(vm.segments.get_public_memory_addresses(table)?)
    }

    /// Counts the memory holes left in non-builtin segments.
    pub fn get_memory_holes(&self, vm: &CairoVM) -> Result<usize, MemoryError> {
        let builtin_segments: Vec<usize> =
            vm.builtins.iter().filter_map(|b| b.base()).collect();
        vm.segments.memory_holes(&builtin_segments)
    }

    /// Reports the resources the finished run consumed.
    pub fn get_execution_resources(&self, vm: &CairoVM) -> Result<ExecutionResources, RunnerError> {
        let mut builtin_instance_counter = Vec::with_capacity(vm.builtins.len());
        for builtin in vm.builtins.iter() {
            builtin_instance_counter.push((
                builtin.name(),
                builtin.used_instances(&vm.segments).unwrap_or(0),
            ));
        }
        Ok(ExecutionResources {
            n_steps: vm.current_step,
            n_memory_holes: self.get_memory_holes(vm)?,
            builtin_instance_counter,
        })
    }

    /// Maps every builtin to its segment index and size, for the AIR
    /// public input.
    pub fn get_builtin_segments_info(
        &self,
        vm: &CairoVM,
    ) -> Result<HashMap<&'static str, SegmentInfo>, RunnerError> {
        let mut info = HashMap::new();
        for builtin in vm.builtins.iter() {
            let name = builtin.name().as_str();
            let (base, _) = builtin.segment_addresses();
            let Some(index) = base else { continue };
            let size = vm
                .segments
                .segment_size(index)
                .ok_or(RunnerError::BaseNotFinished(index))?;
            if info.insert(name, SegmentInfo { index, size }).is_some() {
                return Err(RunnerError::BuiltinSegmentNameCollision(name));
            }
        }
        Ok(info)
    }

    /// Writes the used cells of the output builtin's segment to `stdout`,
    /// one field element per line.
    ///
    /// Does nothing when the program has no output builtin.
    pub fn write_output(
        &mut self,
        vm: &mut CairoVM,
        stdout: &mut dyn io::Write,
    ) -> Result<(), RunnerError> {
        let Some(output) = vm
            .builtins
            .iter()
            .find(|b| b.name() == BuiltinName::Output)
        else {
            return Ok(());
        };
        let Some(base) = output.base() else {
            return Ok(());
        };
        vm.segments.compute_effective_sizes();
        let used = vm
            .segments
            .used_size(base)
            .ok_or(RunnerError::BaseNotFinished(base))?;
        for offset in 0..used {
            let addr = Pointer::new(base as isize, offset);
            let value = vm
                .segments
                .memory
                .get(addr)
                .ok_or(MemoryError::UnknownCell(addr))?;
            match value {
                Value::Scalar(felt) => writeln!(stdout, "{felt}"),
                Value::Pointer(p) => writeln!(stdout, "{p}"),
            }
            .map_err(|_| RunnerError::WriteFail)?;
        }
        Ok(())
    }

    /// Checks that the layout's permanent range-check units cover the
    /// offsets seen during the run plus every range-check builtin cell.
    pub fn check_range_check_usage(&self, vm: &CairoVM) -> Result<(), RunnerError> {
        let Some((rc_min, rc_max)) = vm.rc_limits() else {
            return Ok(());
        };
        let mut used_by_builtins = 0;
        for builtin in vm.builtins.iter() {
            used_by_builtins += builtin.used_perm_range_check_units(&vm.segments);
        }
        let available = (self.layout.rc_units as usize)
            .saturating_sub(3)
            .saturating_mul(vm.current_step);
        let unused = available.saturating_sub(used_by_builtins);
        if unused < (rc_max - rc_min) as usize {
            return Err(MemoryError::InsufficientAllocatedCells(
                InsufficientAllocatedCellsKind::RangeCheck,
            )
            .into());
        }
        Ok(())
    }

    /// Checks that the layout's memory units cover the builtins, the
    /// public memory and the holes of the run.
    pub fn check_memory_usage(&self, vm: &CairoVM) -> Result<(), RunnerError> {
        let mut builtins_memory_units = 0;
        for builtin in vm.builtins.iter() {
            builtins_memory_units += builtin.allocated_memory_units(vm.current_step)?;
        }
        let total = self.layout.memory_units_per_step as usize * vm.current_step;
        let fraction = self.layout.public_memory_fraction as usize;
        if total % fraction != 0 {
            return Err(crate::error::MathError::NotDivisible(total, fraction).into());
        }
        let public_memory_units = total / fraction;
        // Four memory units per step go to the instruction itself.
        let instruction_units = 4 * vm.current_step;
        let unused = total.saturating_sub(
            public_memory_units + instruction_units + builtins_memory_units,
        );
        if unused < self.get_memory_holes(vm)? {
            return Err(MemoryError::InsufficientAllocatedCells(
                InsufficientAllocatedCellsKind::MemoryHoles,
            )
            .into());
        }
        Ok(())
    }

    /// Checks that the layout's diluted pool covers the builtins that
    /// consume diluted units.
    pub fn check_diluted_check_usage(&self, vm: &CairoVM) -> Result<(), RunnerError> {
        let Some(pool) = self.layout.diluted_pool else {
            return Ok(());
        };
        let mut used_by_builtins = 0;
        for builtin in vm.builtins.iter() {
            let per_ratio = builtin.used_diluted_check_units(pool.spacing, pool.n_bits);
            if per_ratio == 0 {
                continue;
            }
            let ratio = builtin.state().ratio.unwrap_or(1) as usize;
            used_by_builtins += per_ratio * (vm.current_step / ratio);
        }
        let diluted_units = pool.units_per_step as usize * vm.current_step;
        let unused = diluted_units.saturating_sub(used_by_builtins);
        if unused < 1usize << pool.n_bits {
            return Err(MemoryError::InsufficientAllocatedCells(
                InsufficientAllocatedCellsKind::DilutedCheck,
            )
            .into());
        }
        Ok(())
    }

    /// Relocates a single value through the final relocation table.
    pub fn relocate_single_value(&self, value: Value) -> Result<Felt, MemoryError> {
        let table = self
            .relocation_table
            .as_ref()
            .ok_or(MemoryError::MissingSegmentSizes)?;
        relocate_value(value, table)
    }
}

/// Returns whether `sub` appears in `sup` in order (not necessarily
/// contiguously).
fn is_subsequence<T: PartialEq>(sub: &[T], sup: &[T]) -> bool {
    let mut iter = sup.iter();
    sub.iter().all(|item| iter.any(|other| other == item))
}

//! End-to-end runs through the public API.

use assert_matches::assert_matches;
use num_traits::ToPrimitive;
use starknet_types_core::felt::Felt;

use groudon::builtin::BuiltinName;
use groudon::error::{MemoryError, RunnerError, VmError};
use groudon::hint::NoopHintProcessor;
use groudon::memory::{Pointer, Value};
use groudon::program::Program;
use groudon::runner::{RunResources, Runner, RunnerMode};
use groudon::trace::write_trace_file;
use groudon::CairoVM;

/// `[ap] = 5; ap++` (two cells), `[ap] = [ap - 1] + [ap - 1]; ap++`,
/// `ret`.
fn arithmetic_program() -> Program {
    let mut program = Program::new(
        Vec::new(),
        vec![
            Value::from(0x480680017fff8000u64),
            Value::from(5u64),
            Value::from(0x48307fff7fff8000u64),
            Value::from(0x208b7fff7fff7ffeu64),
        ],
    );
    program.main = Some(0);
    program
}

fn run_to_end(program: Program, layout: &str) -> (Runner, CairoVM) {
    let mut runner = Runner::new(program, layout, RunnerMode::Execution).unwrap();
    let mut vm = CairoVM::new(true);
    let end = runner.initialize(&mut vm).unwrap();
    runner
        .run_until_pc(
            end,
            &mut vm,
            &mut NoopHintProcessor,
            &mut RunResources::unlimited(),
        )
        .unwrap();
    runner.end_run(&mut vm).unwrap();
    (runner, vm)
}

#[test]
fn simple_arithmetic_end_to_end() {
    let (mut runner, mut vm) = run_to_end(arithmetic_program(), "plain");
    assert_eq!(vm.trace().unwrap().len(), 3);

    runner.relocate(&mut vm).unwrap();
    let trace = runner.relocated_trace().unwrap();
    // The program segment starts at flat address 1; the `ret` lives at
    // its fourth cell.
    assert_eq!(trace[0].pc, 1);
    assert_eq!(trace[2].pc, 4);
    // Registers stay in one flat frame for the whole run.
    assert_eq!(trace[0].fp, trace[2].fp);

    let memory = runner.relocated_memory();
    let first_write = trace[0].ap as usize;
    assert_eq!(memory[first_write], Some(Felt::from(5)));
    assert_eq!(memory[first_write + 1], Some(Felt::from(10)));
    // Address 0 is reserved.
    assert_eq!(memory[0], None);

    // The binary trace holds one 24-byte record per step.
    let mut encoded = Vec::new();
    write_trace_file(&mut encoded, trace).unwrap();
    assert_eq!(encoded.len(), 3 * 24);
}

#[test]
fn write_once_violation_is_reported() {
    let mut vm = CairoVM::new(false);
    let base = vm.segments.add();
    vm.segments.memory.set(base, Felt::from(1)).unwrap();
    assert_matches!(
        vm.segments.memory.set(base, Felt::from(2)),
        Err(MemoryError::Inconsistent { existing, attempted, .. })
            if *existing == Value::from(1u64) && *attempted == Value::from(2u64)
    );
}

#[test]
fn bitwise_cells_deduce_and_verify() {
    let mut program = arithmetic_program();
    program.builtins = vec![BuiltinName::Bitwise];
    let mut runner = Runner::new(program, "all_cairo", RunnerMode::Execution).unwrap();
    let mut vm = CairoVM::new(false);
    runner.initialize(&mut vm).unwrap();

    let base = vm
        .builtins()
        .iter()
        .find(|b| b.name() == BuiltinName::Bitwise)
        .and_then(|b| b.base())
        .unwrap() as isize;
    vm.segments
        .memory
        .set(Pointer::new(base, 0), Felt::from(12))
        .unwrap();
    vm.segments
        .memory
        .set(Pointer::new(base, 1), Felt::from(10))
        .unwrap();
    let bitwise = vm
        .builtins()
        .iter()
        .find(|b| b.name() == BuiltinName::Bitwise)
        .unwrap();
    let deduced: Vec<_> = (2..5)
        .map(|i| {
            bitwise
                .deduce(Pointer::new(base, i), &vm.segments.memory)
                .unwrap()
                .unwrap()
        })
        .collect();
    assert_eq!(
        deduced,
        vec![Value::from(8u64), Value::from(6u64), Value::from(14u64)]
    );
    for (i, value) in deduced.into_iter().enumerate() {
        vm.segments
            .memory
            .set(Pointer::new(base, 2 + i), value)
            .unwrap();
    }
    vm.verify_auto_deductions().unwrap();

    // A fresh instance whose output contradicts its inputs fails the
    // post-run verification.
    vm.segments
        .memory
        .set(Pointer::new(base, 5), Felt::from(12))
        .unwrap();
    vm.segments
        .memory
        .set(Pointer::new(base, 6), Felt::from(10))
        .unwrap();
    vm.segments
        .memory
        .set(Pointer::new(base, 7), Felt::from(7))
        .unwrap();
    assert_matches!(
        vm.verify_auto_deductions(),
        Err(VmError::InconsistentAutoDeduction { .. })
    );
}

#[test]
fn range_check_validates_the_initial_stack() {
    // A program declaring range_check gets its cells validated on write;
    // preloaded out-of-range cells abort initialization.
    let mut program = arithmetic_program();
    program.builtins = vec![BuiltinName::RangeCheck];
    let mut runner = Runner::new(program, "small", RunnerMode::Execution).unwrap();
    let mut vm = CairoVM::new(false);
    runner.initialize_builtins(&mut vm).unwrap();
    runner.initialize_segments(&mut vm, None);
    let rc_base = vm.builtins()[0].base().unwrap();
    vm.segments
        .memory
        .set(
            Pointer::new(rc_base as isize, 0),
            Felt::from_hex_unchecked("0x400000000000000000000000000000000"),
        )
        .unwrap();
    runner.initialize_main_entrypoint(&mut vm).unwrap();
    assert_matches!(
        runner.initialize_vm(&mut vm),
        Err(RunnerError::MemoryValidation(
            MemoryError::RangeCheckOutOfBounds(_)
        ))
    );
}

#[test]
fn finalized_run_exposes_public_memory() {
    let mut program = arithmetic_program();
    program.builtins = vec![BuiltinName::Output];
    let mut runner = Runner::new(program, "small", RunnerMode::Execution).unwrap();
    let mut vm = CairoVM::new(true);
    let end = runner.initialize(&mut vm).unwrap();
    runner
        .run_until_pc(
            end,
            &mut vm,
            &mut NoopHintProcessor,
            &mut RunResources::unlimited(),
        )
        .unwrap();
    runner.end_run(&mut vm).unwrap();
    runner.finalize_segments(&mut vm).unwrap();
    runner.relocate(&mut vm).unwrap();

    // The whole program segment (4 cells from flat address 1) is public.
    let addresses = runner.get_public_memory_addresses(&vm).unwrap();
    let program_addresses: Vec<_> = addresses.iter().filter(|(a, _)| *a < 5).collect();
    assert_eq!(program_addresses.len(), 4);
    assert!(addresses.iter().all(|(_, page)| *page == 0));
}

#[test]
fn temporary_segments_relocate_before_flattening() {
    let (mut runner, mut vm) = {
        let mut runner =
            Runner::new(arithmetic_program(), "plain", RunnerMode::Execution).unwrap();
        let mut vm = CairoVM::new(false);
        let end = runner.initialize(&mut vm).unwrap();

        // A hint-style allocation: scratch data in a temporary segment,
        // referenced from the execution segment.
        let temp = vm.segments.add_temp();
        vm.segments
            .load_data(temp, &[Value::from(7u64), Value::from(9u64)])
            .unwrap();
        let exec = runner.execution_base().unwrap();
        vm.segments.memory.set(exec.add(4).unwrap(), temp).unwrap();
        let destination = vm.segments.add();
        vm.segments
            .memory
            .add_relocation_rule(temp, destination)
            .unwrap();

        runner
            .run_until_pc(
                end,
                &mut vm,
                &mut NoopHintProcessor,
                &mut RunResources::unlimited(),
            )
            .unwrap();
        runner.end_run(&mut vm).unwrap();
        (runner, vm)
    };

    // The temporary cells moved onto their destination segment.
    assert_eq!(vm.segments.memory.temp_segment_count(), 0);
    let exec = runner.execution_base().unwrap();
    let moved = vm.segments.memory.get_pointer(exec.add(4).unwrap()).unwrap();
    assert!(moved.segment >= 0);
    assert_eq!(vm.segments.memory.get_felt(moved).unwrap(), Felt::from(7));
    assert_eq!(
        vm.segments
            .memory
            .get_felt(moved.add(1).unwrap())
            .unwrap(),
        Felt::from(9)
    );

    // And the flat memory sees only real addresses.
    runner.relocate(&mut vm).unwrap();
    let flat = runner
        .relocate_single_value(Value::Pointer(moved))
        .unwrap();
    let flat = flat.to_u64().unwrap() as usize;
    assert_eq!(runner.relocated_memory()[flat], Some(Felt::from(7)));
}

#[test]
fn proof_mode_runs_to_the_end_label() {
    let mut program = arithmetic_program();
    // Skip the trailing `ret`: proof mode stops at the end label.
    program.start = Some(0);
    program.end = Some(3);
    let mut runner = Runner::new(program, "plain", RunnerMode::ProofModeCanonical).unwrap();
    let mut vm = CairoVM::new(true);
    let end = runner.initialize(&mut vm).unwrap();
    runner
        .run_until_pc(
            end,
            &mut vm,
            &mut NoopHintProcessor,
            &mut RunResources::unlimited(),
        )
        .unwrap();
    assert_eq!(vm.cpu().pc, end);
    assert_eq!(vm.current_step(), 2);
}

#[test]
fn output_builtin_renders_its_segment() {
    let mut program = arithmetic_program();
    program.builtins = vec![BuiltinName::Output];
    let mut runner = Runner::new(program, "small", RunnerMode::Execution).unwrap();
    let mut vm = CairoVM::new(false);
    runner.initialize(&mut vm).unwrap();
    let output_base = vm.builtins()[0].base().unwrap();
    vm.segments
        .load_data(
            Pointer::new(output_base as isize, 0),
            &[Value::from(17u64), Value::from(42u64)],
        )
        .unwrap();
    let mut rendered = Vec::new();
    runner.write_output(&mut vm, &mut rendered).unwrap();
    assert_eq!(String::from_utf8(rendered).unwrap(), "17\n42\n");
}

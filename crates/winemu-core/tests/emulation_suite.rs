//! End-to-end emulation suite: sample programs, sessions, faults and tracing.

#![allow(
    clippy::pedantic,
    clippy::nursery,
    clippy::cast_possible_truncation,
    clippy::too_many_lines
)]

use std::sync::{Arc, Mutex};
use std::thread;

use bitflags as _;
use goblin as _;
use iced_x86 as _;
use proptest::prelude::*;
use rstest::rstest;
#[cfg(feature = "serde")]
use serde as _;
use tempfile as _;
use thiserror as _;
use tracing as _;
use widestring as _;
use winemu_core::{
    AddressSpace, EmulatorConfig, FaultCode, GeneralRegister, NtKernel, RegisterFile, RunOutcome,
    RunRequest, StopReason, SyscallError, SyscallHandler, SyscallOutcome, Termination, TraceEvent,
    WindowsEmulator, X64Interpreter,
};
use winemu_image::samples::{self, EXIT_STUB_INSTRUCTIONS, TEXT_RVA};
use winemu_image::DEFAULT_EXE_BASE;

const ENTRY: u64 = DEFAULT_EXE_BASE + TEXT_RVA as u64;

fn quiet() -> EmulatorConfig {
    EmulatorConfig {
        log_output: false,
        ..EmulatorConfig::default()
    }
}

fn emulator(image: &[u8]) -> WindowsEmulator {
    WindowsEmulator::from_image_bytes(
        "prog.exe",
        image,
        quiet(),
        X64Interpreter::new(),
        NtKernel::default(),
    )
    .unwrap()
}

fn run(image: &[u8], request: RunRequest) -> (WindowsEmulator, RunOutcome) {
    let mut emulator = emulator(image);
    let outcome = emulator.start(request);
    (emulator, outcome)
}

#[rstest]
#[case::return_code(samples::return_code(42).unwrap(), 42, 2 + EXIT_STUB_INSTRUCTIONS)]
#[case::sum_to(samples::sum_to(100).unwrap(), 5050, 3 * 100 + 3 + EXIT_STUB_INSTRUCTIONS)]
#[case::factorial(samples::factorial(10).unwrap(), 3_628_800, 0)]
#[case::terminate(samples::terminate(7).unwrap(), 7, 4)]
fn samples_exit_with_their_result(
    #[case] image: Vec<u8>,
    #[case] code: u32,
    #[case] instructions: u64,
) {
    let (emulator, outcome) = run(&image, RunRequest::new());
    assert_eq!(outcome.stop, StopReason::Terminated(code));
    assert_eq!(emulator.process().exit_code(), Some(code));
    if instructions != 0 {
        assert_eq!(outcome.retired, instructions);
    }
    assert_eq!(emulator.process().executed_instructions(), outcome.retired);
}

#[test]
fn split_sessions_resume_where_they_stopped() {
    let image = samples::sum_to(10).unwrap();
    let total = 3 * 10 + 3 + EXIT_STUB_INSTRUCTIONS;
    let mut emulator = emulator(&image);

    let mut retired = 0;
    loop {
        let outcome = emulator.start(RunRequest::new().with_instruction_limit(7));
        retired += outcome.retired;
        match outcome.stop {
            StopReason::BudgetExhausted => assert_eq!(outcome.retired, 7),
            StopReason::Terminated(code) => {
                assert_eq!(code, 55);
                break;
            }
            StopReason::Faulted(fault) => panic!("unexpected fault {fault}"),
        }
    }
    assert_eq!(retired, total);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn any_split_matches_an_uninterrupted_run(
        limits in prop::collection::vec(0u64..40, 1..12)
    ) {
        let image = samples::sum_to(20).unwrap();
        let (reference, whole) = run(&image, RunRequest::new());

        let mut split = emulator(&image);
        let mut retired = 0;
        for limit in &limits {
            retired += split.start(RunRequest::new().with_instruction_limit(*limit)).retired;
        }
        let rest = split.start(RunRequest::new());
        retired += rest.retired;

        prop_assert_eq!(rest.stop, whole.stop);
        prop_assert_eq!(retired, whole.retired);
        prop_assert_eq!(split.process(), reference.process());
    }

    #[test]
    fn budget_is_never_exceeded(limit in 1u64..200) {
        let image = samples::sum_to(20).unwrap();
        let (emulator, outcome) = run(&image, RunRequest::new().with_instruction_limit(limit));
        prop_assert!(outcome.retired <= limit);
        if outcome.stop == StopReason::BudgetExhausted {
            prop_assert_eq!(outcome.retired, limit);
            prop_assert_eq!(emulator.process().termination(), Termination::Running);
        }
    }
}

#[test]
fn terminal_process_is_left_untouched() {
    let (mut emulator, first) = run(&samples::terminate(3).unwrap(), RunRequest::new());
    let snapshot = emulator.process().clone();
    for request in [
        RunRequest::new(),
        RunRequest::new().with_instruction_limit(10),
        RunRequest::new().with_args(["late"]),
    ] {
        let again = emulator.start(request);
        assert_eq!(again.retired, 0);
        assert_eq!(again.stop, first.stop);
    }
    assert_eq!(emulator.process(), &snapshot);
}

#[test]
fn arguments_reach_the_entry_point() {
    let image = samples::argument_length().unwrap();
    let (emulator, outcome) = run(&image, RunRequest::new().with_args(["prog.exe", "abc"]));
    assert_eq!(outcome.stop, StopReason::Terminated(12));

    let address = emulator.process().command_line().unwrap();
    let mut raw = [0u8; 26];
    emulator.process().memory().read(address, &mut raw).unwrap();
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    assert_eq!(String::from_utf16(&units[..12]).unwrap(), "prog.exe abc");
    assert_eq!(units[12], 0);
}

#[test]
fn arguments_are_staged_by_the_first_executing_call_only() {
    let image = samples::argument_length().unwrap();
    let mut emulator = emulator(&image);

    let idle = emulator.start(RunRequest::new().with_instruction_limit(0).with_args(["x"]));
    assert_eq!(idle.stop, StopReason::BudgetExhausted);
    assert!(!emulator.process().is_started());
    assert_eq!(emulator.process().command_line(), None);

    emulator.start(RunRequest::new().with_instruction_limit(1).with_args(["ab"]));
    assert!(emulator.process().is_started());
    let outcome = emulator.start(RunRequest::new().with_args(["ignored-now"]));
    assert_eq!(outcome.stop, StopReason::Terminated(2));
}

#[test]
fn without_arguments_the_guest_sees_zero_length() {
    let (_, outcome) = run(&samples::argument_length().unwrap(), RunRequest::new());
    assert_eq!(outcome.stop, StopReason::Terminated(0));
}

#[rstest]
#[case::breakpoint(samples::breakpoint().unwrap(), FaultCode::Breakpoint, ENTRY + 1, None, 1)]
#[case::write_to_code(
    samples::write_to_code().unwrap(),
    FaultCode::WriteViolation,
    ENTRY + 7,
    Some(ENTRY),
    1
)]
#[case::divide_by_zero(
    samples::divide_by_zero().unwrap(),
    FaultCode::DivideError,
    ENTRY + 8,
    None,
    3
)]
#[case::unsupported_syscall(
    samples::unsupported_syscall(0x1FF).unwrap(),
    FaultCode::UnsupportedSyscall,
    ENTRY + 5,
    Some(0x1FF),
    2
)]
fn faults_are_precise_and_latched(
    #[case] image: Vec<u8>,
    #[case] code: FaultCode,
    #[case] rip: u64,
    #[case] detail: Option<u64>,
    #[case] retired: u64,
) {
    let (mut emulator, outcome) = run(&image, RunRequest::new());
    let StopReason::Faulted(fault) = outcome.stop else {
        panic!("expected a fault, got {:?}", outcome.stop);
    };
    assert_eq!(fault.code, code);
    assert_eq!(fault.rip, rip);
    assert_eq!(fault.detail, detail);
    assert_eq!(outcome.retired, retired);
    assert_eq!(emulator.process().fault(), Some(fault));

    if code != FaultCode::UnsupportedSyscall {
        // The faulting instruction did not retire.
        assert_eq!(emulator.process().registers().rip(), rip);
    }
    let again = emulator.start(RunRequest::new());
    assert_eq!(again, RunOutcome { retired: 0, stop: outcome.stop });
}

#[test]
fn write_fault_leaves_code_unmodified() {
    let image = samples::write_to_code().unwrap();
    let (emulator, _) = run(&image, RunRequest::new());
    let memory = emulator.process().memory();
    // lea rax, [rip - 7]
    assert_eq!(memory.read_u8(ENTRY), Ok(0x48));
    assert_eq!(memory.read_u8(ENTRY + 1), Ok(0x8D));
}

#[test]
fn shared_trace_sink_sees_every_event_in_order() {
    let shared = Arc::new(Mutex::new(Vec::<TraceEvent>::new()));
    let mut emulator = emulator(&samples::return_code(5).unwrap());
    emulator.set_trace_sink(Box::new(Arc::clone(&shared)));
    let outcome = emulator.start(RunRequest::new());
    assert_eq!(outcome.stop, StopReason::Terminated(5));

    let events = shared.lock().unwrap();
    let retired: Vec<u64> = events
        .iter()
        .filter_map(|event| match event {
            TraceEvent::InstructionRetired { rip } => Some(*rip),
            _ => None,
        })
        .collect();
    assert_eq!(retired.len() as u64, outcome.retired);
    assert_eq!(retired[0], ENTRY);
    assert_eq!(retired[1], ENTRY + 5);
    assert_eq!(
        events.last(),
        Some(&TraceEvent::SyscallDispatched { number: 0x2C })
    );
    drop(events);

    assert!(emulator.take_trace_sink().is_some());
    assert!(emulator.take_trace_sink().is_none());
}

#[test]
fn stack_size_override_is_clamped_and_used() {
    let image = samples::return_code(0).unwrap();
    let config = EmulatorConfig {
        stack_size: Some(0x2_0000),
        ..quiet()
    };
    let emulator = WindowsEmulator::from_image_bytes(
        "prog.exe",
        &image,
        config,
        X64Interpreter::new(),
        NtKernel::default(),
    )
    .unwrap();
    let layout = emulator.process().layout().unwrap();
    assert_eq!(layout.stack_base - layout.stack_limit, 0x2_0000);
    assert_eq!(emulator.process().registers().gs_base(), layout.teb);
}

#[test]
fn dll_without_entry_point_cannot_run() {
    let image = samples::math_library(winemu_image::DEFAULT_DLL_BASE).unwrap();
    let error = WindowsEmulator::from_image_bytes(
        "mathlib.dll",
        &image,
        quiet(),
        X64Interpreter::new(),
        NtKernel::default(),
    )
    .unwrap_err();
    assert!(matches!(
        error,
        winemu_core::EmulatorError::MissingEntryPoint { ref module } if module == "mathlib.dll"
    ));
}

/// Answers service `0x1FF` itself and hands everything else to the kernel.
#[derive(Default)]
struct Extended {
    kernel: NtKernel,
    calls: Vec<u32>,
}

impl SyscallHandler for Extended {
    fn handle(
        &mut self,
        number: u32,
        regs: &mut RegisterFile,
        memory: &mut AddressSpace,
    ) -> Result<SyscallOutcome, SyscallError> {
        self.calls.push(number);
        if number == 0x1FF {
            regs.set_gpr(GeneralRegister::Rax, 9);
            return Ok(SyscallOutcome::Continue);
        }
        self.kernel.handle(number, regs, memory)
    }
}

#[test]
fn custom_syscall_collaborator_extends_the_kernel() {
    let image = samples::unsupported_syscall(0x1FF).unwrap();
    let mut emulator = WindowsEmulator::from_image_bytes(
        "prog.exe",
        &image,
        quiet(),
        X64Interpreter::new(),
        Extended::default(),
    )
    .unwrap();
    let outcome = emulator.start(RunRequest::new());
    assert_eq!(outcome.stop, StopReason::Terminated(9));
    assert_eq!(outcome.retired, 3 + EXIT_STUB_INSTRUCTIONS);
}

#[test]
fn emulators_on_separate_threads_are_independent() {
    let handles: Vec<_> = (1..=4u32)
        .map(|n| {
            thread::spawn(move || {
                let image = samples::sum_to(n * 10).unwrap();
                let (_, outcome) = run(&image, RunRequest::new());
                outcome.stop
            })
        })
        .collect();
    let stops: Vec<StopReason> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(
        stops,
        vec![
            StopReason::Terminated(55),
            StopReason::Terminated(210),
            StopReason::Terminated(465),
            StopReason::Terminated(820),
        ]
    );
}

#[test]
fn silenced_logger_does_not_affect_execution() {
    let image = samples::sum_to(5).unwrap();
    let mut loud = WindowsEmulator::from_image_bytes(
        "prog.exe",
        &image,
        EmulatorConfig::default(),
        X64Interpreter::new(),
        NtKernel::default(),
    )
    .unwrap();
    assert!(loud.logger().is_enabled());
    let mut quiet = emulator(&image);
    assert!(!quiet.logger().is_enabled());
    assert_eq!(loud.start(RunRequest::new()), quiet.start(RunRequest::new()));
    loud.logger_mut().disable_output(true);
    assert!(!loud.logger().is_enabled());
}

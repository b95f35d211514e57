//! Instruction-budgeted run loop.
//!
//! Every call to [`ExecutionEngine::run`] retires whole instructions only.
//! Splitting a run into sessions with limits `L1..Ln` leaves the process in
//! the same state as one run with `L1 + .. + Ln`, because:
//!
//! * the budget is checked between instructions, never inside one;
//! * an instruction that traps into a syscall counts once, and the syscall's
//!   effects are applied before the next budget check;
//! * a faulting instruction does not retire, does not count and leaves `RIP`
//!   at itself.

use crate::api::{RunOutcome, RunRequest, StopReason, TraceEvent, TraceSink};
use crate::cpu::{CpuBackend, CpuStep};
use crate::logger::Logger;
use crate::process::ProcessContext;
use crate::state::{GeneralRegister, Termination};
use crate::syscall::{SyscallError, SyscallHandler, SyscallOutcome};
use crate::{Fault, FaultCode};

/// Stop reason matching a terminal process state.
const fn terminal_stop(termination: Termination) -> Option<StopReason> {
    match termination {
        Termination::Running => None,
        Termination::Terminated(code) => Some(StopReason::Terminated(code)),
        Termination::Faulted(fault) => Some(StopReason::Faulted(fault)),
    }
}

/// Drives a CPU backend and a syscall collaborator over a process.
#[derive(Debug, Clone, Default)]
pub struct ExecutionEngine<B, S> {
    backend: B,
    syscalls: S,
}

impl<B: CpuBackend, S: SyscallHandler> ExecutionEngine<B, S> {
    /// Creates an engine from its two collaborators.
    pub const fn new(backend: B, syscalls: S) -> Self {
        Self { backend, syscalls }
    }

    /// CPU backend.
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// Syscall collaborator.
    pub const fn syscalls(&self) -> &S {
        &self.syscalls
    }

    /// Runs `process` until it terminates, faults or retires
    /// `request.instruction_limit()` instructions.
    ///
    /// A terminated or faulted process is left untouched and the terminal
    /// outcome is reported with `retired == 0`.
    pub fn run(
        &mut self,
        process: &mut ProcessContext,
        request: &RunRequest,
        logger: &Logger,
        trace: &mut dyn TraceSink,
    ) -> RunOutcome {
        if let Some(stop) = terminal_stop(process.termination) {
            return RunOutcome { retired: 0, stop };
        }

        let limit = request.instruction_limit();
        if limit != Some(0) && !process.started {
            process.started = true;
            if let Some(args) = request.args() {
                if let Err(error) = process.stage_arguments(args) {
                    logger.warn(format_args!("cannot stage command line: {error}"));
                    let fault = error.at(process.registers.rip());
                    Self::latch(process, fault, logger, trace);
                }
            }
        }

        let mut retired = 0u64;
        let stop = loop {
            if let Some(stop) = terminal_stop(process.termination) {
                break stop;
            }
            if limit.is_some_and(|limit| retired >= limit) {
                break StopReason::BudgetExhausted;
            }
            if self.step_one(process, logger, trace) {
                retired += 1;
            }
        };

        logger.debug(format_args!(
            "run stopped after {retired} instructions ({} total): {stop}",
            process.executed_instructions
        ));
        RunOutcome { retired, stop }
    }

    /// Executes one instruction together with the syscall it traps into.
    ///
    /// Returns `true` when the instruction retired. Does nothing and returns
    /// `false` for a terminal process.
    pub fn step_one(
        &mut self,
        process: &mut ProcessContext,
        logger: &Logger,
        trace: &mut dyn TraceSink,
    ) -> bool {
        if process.termination.is_terminal() {
            return false;
        }

        let rip = process.registers.rip();
        match self
            .backend
            .step(&mut process.registers, &mut process.memory)
        {
            CpuStep::Retired => {
                process.executed_instructions += 1;
                trace.on_event(TraceEvent::InstructionRetired { rip });
                true
            }
            CpuStep::SyscallTrap => {
                process.executed_instructions += 1;
                trace.on_event(TraceEvent::InstructionRetired { rip });
                self.dispatch_syscall(process, rip, logger, trace);
                true
            }
            CpuStep::Fault(fault) => {
                Self::latch(process, fault, logger, trace);
                false
            }
        }
    }

    fn dispatch_syscall(
        &mut self,
        process: &mut ProcessContext,
        rip: u64,
        logger: &Logger,
        trace: &mut dyn TraceSink,
    ) {
        #[allow(clippy::cast_possible_truncation)]
        let number = process.registers.gpr(GeneralRegister::Rax) as u32;
        trace.on_event(TraceEvent::SyscallDispatched { number });
        logger.debug(format_args!("syscall {number:#x} at {rip:#x}"));

        match self
            .syscalls
            .handle(number, &mut process.registers, &mut process.memory)
        {
            Ok(SyscallOutcome::Continue) => {}
            Ok(SyscallOutcome::Exit(code)) => {
                process.termination = Termination::Terminated(code);
                logger.info(format_args!(
                    "process exited with code {code} after {} instructions",
                    process.executed_instructions
                ));
            }
            Err(SyscallError::Unsupported { number }) => {
                let fault =
                    Fault::with_detail(FaultCode::UnsupportedSyscall, rip, u64::from(number));
                Self::latch(process, fault, logger, trace);
            }
            Err(SyscallError::Memory(error)) => {
                Self::latch(process, error.at(rip), logger, trace);
            }
        }
    }

    fn latch(
        process: &mut ProcessContext,
        fault: Fault,
        logger: &Logger,
        trace: &mut dyn TraceSink,
    ) {
        process.termination = Termination::Faulted(fault);
        trace.on_event(TraceEvent::FaultRaised { fault });
        logger.warn(format_args!(
            "{fault}{} after {} instructions",
            fault
                .detail
                .map_or_else(String::new, |detail| format!(" (detail {detail:#x})")),
            process.executed_instructions
        ));
    }
}

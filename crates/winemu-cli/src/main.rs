//! Entry point for the winemu runner.
//!
//! 1. Parse the command line with `clap`.
//! 2. Install a `tracing` subscriber honouring `RUST_LOG` or `--log-level`.
//! 3. Map the image and its dependencies, then run it under the optional
//!    instruction limit.
//! 4. Report the outcome and mirror the guest's exit code.
//!
//! Error handling is done via `anyhow`.

mod config;

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use winemu_core::{
    disassemble, RunOutcome, RunRequest, StopReason, TraceEvent, TraceSink, WindowsEmulator,
};

use crate::config::Config;

#[cfg(test)]
use tempfile as _;
#[cfg(test)]
use winemu_image as _;

/// Exit code for a suspended (budget-exhausted) run.
const SUSPENDED: u8 = 3;

/// Writes trace events to stderr as they happen.
struct TracePrinter;

impl TraceSink for TracePrinter {
    fn on_event(&mut self, event: TraceEvent) {
        match event {
            TraceEvent::InstructionRetired { rip } => eprintln!("retired {rip:#x}"),
            TraceEvent::SyscallDispatched { number } => eprintln!("syscall {number:#x}"),
            TraceEvent::FaultRaised { fault } => eprintln!("fault   {fault}"),
        }
    }
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(config: &Config) -> Result<(RunOutcome, WindowsEmulator)> {
    let mut emulator = WindowsEmulator::with_config(&config.image, config.emulator_config())
        .with_context(|| format!("failed to load {}", config.image.display()))?;
    if config.trace {
        emulator.set_trace_sink(Box::new(TracePrinter));
    }

    let mut request = RunRequest::new().with_args(config.guest_args());
    if let Some(limit) = config.instruction_limit {
        request = request.with_instruction_limit(limit);
    }
    let outcome = emulator.start(request);
    tracing::debug!(retired = outcome.retired, "run finished");
    Ok((outcome, emulator))
}

fn report(outcome: &RunOutcome, emulator: &WindowsEmulator) -> ExitCode {
    let process = emulator.process();
    let executed = process.executed_instructions();
    match outcome.stop {
        StopReason::Terminated(code) => {
            println!("exited with code {code} after {executed} instructions");
            // Windows exit codes are 32-bit; the host keeps the low byte.
            ExitCode::from(code.to_le_bytes()[0])
        }
        StopReason::BudgetExhausted => {
            println!(
                "suspended after {executed} instructions at rip {:#x}",
                process.registers().rip()
            );
            ExitCode::from(SUSPENDED)
        }
        StopReason::Faulted(fault) => {
            println!("{fault} after {executed} instructions");
            if let Some(detail) = fault.detail {
                println!("  detail: {detail:#x}");
            }
            if let Some(text) = disassemble(process.memory(), fault.rip) {
                println!("  {:#x}: {text}", fault.rip);
            }
            if let Some(module) = process.modules().containing(fault.rip) {
                println!(
                    "  in {} at rva {:#x}",
                    module.name(),
                    fault.rip - module.image_base()
                );
            }
            ExitCode::FAILURE
        }
    }
}

fn main() -> ExitCode {
    let config = Config::parse();
    init_logging(&config);

    match run(&config) {
        Ok((outcome, emulator)) => report(&outcome, &emulator),
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::FAILURE
        }
    }
}

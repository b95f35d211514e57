//! Windows PE emulation core.
//!
//! The crate maps a 64-bit PE image and its dependencies into an emulated
//! address space and runs it on a virtual x64 CPU under an instruction
//! budget. Runs can be split into sessions at any instruction boundary;
//! the result is the same as one uninterrupted run.
//!
//! ```no_run
//! use winemu_core::{RunRequest, StopReason, WindowsEmulator};
//!
//! let mut emulator = WindowsEmulator::new("prog.exe")?;
//! let first = emulator.start(RunRequest::new().with_instruction_limit(1_000));
//! if first.stop == StopReason::BudgetExhausted {
//!     emulator.start(RunRequest::new());
//! }
//! println!("{:?}", emulator.process().termination());
//! # Ok::<(), winemu_core::EmulatorError>(())
//! ```

/// Configuration, run requests, outcomes and trace hooks.
pub mod api;
pub use api::{
    EmulatorConfig, RunOutcome, RunRequest, StopReason, TraceEvent, TraceSink, MAX_STACK_SIZE,
    MIN_STACK_SIZE,
};

/// CPU backend contract and the built-in interpreter.
pub mod cpu;
pub use cpu::{disassemble, CpuBackend, CpuStep, X64Interpreter, MAX_INSTRUCTION_LEN};

/// Facade composing mapper, process setup and engine.
pub mod emulator;
pub use emulator::{EmulatorError, WindowsEmulator};

/// Instruction-budgeted run loop.
pub mod engine;
pub use engine::ExecutionEngine;

/// Execution fault taxonomy.
pub mod fault;
pub use fault::{Fault, FaultClass, FaultCode};

/// Per-instance diagnostic output.
pub mod logger;
pub use logger::Logger;

/// PE32+ module mapper.
pub mod mapper;
pub use mapper::{
    ExportTable, ExportTarget, ImportBinding, ImportSymbol, MapError, MappedBinary,
    MapperConfig, ModuleMapper, ModuleTable, Section,
};

/// Emulated address space.
pub mod memory;
pub use memory::{AccessKind, AddressSpace, MemoryError, Permissions, RegionInfo};

/// Process context and initial process layout.
pub mod process;
pub use process::{ProcessContext, ProcessLayout, ProcessParams};

/// Guest register file and lifecycle state.
pub mod state;
pub use state::{GeneralRegister, RegisterFile, Termination};

/// Syscall collaborator contract and the minimal NT kernel.
pub mod syscall;
pub use syscall::{NtKernel, SyscallError, SyscallHandler, SyscallNumbers, SyscallOutcome};

#[cfg(test)]
use proptest as _;
#[cfg(test)]
use tempfile as _;
#[cfg(test)]
use winemu_image as _;

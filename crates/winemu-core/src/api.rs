//! Caller-facing configuration, run requests and run outcomes.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::mapper::MapperConfig;
use crate::syscall::SyscallNumbers;
use crate::Fault;

/// Smallest stack the process setup will reserve.
pub const MIN_STACK_SIZE: u64 = 0x1_0000;
/// Largest stack the process setup will reserve.
pub const MAX_STACK_SIZE: u64 = 0x100_0000;

/// Top-level configuration for one emulator instance.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct EmulatorConfig {
    /// Dependency search behaviour.
    pub mapper: MapperConfig,
    /// Stack reserve override; defaults to the image's `SizeOfStackReserve`.
    /// Clamped to [`MIN_STACK_SIZE`]..=[`MAX_STACK_SIZE`].
    pub stack_size: Option<u64>,
    /// Service numbers used by the built-in kernel and the exit stub.
    pub syscalls: SyscallNumbers,
    /// Forwards diagnostic events to `tracing` when `true`.
    pub log_output: bool,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            mapper: MapperConfig::default(),
            stack_size: None,
            syscalls: SyscallNumbers::default(),
            log_output: true,
        }
    }
}

/// Parameters of one `start` call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct RunRequest {
    args: Option<Vec<String>>,
    instruction_limit: Option<u64>,
}

impl RunRequest {
    /// Request without arguments or limit: run to termination or fault.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            args: None,
            instruction_limit: None,
        }
    }

    /// Sets the command-line arguments handed to the guest on its first run.
    #[must_use]
    pub fn with_args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        self.args = Some(args.into_iter().map(Into::into).collect());
        self
    }

    /// Caps the number of instructions retired by this call.
    #[must_use]
    pub const fn with_instruction_limit(mut self, limit: u64) -> Self {
        self.instruction_limit = Some(limit);
        self
    }

    /// Arguments, when set.
    #[must_use]
    pub fn args(&self) -> Option<&[String]> {
        self.args.as_deref()
    }

    /// Instruction limit, when set.
    #[must_use]
    pub const fn instruction_limit(&self) -> Option<u64> {
        self.instruction_limit
    }
}

/// Why a run call returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum StopReason {
    /// The instruction limit was reached; the process can be resumed.
    BudgetExhausted,
    /// The guest exited with this code.
    Terminated(u32),
    /// Execution stopped on a fault.
    Faulted(Fault),
}

impl StopReason {
    /// Returns `true` when no further instruction can run.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::BudgetExhausted)
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BudgetExhausted => f.write_str("instruction budget exhausted"),
            Self::Terminated(code) => write!(f, "terminated with exit code {code}"),
            Self::Faulted(fault) => write!(f, "faulted: {fault}"),
        }
    }
}

/// Result of one run call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct RunOutcome {
    /// Instructions retired during this call.
    pub retired: u64,
    /// Why the call returned.
    pub stop: StopReason,
}

/// Execution events, emitted in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceEvent {
    /// An instruction retired.
    InstructionRetired {
        /// Address of the retired instruction.
        rip: u64,
    },
    /// A trapped syscall was handed to the collaborator.
    SyscallDispatched {
        /// Service number from `EAX`.
        number: u32,
    },
    /// Execution faulted.
    FaultRaised {
        /// The latched fault.
        fault: Fault,
    },
}

/// Receiver of [`TraceEvent`]s.
pub trait TraceSink {
    /// Records an event in execution order.
    fn on_event(&mut self, event: TraceEvent);
}

/// Discards every event.
impl TraceSink for () {
    fn on_event(&mut self, _event: TraceEvent) {}
}

impl TraceSink for Vec<TraceEvent> {
    fn on_event(&mut self, event: TraceEvent) {
        self.push(event);
    }
}

/// Shared sink, so the caller can inspect events while the emulator owns a
/// handle. Events are dropped if the lock is poisoned.
impl<T: TraceSink> TraceSink for Arc<Mutex<T>> {
    fn on_event(&mut self, event: TraceEvent) {
        if let Ok(mut sink) = self.lock() {
            sink.on_event(event);
        }
    }
}

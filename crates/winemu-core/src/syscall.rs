//! Syscall collaborator contract and the built-in minimal NT kernel.
//!
//! x64 Windows convention: the service number is in `EAX`, arguments in
//! `R10, RDX, R8, R9`, and the `NTSTATUS` result is returned in `RAX`.

use thiserror::Error;

use crate::memory::{AddressSpace, MemoryError};
use crate::state::{GeneralRegister, RegisterFile};

/// `STATUS_SUCCESS`.
pub const STATUS_SUCCESS: u32 = 0;
/// `STATUS_INVALID_HANDLE`.
pub const STATUS_INVALID_HANDLE: u32 = 0xC000_0008;

/// Pseudo-handle naming the current process.
const CURRENT_PROCESS: u64 = u64::MAX;

/// What the engine does after a syscall was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyscallOutcome {
    /// Resume at the instruction after `syscall`.
    Continue,
    /// The process exits with this code.
    Exit(u32),
}

/// Syscall handling failure; terminal for the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SyscallError {
    /// The collaborator does not implement this service number.
    #[error("unsupported syscall {number:#x}")]
    Unsupported {
        /// Service number from `EAX`.
        number: u32,
    },
    /// A guest buffer passed to the service could not be accessed.
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// Services trapped `syscall` instructions.
///
/// Called once per trap, after the trapping instruction retired. Must not
/// retire guest instructions itself.
pub trait SyscallHandler {
    /// Handles service `number` with the guest's registers and memory.
    ///
    /// # Errors
    ///
    /// Returns [`SyscallError::Unsupported`] for unknown services and
    /// [`SyscallError::Memory`] when a guest buffer is inaccessible.
    fn handle(
        &mut self,
        number: u32,
        regs: &mut RegisterFile,
        memory: &mut AddressSpace,
    ) -> Result<SyscallOutcome, SyscallError>;
}

/// Service numbers understood by [`NtKernel`].
///
/// Defaults are the Windows 10 x64 values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct SyscallNumbers {
    /// `NtClose`.
    pub close: u32,
    /// `NtTerminateProcess`.
    pub terminate_process: u32,
    /// `NtDelayExecution`.
    pub delay_execution: u32,
    /// `NtYieldExecution`.
    pub yield_execution: u32,
}

impl Default for SyscallNumbers {
    fn default() -> Self {
        Self {
            close: 0x0F,
            terminate_process: 0x2C,
            delay_execution: 0x34,
            yield_execution: 0x46,
        }
    }
}

/// Minimal kernel: process termination plus a few services that only need
/// to report success.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NtKernel {
    numbers: SyscallNumbers,
}

impl NtKernel {
    /// Creates a kernel answering the given service numbers.
    #[must_use]
    pub const fn new(numbers: SyscallNumbers) -> Self {
        Self { numbers }
    }

    /// Service numbers in use.
    #[must_use]
    pub const fn numbers(&self) -> SyscallNumbers {
        self.numbers
    }

    fn terminate_process(regs: &mut RegisterFile) -> SyscallOutcome {
        let handle = regs.gpr(GeneralRegister::R10);
        #[allow(clippy::cast_possible_truncation)]
        let status = regs.gpr(GeneralRegister::Rdx) as u32;
        match handle {
            CURRENT_PROCESS => SyscallOutcome::Exit(status),
            // Handle 0 terminates every other thread; there are none.
            0 => {
                set_status(regs, STATUS_SUCCESS);
                SyscallOutcome::Continue
            }
            _ => {
                set_status(regs, STATUS_INVALID_HANDLE);
                SyscallOutcome::Continue
            }
        }
    }
}

fn set_status(regs: &mut RegisterFile, status: u32) {
    regs.set_gpr(GeneralRegister::Rax, u64::from(status));
}

impl SyscallHandler for NtKernel {
    fn handle(
        &mut self,
        number: u32,
        regs: &mut RegisterFile,
        _memory: &mut AddressSpace,
    ) -> Result<SyscallOutcome, SyscallError> {
        let numbers = self.numbers;
        if number == numbers.terminate_process {
            return Ok(Self::terminate_process(regs));
        }
        if number == numbers.close
            || number == numbers.yield_execution
            || number == numbers.delay_execution
        {
            set_status(regs, STATUS_SUCCESS);
            return Ok(SyscallOutcome::Continue);
        }
        Err(SyscallError::Unsupported { number })
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::{
        NtKernel, SyscallError, SyscallHandler, SyscallNumbers, SyscallOutcome,
        STATUS_INVALID_HANDLE, STATUS_SUCCESS,
    };
    use crate::memory::AddressSpace;
    use crate::state::{GeneralRegister, RegisterFile};

    fn call(
        kernel: &mut NtKernel,
        number: u32,
        r10: u64,
        rdx: u64,
    ) -> (Result<SyscallOutcome, SyscallError>, RegisterFile) {
        let mut regs = RegisterFile::default();
        regs.set_gpr(GeneralRegister::Rax, 0xDEAD);
        regs.set_gpr(GeneralRegister::R10, r10);
        regs.set_gpr(GeneralRegister::Rdx, rdx);
        let mut memory = AddressSpace::new();
        let result = kernel.handle(number, &mut regs, &mut memory);
        (result, regs)
    }

    #[test]
    fn terminate_current_process_exits_with_status() {
        let (result, _) = call(&mut NtKernel::default(), 0x2C, u64::MAX, 42);
        assert_eq!(result, Ok(SyscallOutcome::Exit(42)));
    }

    #[rstest]
    #[case(0, STATUS_SUCCESS)]
    #[case(0x44, STATUS_INVALID_HANDLE)]
    fn terminate_other_handles_continue(#[case] handle: u64, #[case] status: u32) {
        let (result, regs) = call(&mut NtKernel::default(), 0x2C, handle, 7);
        assert_eq!(result, Ok(SyscallOutcome::Continue));
        assert_eq!(regs.gpr(GeneralRegister::Rax), u64::from(status));
    }

    #[rstest]
    #[case(0x0F)]
    #[case(0x34)]
    #[case(0x46)]
    fn trivial_services_report_success(#[case] number: u32) {
        let (result, regs) = call(&mut NtKernel::default(), number, 0, 0);
        assert_eq!(result, Ok(SyscallOutcome::Continue));
        assert_eq!(regs.gpr(GeneralRegister::Rax), 0);
    }

    #[test]
    fn unknown_service_is_unsupported() {
        let (result, regs) = call(&mut NtKernel::default(), 0x1234, 0, 0);
        assert_eq!(result, Err(SyscallError::Unsupported { number: 0x1234 }));
        assert_eq!(regs.gpr(GeneralRegister::Rax), 0xDEAD);
    }

    #[test]
    fn numbers_are_configurable() {
        let numbers = SyscallNumbers {
            terminate_process: 0x99,
            ..SyscallNumbers::default()
        };
        let mut kernel = NtKernel::new(numbers);
        assert_eq!(call(&mut kernel, 0x99, u64::MAX, 3).0, Ok(SyscallOutcome::Exit(3)));
        assert!(call(&mut kernel, 0x2C, u64::MAX, 3).0.is_err());
    }
}

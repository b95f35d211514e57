use thiserror::Error;

/// Fault classes used for reporting and policy decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum FaultClass {
    /// The backend could not decode or does not implement the instruction.
    Decode,
    /// An address-space access was unmapped or violated permissions.
    Memory,
    /// Arithmetic exception raised by the instruction itself.
    Arithmetic,
    /// Privileged or debug instruction executed in user mode.
    Privilege,
    /// The syscall collaborator rejected the trapped call.
    Syscall,
}

/// Stable execution-fault taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[repr(u8)]
pub enum FaultCode {
    /// Bytes at RIP do not form a valid x64 instruction (or `ud2`).
    #[error("illegal instruction")]
    IllegalInstruction = 0x01,
    /// Valid instruction outside the subset implemented by the backend.
    #[error("unsupported instruction")]
    UnsupportedInstruction = 0x02,
    /// Access to an address no region covers.
    #[error("access to unmapped memory")]
    UnmappedAccess = 0x03,
    /// Data read from a region without read permission.
    #[error("read from non-readable memory")]
    ReadViolation = 0x04,
    /// Data write to a region without write permission.
    #[error("write to non-writable memory")]
    WriteViolation = 0x05,
    /// Instruction fetch from a region without execute permission.
    #[error("instruction fetch from non-executable memory")]
    ExecuteViolation = 0x06,
    /// `hlt` and friends.
    #[error("privileged instruction")]
    PrivilegedInstruction = 0x07,
    /// `int3`.
    #[error("breakpoint")]
    Breakpoint = 0x08,
    /// Division by zero or quotient overflow.
    #[error("integer divide error")]
    DivideError = 0x09,
    /// Syscall number the collaborator does not implement.
    #[error("unsupported syscall")]
    UnsupportedSyscall = 0x0A,
}

impl FaultCode {
    /// Converts a fault code to its stable byte value.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Converts a stable byte value back into a fault code.
    #[must_use]
    pub const fn from_u8(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::IllegalInstruction),
            0x02 => Some(Self::UnsupportedInstruction),
            0x03 => Some(Self::UnmappedAccess),
            0x04 => Some(Self::ReadViolation),
            0x05 => Some(Self::WriteViolation),
            0x06 => Some(Self::ExecuteViolation),
            0x07 => Some(Self::PrivilegedInstruction),
            0x08 => Some(Self::Breakpoint),
            0x09 => Some(Self::DivideError),
            0x0A => Some(Self::UnsupportedSyscall),
            _ => None,
        }
    }

    /// Returns the reporting class for this fault code.
    #[must_use]
    pub const fn class(self) -> FaultClass {
        match self {
            Self::IllegalInstruction | Self::UnsupportedInstruction => FaultClass::Decode,
            Self::UnmappedAccess
            | Self::ReadViolation
            | Self::WriteViolation
            | Self::ExecuteViolation => FaultClass::Memory,
            Self::DivideError => FaultClass::Arithmetic,
            Self::PrivilegedInstruction | Self::Breakpoint => FaultClass::Privilege,
            Self::UnsupportedSyscall => FaultClass::Syscall,
        }
    }
}

/// A latched execution fault: what happened, where, and on what.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[error("{code} at rip {rip:#x}")]
pub struct Fault {
    /// Taxonomy code.
    pub code: FaultCode,
    /// Address of the faulting instruction.
    pub rip: u64,
    /// Faulting data address for memory faults, syscall number for
    /// [`FaultCode::UnsupportedSyscall`].
    pub detail: Option<u64>,
}

impl Fault {
    /// Creates a fault without detail payload.
    #[must_use]
    pub const fn new(code: FaultCode, rip: u64) -> Self {
        Self {
            code,
            rip,
            detail: None,
        }
    }

    /// Creates a fault carrying a detail payload.
    #[must_use]
    pub const fn with_detail(code: FaultCode, rip: u64, detail: u64) -> Self {
        Self {
            code,
            rip,
            detail: Some(detail),
        }
    }
}

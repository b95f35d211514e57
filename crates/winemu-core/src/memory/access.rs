//! Region permission model and access-failure reporting.

use bitflags::bitflags;
use thiserror::Error;

use crate::{Fault, FaultCode};

bitflags! {
    /// Read/write/execute permission set carried by every region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
    pub struct Permissions: u8 {
        /// Data reads allowed.
        const READ = 1 << 0;
        /// Data writes allowed.
        const WRITE = 1 << 1;
        /// Instruction fetch allowed.
        const EXECUTE = 1 << 2;
        /// Readable and writable.
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        /// Readable and executable.
        const READ_EXECUTE = Self::READ.bits() | Self::EXECUTE.bits();
    }
}

impl Permissions {
    /// Returns `true` when this set allows the given access.
    #[must_use]
    pub const fn allows(self, access: AccessKind) -> bool {
        match access {
            AccessKind::Read => self.contains(Self::READ),
            AccessKind::Write => self.contains(Self::WRITE),
            AccessKind::Execute => self.contains(Self::EXECUTE),
        }
    }
}

/// Kind of memory access being checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum AccessKind {
    /// Data read.
    Read,
    /// Data write.
    Write,
    /// Instruction fetch.
    Execute,
}

impl std::fmt::Display for AccessKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Execute => "execute",
        })
    }
}

/// Address-space operation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum MemoryError {
    /// No region covers the address.
    #[error("address {address:#x} is not mapped")]
    Unmapped {
        /// First uncovered address touched by the access.
        address: u64,
    },
    /// The covering region does not grant the access.
    #[error("{access} access denied at {address:#x}")]
    PermissionDenied {
        /// First address whose region denied the access.
        address: u64,
        /// Access that was attempted.
        access: AccessKind,
    },
    /// Requested range intersects an existing region.
    #[error("range {base:#x}+{size:#x} overlaps an existing region")]
    Overlap {
        /// Requested base.
        base: u64,
        /// Requested size.
        size: u64,
    },
    /// Zero-sized or address-wrapping range.
    #[error("invalid range {base:#x}+{size:#x}")]
    InvalidRange {
        /// Requested base.
        base: u64,
        /// Requested size.
        size: u64,
    },
    /// No free range of the requested size exists.
    #[error("no free range of {size:#x} bytes")]
    NoFreeRange {
        /// Requested size.
        size: u64,
    },
    /// `free` was given an address that is not the base of a region.
    #[error("{address:#x} is not the base of a region")]
    NotRegionBase {
        /// Address passed to `free`.
        address: u64,
    },
}

impl MemoryError {
    /// Maps an access failure to the execution-fault taxonomy.
    ///
    /// Returns the fault code together with the faulting data address when
    /// the error is an access failure, and `None` for allocation errors.
    #[must_use]
    pub const fn fault(self) -> Option<(FaultCode, u64)> {
        match self {
            Self::Unmapped { address } => Some((FaultCode::UnmappedAccess, address)),
            Self::PermissionDenied { address, access } => Some((
                match access {
                    AccessKind::Read => FaultCode::ReadViolation,
                    AccessKind::Write => FaultCode::WriteViolation,
                    AccessKind::Execute => FaultCode::ExecuteViolation,
                },
                address,
            )),
            Self::Overlap { .. }
            | Self::InvalidRange { .. }
            | Self::NoFreeRange { .. }
            | Self::NotRegionBase { .. } => None,
        }
    }

    /// Execution fault raised by the instruction at `rip` when it hits this
    /// error.
    #[must_use]
    pub const fn at(self, rip: u64) -> Fault {
        match self.fault() {
            Some((code, address)) => Fault::with_detail(code, rip, address),
            None => Fault::new(FaultCode::UnmappedAccess, rip),
        }
    }
}

use std::path::PathBuf;

use thiserror::Error;

use crate::memory::MemoryError;

/// Rejection of a mapping attempt.
///
/// Every variant leaves the address space and module table exactly as they
/// were before the call.
#[derive(Debug, Error)]
pub enum MapError {
    /// The image (or a dependency) could not be read from disk.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File that failed to read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Headers are malformed, truncated or describe another architecture.
    #[error("invalid image format: {0}")]
    InvalidFormat(String),
    /// Section table is out of bounds or self-overlapping.
    #[error("corrupt section table: {0}")]
    CorruptSections(String),
    /// Base relocation of a kind the mapper cannot apply.
    #[error("unsupported relocation type {kind} at rva {rva:#x}")]
    UnsupportedRelocation {
        /// Relocation type from the high nibble of the entry.
        kind: u16,
        /// Target RVA of the entry.
        rva: u32,
    },
    /// The preferred base is occupied and the image carries no relocations.
    #[error("image cannot move from preferred base {preferred_base:#x}: relocations stripped")]
    RelocationsStripped {
        /// Base the image was linked for.
        preferred_base: u64,
    },
    /// Structure the emulator rejects instead of mis-mapping.
    #[error("unsupported image feature: {0}")]
    UnsupportedFeature(&'static str),
    /// Dependency or symbol could not be located.
    #[error("unresolved import {module}!{symbol}")]
    UnresolvedImport {
        /// Dependency file name.
        module: String,
        /// Symbol name, or `#ordinal`.
        symbol: String,
    },
    /// Entry point does not fall inside an executable section.
    #[error("entry point {address:#x} is not inside an executable section")]
    InvalidEntryPoint {
        /// Absolute entry address after choosing the base.
        address: u64,
    },
    /// Address-space allocation failed while reserving the image.
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

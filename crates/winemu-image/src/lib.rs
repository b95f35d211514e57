//! PE32+ image writer and canned guest programs for exercising the emulator.
//!
//! Nothing here is checked in as a binary: tests build the images they need
//! with [`ImageBuilder`] and the [`samples`].

/// PE32+ serialisation.
pub mod builder;
pub use builder::{
    iat_slot, BuildError, ExportItem, ImageBuilder, ImportModule, ImportName, SectionSpec,
    DATA, DEFAULT_DLL_BASE, DEFAULT_EXE_BASE, RDATA, TEXT,
};

/// Sample programs assembled with `iced-x86`.
pub mod samples;

#[cfg(test)]
use tempfile as _;

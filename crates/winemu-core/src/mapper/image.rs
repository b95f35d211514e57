//! Descriptors produced by the mapper.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::memory::Permissions;

/// One mapped section.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct Section {
    /// Section name with trailing NULs removed.
    pub name: String,
    /// Absolute address of the first byte.
    pub virtual_address: u64,
    /// `VirtualSize` as declared.
    pub virtual_size: u64,
    /// Size of the backing region.
    pub mapped_size: u64,
    /// Region permissions derived from the section flags.
    pub permissions: Permissions,
}

/// Target of one export.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum ExportTarget {
    /// Code or data inside the exporting image.
    Rva(u32),
    /// Forwarder string such as `NTDLL.RtlAllocateHeap` or `NTDLL.#12`.
    Forwarder(String),
}

/// Export directory of a mapped module.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct ExportTable {
    names: BTreeMap<String, u32>,
    entries: BTreeMap<u32, ExportTarget>,
}

impl ExportTable {
    pub(crate) fn insert(&mut self, ordinal: u32, target: ExportTarget) {
        self.entries.insert(ordinal, target);
    }

    pub(crate) fn insert_name(&mut self, name: String, ordinal: u32) {
        self.names.insert(name, ordinal);
    }

    /// Looks up an export by name.
    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<&ExportTarget> {
        self.names
            .get(name)
            .and_then(|ordinal| self.entries.get(ordinal))
    }

    /// Looks up an export by biased ordinal.
    #[must_use]
    pub fn by_ordinal(&self, ordinal: u32) -> Option<&ExportTarget> {
        self.entries.get(&ordinal)
    }

    /// Exported names with their ordinals, in name order.
    pub fn names(&self) -> impl Iterator<Item = (&str, u32)> + '_ {
        self.names.iter().map(|(name, ordinal)| (name.as_str(), *ordinal))
    }

    /// Number of exported ordinals.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when nothing is exported.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// How an import names its symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum ImportSymbol {
    /// Import by name.
    Name(String),
    /// Import by ordinal.
    Ordinal(u16),
}

impl fmt::Display for ImportSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => f.write_str(name),
            Self::Ordinal(ordinal) => write!(f, "#{ordinal}"),
        }
    }
}

/// One resolved import slot.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct ImportBinding {
    /// Dependency file name as written in the import descriptor.
    pub module: String,
    /// Imported symbol.
    pub symbol: ImportSymbol,
    /// Absolute address of the IAT slot.
    pub iat_address: u64,
    /// Address written into the slot.
    pub resolved_address: u64,
}

/// A module projected into an address space. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedBinary {
    pub(crate) name: String,
    pub(crate) path: Option<PathBuf>,
    pub(crate) image_base: u64,
    pub(crate) preferred_base: u64,
    pub(crate) size_of_image: u64,
    pub(crate) entry_point: Option<u64>,
    pub(crate) sections: Vec<Section>,
    pub(crate) imports: Vec<ImportBinding>,
    pub(crate) exports: Arc<ExportTable>,
    pub(crate) is_dll: bool,
    pub(crate) stack_reserve: u64,
}

impl MappedBinary {
    /// File name the module was mapped under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// File the module was read from, when mapped from disk.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Base the image was actually loaded at.
    #[must_use]
    pub const fn image_base(&self) -> u64 {
        self.image_base
    }

    /// Base the image was linked for.
    #[must_use]
    pub const fn preferred_base(&self) -> u64 {
        self.preferred_base
    }

    /// `SizeOfImage`.
    #[must_use]
    pub const fn size_of_image(&self) -> u64 {
        self.size_of_image
    }

    /// Absolute entry address; `None` for a DLL without one.
    #[must_use]
    pub const fn entry_point(&self) -> Option<u64> {
        self.entry_point
    }

    /// Mapped sections in section-table order.
    #[must_use]
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// Resolved imports in descriptor order.
    #[must_use]
    pub fn imports(&self) -> &[ImportBinding] {
        &self.imports
    }

    /// Export directory.
    #[must_use]
    pub fn exports(&self) -> &ExportTable {
        &self.exports
    }

    /// Difference between the actual and the preferred base.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn relocation_delta(&self) -> i64 {
        self.image_base.wrapping_sub(self.preferred_base) as i64
    }

    /// Returns `true` for DLL images.
    #[must_use]
    pub const fn is_dll(&self) -> bool {
        self.is_dll
    }

    /// `SizeOfStackReserve`.
    #[must_use]
    pub const fn stack_reserve(&self) -> u64 {
        self.stack_reserve
    }

    /// Returns `true` when `addr` lies in `[image_base, image_base + size_of_image)`.
    #[must_use]
    pub const fn contains(&self, addr: u64) -> bool {
        addr >= self.image_base && addr - self.image_base < self.size_of_image
    }

    /// Absolute address of a named export that is not forwarded.
    #[must_use]
    pub fn export_address(&self, name: &str) -> Option<u64> {
        match self.exports.by_name(name)? {
            ExportTarget::Rva(rva) => Some(self.image_base + u64::from(*rva)),
            ExportTarget::Forwarder(_) => None,
        }
    }

    /// Section containing `addr`.
    #[must_use]
    pub fn section_at(&self, addr: u64) -> Option<&Section> {
        self.sections.iter().find(|section| {
            addr >= section.virtual_address
                && addr - section.virtual_address < section.mapped_size
        })
    }
}

/// Modules of one process: main image first, then dependencies in mapping
/// order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleTable {
    modules: Vec<Arc<MappedBinary>>,
}

impl ModuleTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mapped modules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Returns `true` when nothing is mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Iterates modules in mapping order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<MappedBinary>> + '_ {
        self.modules.iter()
    }

    /// Case-insensitive lookup by file name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&Arc<MappedBinary>> {
        self.modules
            .iter()
            .find(|module| module.name.eq_ignore_ascii_case(name))
    }

    /// Module whose image range contains `addr`.
    #[must_use]
    pub fn containing(&self, addr: u64) -> Option<&Arc<MappedBinary>> {
        self.modules.iter().find(|module| module.contains(addr))
    }

    pub(crate) fn push(&mut self, module: Arc<MappedBinary>) {
        self.modules.push(module);
    }

    pub(crate) fn truncate(&mut self, len: usize) {
        self.modules.truncate(len);
    }
}

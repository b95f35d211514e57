//! PE32+ image writer.
//!
//! The layout is explicit: every section, including the generated import,
//! export and relocation sections, is placed at the RVA the caller names.
//! Nothing is validated beyond what is needed to serialise, so tests can
//! produce images the mapper must reject.

use std::collections::BTreeMap;

use thiserror::Error;

/// Offset of the `PE\0\0` signature (`e_lfanew`).
pub const PE_OFFSET: usize = 0x80;
/// Offset of the COFF file header.
pub const COFF_OFFSET: usize = PE_OFFSET + 4;
/// Offset of the PE32+ optional header.
pub const OPTIONAL_HEADER_OFFSET: usize = COFF_OFFSET + 20;
/// Size of the PE32+ optional header with 16 data directories.
pub const OPTIONAL_HEADER_SIZE: usize = 240;
/// Offset of the first section header.
pub const SECTION_TABLE_OFFSET: usize = OPTIONAL_HEADER_OFFSET + OPTIONAL_HEADER_SIZE;
/// Size of one section header.
pub const SECTION_HEADER_SIZE: usize = 40;

/// Section alignment of every built image.
pub const SECTION_ALIGNMENT: u32 = 0x1000;
/// File alignment of every built image.
pub const FILE_ALIGNMENT: u32 = 0x200;

/// Preferred base of built executables.
pub const DEFAULT_EXE_BASE: u64 = 0x1_4000_0000;
/// Preferred base of built DLLs.
pub const DEFAULT_DLL_BASE: u64 = 0x1_8000_0000;

/// `IMAGE_SCN_CNT_CODE`.
pub const SCN_CNT_CODE: u32 = 0x0000_0020;
/// `IMAGE_SCN_CNT_INITIALIZED_DATA`.
pub const SCN_CNT_INITIALIZED_DATA: u32 = 0x0000_0040;
/// `IMAGE_SCN_MEM_DISCARDABLE`.
pub const SCN_MEM_DISCARDABLE: u32 = 0x0200_0000;
/// `IMAGE_SCN_MEM_EXECUTE`.
pub const SCN_MEM_EXECUTE: u32 = 0x2000_0000;
/// `IMAGE_SCN_MEM_READ`.
pub const SCN_MEM_READ: u32 = 0x4000_0000;
/// `IMAGE_SCN_MEM_WRITE`.
pub const SCN_MEM_WRITE: u32 = 0x8000_0000;

/// Flags of a code section.
pub const TEXT: u32 = SCN_CNT_CODE | SCN_MEM_EXECUTE | SCN_MEM_READ;
/// Flags of a read-only data section.
pub const RDATA: u32 = SCN_CNT_INITIALIZED_DATA | SCN_MEM_READ;
/// Flags of a writable data section.
pub const DATA: u32 = SCN_CNT_INITIALIZED_DATA | SCN_MEM_READ | SCN_MEM_WRITE;

/// Data directory indices.
pub mod directory {
    /// Export table.
    pub const EXPORT: usize = 0;
    /// Import table.
    pub const IMPORT: usize = 1;
    /// Base relocation table.
    pub const BASE_RELOC: usize = 5;
    /// TLS directory.
    pub const TLS: usize = 9;
    /// Import address table.
    pub const IAT: usize = 12;
    /// Delay-load import descriptors.
    pub const DELAY_IMPORT: usize = 13;
    /// CLR runtime header.
    pub const CLR: usize = 14;
}

/// `IMAGE_REL_BASED_ABSOLUTE`.
pub const REL_ABSOLUTE: u16 = 0;
/// `IMAGE_REL_BASED_HIGHLOW`.
pub const REL_HIGHLOW: u16 = 3;
/// `IMAGE_REL_BASED_DIR64`.
pub const REL_DIR64: u16 = 10;

const FILE_EXECUTABLE_IMAGE: u16 = 0x0002;
const FILE_LARGE_ADDRESS_AWARE: u16 = 0x0020;
const FILE_RELOCS_STRIPPED: u16 = 0x0001;
const FILE_DLL: u16 = 0x2000;
const DESCRIPTOR_SIZE: usize = 20;
const EXPORT_DIRECTORY_SIZE: usize = 40;
const ORDINAL_FLAG: u64 = 1 << 63;

/// Image serialisation failure.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Sample code failed to assemble.
    #[error("assembler error: {0}")]
    Assemble(#[from] iced_x86::IcedError),
    /// The requested layout cannot be written.
    #[error("invalid layout: {0}")]
    Layout(String),
}

/// One section with its initialised bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionSpec {
    /// Name, at most eight bytes.
    pub name: String,
    /// RVA; must be section-aligned.
    pub rva: u32,
    /// `Characteristics`.
    pub characteristics: u32,
    /// Raw bytes.
    pub data: Vec<u8>,
    /// `VirtualSize`; defaults to the data length.
    pub virtual_size: u32,
}

impl SectionSpec {
    /// Creates a section whose virtual size equals its data length.
    #[must_use]
    pub fn new(name: &str, rva: u32, characteristics: u32, data: Vec<u8>) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let virtual_size = data.len() as u32;
        Self {
            name: name.to_owned(),
            rva,
            characteristics,
            data,
            virtual_size,
        }
    }

    /// Overrides `VirtualSize` (zero-filled tail when larger than the data).
    #[must_use]
    pub const fn with_virtual_size(mut self, virtual_size: u32) -> Self {
        self.virtual_size = virtual_size;
        self
    }
}

/// Symbol imported from a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportName {
    /// By name.
    Name(String),
    /// By ordinal.
    Ordinal(u16),
}

/// Imports from one module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportModule {
    /// Dependency file name.
    pub name: String,
    /// Imported symbols, in IAT order.
    pub symbols: Vec<ImportName>,
}

impl ImportModule {
    /// Imports `symbols` by name from `name`.
    #[must_use]
    pub fn by_name(name: &str, symbols: &[&str]) -> Self {
        Self {
            name: name.to_owned(),
            symbols: symbols
                .iter()
                .map(|symbol| ImportName::Name((*symbol).to_owned()))
                .collect(),
        }
    }
}

/// One export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportItem {
    /// Code or data at `rva`, optionally named.
    Rva {
        /// Exported name; `None` exports by ordinal only.
        name: Option<String>,
        /// Target RVA.
        rva: u32,
    },
    /// Named forwarder to `target` (`MODULE.Symbol` or `MODULE.#N`).
    Forwarder {
        /// Exported name.
        name: String,
        /// Forwarder string.
        target: String,
    },
}

impl ExportItem {
    /// Named export of `rva`.
    #[must_use]
    pub fn named(name: &str, rva: u32) -> Self {
        Self::Rva {
            name: Some(name.to_owned()),
            rva,
        }
    }

    /// Named forwarder.
    #[must_use]
    pub fn forwarder(name: &str, target: &str) -> Self {
        Self::Forwarder {
            name: name.to_owned(),
            target: target.to_owned(),
        }
    }
}

#[derive(Debug, Clone)]
struct ImportSpec {
    rva: u32,
    modules: Vec<ImportModule>,
}

#[derive(Debug, Clone)]
struct ExportSpec {
    rva: u32,
    dll_name: String,
    ordinal_base: u32,
    items: Vec<ExportItem>,
}

#[derive(Debug, Clone)]
struct RelocSpec {
    rva: u32,
    entries: Vec<(u32, u16)>,
}

/// RVA of IAT slot `symbol` of `module` in an import section at
/// `import_rva` built from `modules`.
#[must_use]
pub fn iat_slot(import_rva: u32, modules: &[ImportModule], module: usize, symbol: usize) -> u32 {
    let preceding: usize = modules
        .iter()
        .take(module)
        .map(|m| m.symbols.len() + 1)
        .sum();
    #[allow(clippy::cast_possible_truncation)]
    let offset = ((preceding + symbol) * 8) as u32;
    import_rva + offset
}

/// Builder of PE32+ images.
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    image_base: u64,
    is_dll: bool,
    relocs_stripped: bool,
    entry_rva: u32,
    stack_reserve: u64,
    sections: Vec<SectionSpec>,
    imports: Option<ImportSpec>,
    exports: Option<ExportSpec>,
    relocations: Option<RelocSpec>,
    directories: BTreeMap<usize, (u32, u32)>,
}

impl ImageBuilder {
    fn with_kind(is_dll: bool, image_base: u64) -> Self {
        Self {
            image_base,
            is_dll,
            relocs_stripped: false,
            entry_rva: 0,
            stack_reserve: 0x10_0000,
            sections: Vec::new(),
            imports: None,
            exports: None,
            relocations: None,
            directories: BTreeMap::new(),
        }
    }

    /// Executable at [`DEFAULT_EXE_BASE`].
    #[must_use]
    pub fn executable() -> Self {
        Self::with_kind(false, DEFAULT_EXE_BASE)
    }

    /// DLL at [`DEFAULT_DLL_BASE`].
    #[must_use]
    pub fn dll() -> Self {
        Self::with_kind(true, DEFAULT_DLL_BASE)
    }

    /// Sets the preferred base.
    #[must_use]
    pub const fn image_base(mut self, base: u64) -> Self {
        self.image_base = base;
        self
    }

    /// Sets `AddressOfEntryPoint`.
    #[must_use]
    pub const fn entry(mut self, rva: u32) -> Self {
        self.entry_rva = rva;
        self
    }

    /// Sets `SizeOfStackReserve`.
    #[must_use]
    pub const fn stack_reserve(mut self, bytes: u64) -> Self {
        self.stack_reserve = bytes;
        self
    }

    /// Marks relocations stripped in the COFF characteristics.
    #[must_use]
    pub const fn relocs_stripped(mut self, stripped: bool) -> Self {
        self.relocs_stripped = stripped;
        self
    }

    /// Adds a section.
    #[must_use]
    pub fn section(mut self, section: SectionSpec) -> Self {
        self.sections.push(section);
        self
    }

    /// Generates an `.idata` section at `rva`. IAT slots lie at its start;
    /// see [`iat_slot`].
    #[must_use]
    pub fn imports(mut self, rva: u32, modules: Vec<ImportModule>) -> Self {
        self.imports = Some(ImportSpec { rva, modules });
        self
    }

    /// Generates an `.edata` section at `rva`. Ordinals start at 1 in item
    /// order.
    #[must_use]
    pub fn exports(mut self, rva: u32, dll_name: &str, items: Vec<ExportItem>) -> Self {
        self.exports = Some(ExportSpec {
            rva,
            dll_name: dll_name.to_owned(),
            ordinal_base: 1,
            items,
        });
        self
    }

    /// Generates a `.reloc` section at `rva` with `(target rva, kind)`
    /// entries.
    #[must_use]
    pub fn relocations(mut self, rva: u32, entries: Vec<(u32, u16)>) -> Self {
        self.relocations = Some(RelocSpec { rva, entries });
        self
    }

    /// Overrides data directory `index`.
    #[must_use]
    pub fn directory(mut self, index: usize, rva: u32, size: u32) -> Self {
        self.directories.insert(index, (rva, size));
        self
    }

    /// Serialises the image.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Layout`] for misaligned sections, overlong
    /// names, out-of-range directory indices or sizes beyond 32 bits.
    pub fn build(&self) -> Result<Vec<u8>, BuildError> {
        let mut sections = self.sections.clone();
        let mut directories: BTreeMap<usize, (u32, u32)> = BTreeMap::new();

        if let Some(spec) = &self.imports {
            let (data, import_dir, iat_dir) = build_imports(spec)?;
            directories.insert(directory::IMPORT, import_dir);
            directories.insert(directory::IAT, iat_dir);
            sections.push(SectionSpec::new(".idata", spec.rva, DATA, data));
        }
        if let Some(spec) = &self.exports {
            let data = build_exports(spec)?;
            directories.insert(directory::EXPORT, (spec.rva, len32(data.len())?));
            sections.push(SectionSpec::new(".edata", spec.rva, RDATA, data));
        }
        if let Some(spec) = &self.relocations {
            let data = build_relocations(&spec.entries)?;
            directories.insert(directory::BASE_RELOC, (spec.rva, len32(data.len())?));
            sections.push(SectionSpec::new(
                ".reloc",
                spec.rva,
                RDATA | SCN_MEM_DISCARDABLE,
                data,
            ));
        }
        directories.extend(self.directories.iter().map(|(k, v)| (*k, *v)));
        if directories.keys().any(|index| *index >= 16) {
            return Err(BuildError::Layout("data directory index beyond 15".into()));
        }

        for section in &sections {
            if section.rva % SECTION_ALIGNMENT != 0 {
                return Err(BuildError::Layout(format!(
                    "section {} at rva {:#x} is not section-aligned",
                    section.name, section.rva
                )));
            }
            if section.name.len() > 8 {
                return Err(BuildError::Layout(format!(
                    "section name {} is longer than 8 bytes",
                    section.name
                )));
            }
        }

        let table_end = SECTION_TABLE_OFFSET + SECTION_HEADER_SIZE * sections.len();
        let size_of_headers = align(len32(table_end)?, FILE_ALIGNMENT);
        let mut image_end = align(size_of_headers, SECTION_ALIGNMENT);
        let mut file = vec![0u8; size_of_headers as usize];
        let mut size_of_code = 0u32;
        let mut size_of_data = 0u32;
        let mut base_of_code = 0u32;

        for (index, section) in sections.iter().enumerate() {
            let raw_size = align(len32(section.data.len())?, FILE_ALIGNMENT);
            let raw_offset = if raw_size == 0 { 0 } else { len32(file.len())? };
            file.extend_from_slice(&section.data);
            file.resize(file.len() + (raw_size as usize - section.data.len()), 0);

            let span = section.virtual_size.max(raw_size);
            image_end = image_end.max(align(section.rva.saturating_add(span), SECTION_ALIGNMENT));
            if section.characteristics & SCN_CNT_CODE != 0 {
                size_of_code += raw_size;
                if base_of_code == 0 {
                    base_of_code = section.rva;
                }
            } else {
                size_of_data += raw_size;
            }

            let at = SECTION_TABLE_OFFSET + SECTION_HEADER_SIZE * index;
            let name = section.name.as_bytes();
            file[at..at + name.len()].copy_from_slice(name);
            put_u32(&mut file, at + 8, section.virtual_size);
            put_u32(&mut file, at + 12, section.rva);
            put_u32(&mut file, at + 16, raw_size);
            put_u32(&mut file, at + 20, raw_offset);
            put_u32(&mut file, at + 36, section.characteristics);
        }

        // DOS header.
        file[0..2].copy_from_slice(b"MZ");
        put_u32(&mut file, 0x3C, len32(PE_OFFSET)?);
        file[PE_OFFSET..PE_OFFSET + 4].copy_from_slice(b"PE\0\0");

        let mut characteristics = FILE_EXECUTABLE_IMAGE | FILE_LARGE_ADDRESS_AWARE;
        if self.is_dll {
            characteristics |= FILE_DLL;
        }
        if self.relocs_stripped {
            characteristics |= FILE_RELOCS_STRIPPED;
        }
        #[allow(clippy::cast_possible_truncation)]
        let section_count = sections.len() as u16;
        put_u16(&mut file, COFF_OFFSET, 0x8664);
        put_u16(&mut file, COFF_OFFSET + 2, section_count);
        #[allow(clippy::cast_possible_truncation)]
        put_u16(&mut file, COFF_OFFSET + 16, OPTIONAL_HEADER_SIZE as u16);
        put_u16(&mut file, COFF_OFFSET + 18, characteristics);

        let opt = OPTIONAL_HEADER_OFFSET;
        put_u16(&mut file, opt, 0x20B);
        file[opt + 2] = 14;
        put_u32(&mut file, opt + 4, size_of_code);
        put_u32(&mut file, opt + 8, size_of_data);
        put_u32(&mut file, opt + 16, self.entry_rva);
        put_u32(&mut file, opt + 20, base_of_code);
        put_u64(&mut file, opt + 24, self.image_base);
        put_u32(&mut file, opt + 32, SECTION_ALIGNMENT);
        put_u32(&mut file, opt + 36, FILE_ALIGNMENT);
        put_u16(&mut file, opt + 40, 6);
        put_u16(&mut file, opt + 48, 6);
        put_u32(&mut file, opt + 56, image_end);
        put_u32(&mut file, opt + 60, size_of_headers);
        put_u16(&mut file, opt + 68, 3);
        put_u16(&mut file, opt + 70, 0x8160);
        put_u64(&mut file, opt + 72, self.stack_reserve);
        put_u64(&mut file, opt + 80, 0x1000);
        put_u64(&mut file, opt + 88, 0x10_0000);
        put_u64(&mut file, opt + 96, 0x1000);
        put_u32(&mut file, opt + 108, 16);
        for (index, (rva, size)) in &directories {
            let at = opt + 112 + index * 8;
            put_u32(&mut file, at, *rva);
            put_u32(&mut file, at + 4, *size);
        }

        Ok(file)
    }
}

fn build_imports(spec: &ImportSpec) -> Result<(Vec<u8>, (u32, u32), (u32, u32)), BuildError> {
    let slots: usize = spec.modules.iter().map(|m| m.symbols.len() + 1).sum();
    let iat_len = slots * 8;
    let descriptors_at = iat_len;
    let descriptors_len = DESCRIPTOR_SIZE * (spec.modules.len() + 1);
    let lookup_at = descriptors_at + descriptors_len;
    let strings_at = lookup_at + iat_len;

    let mut data = vec![0u8; strings_at];
    let mut slot = 0usize;
    for (index, module) in spec.modules.iter().enumerate() {
        let first_slot = slot;
        for symbol in &module.symbols {
            let thunk = match symbol {
                ImportName::Ordinal(ordinal) => ORDINAL_FLAG | u64::from(*ordinal),
                ImportName::Name(name) => {
                    if data.len() % 2 != 0 {
                        data.push(0);
                    }
                    let hint = spec.rva + len32(data.len())?;
                    data.extend_from_slice(&[0, 0]);
                    data.extend_from_slice(name.as_bytes());
                    data.push(0);
                    u64::from(hint)
                }
            };
            put_u64(&mut data, slot * 8, thunk);
            put_u64(&mut data, lookup_at + slot * 8, thunk);
            slot += 1;
        }
        slot += 1;

        let name_rva = spec.rva + len32(data.len())?;
        data.extend_from_slice(module.name.as_bytes());
        data.push(0);

        let at = descriptors_at + index * DESCRIPTOR_SIZE;
        put_u32(&mut data, at, spec.rva + len32(lookup_at + first_slot * 8)?);
        put_u32(&mut data, at + 12, name_rva);
        put_u32(&mut data, at + 16, spec.rva + len32(first_slot * 8)?);
    }

    let import_dir = (spec.rva + len32(descriptors_at)?, len32(descriptors_len)?);
    let iat_dir = (spec.rva, len32(iat_len)?);
    Ok((data, import_dir, iat_dir))
}

fn build_exports(spec: &ExportSpec) -> Result<Vec<u8>, BuildError> {
    let count = spec.items.len();
    let mut named: Vec<(&str, usize)> = spec
        .items
        .iter()
        .enumerate()
        .filter_map(|(index, item)| match item {
            ExportItem::Rva { name, .. } => name.as_deref().map(|name| (name, index)),
            ExportItem::Forwarder { name, .. } => Some((name.as_str(), index)),
        })
        .collect();
    named.sort_unstable();

    let functions_at = EXPORT_DIRECTORY_SIZE;
    let names_at = functions_at + count * 4;
    let ordinals_at = names_at + named.len() * 4;
    let strings_at = ordinals_at + named.len() * 2;
    let mut data = vec![0u8; strings_at];

    let dll_name = spec.rva + len32(data.len())?;
    data.extend_from_slice(spec.dll_name.as_bytes());
    data.push(0);

    for (index, item) in spec.items.iter().enumerate() {
        let target = match item {
            ExportItem::Rva { rva, .. } => *rva,
            ExportItem::Forwarder { target, .. } => {
                let at = spec.rva + len32(data.len())?;
                data.extend_from_slice(target.as_bytes());
                data.push(0);
                at
            }
        };
        put_u32(&mut data, functions_at + index * 4, target);
    }
    for (position, (name, index)) in named.iter().enumerate() {
        let at = spec.rva + len32(data.len())?;
        data.extend_from_slice(name.as_bytes());
        data.push(0);
        put_u32(&mut data, names_at + position * 4, at);
        #[allow(clippy::cast_possible_truncation)]
        put_u16(&mut data, ordinals_at + position * 2, *index as u16);
    }

    put_u32(&mut data, 12, dll_name);
    put_u32(&mut data, 16, spec.ordinal_base);
    put_u32(&mut data, 20, len32(count)?);
    put_u32(&mut data, 24, len32(named.len())?);
    put_u32(&mut data, 28, spec.rva + len32(functions_at)?);
    put_u32(&mut data, 32, spec.rva + len32(names_at)?);
    put_u32(&mut data, 36, spec.rva + len32(ordinals_at)?);
    Ok(data)
}

fn build_relocations(entries: &[(u32, u16)]) -> Result<Vec<u8>, BuildError> {
    let mut pages: BTreeMap<u32, Vec<u16>> = BTreeMap::new();
    for (rva, kind) in entries {
        #[allow(clippy::cast_possible_truncation)]
        let offset = (rva & 0xFFF) as u16;
        pages
            .entry(rva & !0xFFF)
            .or_default()
            .push((kind << 12) | offset);
    }

    let mut data = Vec::new();
    for (page, mut words) in pages {
        if words.len() % 2 != 0 {
            words.push(REL_ABSOLUTE << 12);
        }
        let block_size = len32(8 + words.len() * 2)?;
        data.extend_from_slice(&page.to_le_bytes());
        data.extend_from_slice(&block_size.to_le_bytes());
        for word in words {
            data.extend_from_slice(&word.to_le_bytes());
        }
    }
    Ok(data)
}

fn len32(len: usize) -> Result<u32, BuildError> {
    u32::try_from(len).map_err(|_| BuildError::Layout(format!("size {len:#x} exceeds 32 bits")))
}

const fn align(value: u32, alignment: u32) -> u32 {
    value.div_ceil(alignment) * alignment
}

fn put_u16(buf: &mut [u8], at: usize, value: u16) {
    buf[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut [u8], at: usize, value: u64) {
    buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

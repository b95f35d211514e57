//! Header and section-table validation on top of `goblin`.

use goblin::pe::header::Header;

use crate::mapper::MapError;
use crate::memory::{align_up, Permissions};

/// `IMAGE_FILE_MACHINE_AMD64`.
pub const MACHINE_AMD64: u16 = 0x8664;
/// Optional-header magic of PE32+ images.
pub const PE32_PLUS_MAGIC: u16 = 0x20B;
/// `IMAGE_FILE_RELOCS_STRIPPED`.
pub const FILE_RELOCS_STRIPPED: u16 = 0x0001;
/// `IMAGE_FILE_DLL`.
pub const FILE_DLL: u16 = 0x2000;
/// `IMAGE_SCN_MEM_EXECUTE`.
pub const SCN_MEM_EXECUTE: u32 = 0x2000_0000;
/// `IMAGE_SCN_MEM_READ`.
pub const SCN_MEM_READ: u32 = 0x4000_0000;
/// `IMAGE_SCN_MEM_WRITE`.
pub const SCN_MEM_WRITE: u32 = 0x8000_0000;
/// Largest `SizeOfImage` the mapper will reserve.
pub const MAX_IMAGE_SIZE: u64 = 0x1000_0000;

const SIZEOF_PE_SIGNATURE: usize = 4;
const SIZEOF_COFF_HEADER: usize = 20;

/// RVA and size of one data directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct DataDir {
    pub rva: u64,
    pub size: u64,
}

impl DataDir {
    pub const fn is_empty(self) -> bool {
        self.rva == 0 || self.size == 0
    }

    pub const fn contains(self, rva: u64) -> bool {
        rva >= self.rva && rva - self.rva < self.size
    }
}

macro_rules! directory {
    ($entry:expr) => {
        match $entry {
            Some(dd) => DataDir {
                rva: u64::from(dd.virtual_address),
                size: u64::from(dd.size),
            },
            None => DataDir::default(),
        }
    };
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Directories {
    pub export: DataDir,
    pub import: DataDir,
    pub base_reloc: DataDir,
    pub tls: DataDir,
    pub clr: DataDir,
    pub delay_import: DataDir,
}

#[derive(Debug, Clone)]
pub(crate) struct SectionHeader {
    pub name: String,
    pub virtual_address: u64,
    pub virtual_size: u64,
    pub raw_size: u64,
    pub raw_offset: u64,
    pub characteristics: u32,
    /// `max(virtual, raw)` rounded up to the section alignment.
    pub mapped_size: u64,
}

impl SectionHeader {
    pub const fn permissions(&self) -> Permissions {
        let mut bits = 0;
        if self.characteristics & SCN_MEM_READ != 0 {
            bits |= Permissions::READ.bits();
        }
        if self.characteristics & SCN_MEM_WRITE != 0 {
            bits |= Permissions::WRITE.bits();
        }
        if self.characteristics & SCN_MEM_EXECUTE != 0 {
            bits |= Permissions::EXECUTE.bits();
        }
        Permissions::from_bits_truncate(bits)
    }

    pub const fn contains_rva(&self, rva: u64) -> bool {
        rva >= self.virtual_address && rva - self.virtual_address < self.mapped_size
    }
}

/// Validated view of the headers of one PE32+ image.
#[derive(Debug, Clone)]
pub(crate) struct ImageHeaders {
    pub image_base: u64,
    pub size_of_image: u64,
    pub size_of_headers: u64,
    pub section_alignment: u64,
    pub entry_rva: u64,
    pub stack_reserve: u64,
    pub is_dll: bool,
    pub relocs_stripped: bool,
    pub directories: Directories,
    pub sections: Vec<SectionHeader>,
}

impl ImageHeaders {
    /// Parses and validates headers and the section table of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Self, MapError> {
        let header = Header::parse(bytes)
            .map_err(|error| MapError::InvalidFormat(format!("malformed headers: {error}")))?;

        let coff = header.coff_header;
        if coff.machine != MACHINE_AMD64 {
            return Err(MapError::InvalidFormat(format!(
                "machine {:#06x} is not AMD64",
                coff.machine
            )));
        }
        let optional = header
            .optional_header
            .ok_or_else(|| MapError::InvalidFormat("missing optional header".into()))?;
        if optional.standard_fields.magic != PE32_PLUS_MAGIC {
            return Err(MapError::InvalidFormat(format!(
                "optional header magic {:#06x} is not PE32+",
                optional.standard_fields.magic
            )));
        }

        let windows = &optional.windows_fields;
        let section_alignment = u64::from(windows.section_alignment);
        let file_alignment = u64::from(windows.file_alignment);
        if !section_alignment.is_power_of_two()
            || !file_alignment.is_power_of_two()
            || file_alignment > section_alignment
        {
            return Err(MapError::InvalidFormat(format!(
                "inconsistent alignment: section {section_alignment:#x}, file {file_alignment:#x}"
            )));
        }

        let size_of_image = u64::from(windows.size_of_image);
        let size_of_headers = u64::from(windows.size_of_headers);
        if size_of_image == 0 || size_of_image > MAX_IMAGE_SIZE {
            return Err(MapError::InvalidFormat(format!(
                "SizeOfImage {size_of_image:#x} out of range"
            )));
        }
        if size_of_headers == 0
            || size_of_headers > bytes.len() as u64
            || size_of_headers > size_of_image
        {
            return Err(MapError::InvalidFormat(format!(
                "SizeOfHeaders {size_of_headers:#x} exceeds the file or the image"
            )));
        }
        if coff.number_of_sections == 0 {
            return Err(MapError::InvalidFormat("image has no sections".into()));
        }

        let image_base = u64::from(windows.image_base);
        if image_base % crate::memory::ALLOCATION_GRANULARITY != 0 {
            return Err(MapError::InvalidFormat(format!(
                "ImageBase {image_base:#x} is not 64 KiB aligned"
            )));
        }

        let dirs = &optional.data_directories;
        let directories = Directories {
            export: directory!(dirs.get_export_table()),
            import: directory!(dirs.get_import_table()),
            base_reloc: directory!(dirs.get_base_relocation_table()),
            tls: directory!(dirs.get_tls_table()),
            clr: directory!(dirs.get_clr_runtime_header()),
            delay_import: directory!(dirs.get_delay_import_descriptor()),
        };

        let mut offset = usize::try_from(header.dos_header.pe_pointer)
            .ok()
            .and_then(|pe| pe.checked_add(SIZEOF_PE_SIGNATURE + SIZEOF_COFF_HEADER))
            .and_then(|start| start.checked_add(usize::from(coff.size_of_optional_header)))
            .ok_or_else(|| MapError::InvalidFormat("section table offset overflows".into()))?;
        let table = coff.sections(bytes, &mut offset).map_err(|error| {
            MapError::CorruptSections(format!("unreadable section table: {error}"))
        })?;

        let sections = table
            .iter()
            .map(|section| {
                let virtual_size = u64::from(section.virtual_size);
                let raw_size = u64::from(section.size_of_raw_data);
                SectionHeader {
                    name: String::from_utf8_lossy(&section.name)
                        .trim_end_matches('\0')
                        .to_string(),
                    virtual_address: u64::from(section.virtual_address),
                    virtual_size,
                    raw_size,
                    raw_offset: u64::from(section.pointer_to_raw_data),
                    characteristics: section.characteristics,
                    mapped_size: align_up(virtual_size.max(raw_size), section_alignment)
                        .unwrap_or(u64::MAX),
                }
            })
            .collect();

        let headers = Self {
            image_base,
            size_of_image,
            size_of_headers,
            section_alignment,
            entry_rva: u64::from(optional.standard_fields.address_of_entry_point),
            stack_reserve: u64::from(windows.size_of_stack_reserve),
            is_dll: coff.characteristics & FILE_DLL != 0,
            relocs_stripped: coff.characteristics & FILE_RELOCS_STRIPPED != 0,
            directories,
            sections,
        };
        headers.validate_sections(bytes.len() as u64)?;
        Ok(headers)
    }

    /// Size of the reserved image range, rounded to the section alignment.
    pub fn image_span(&self) -> u64 {
        align_up(self.size_of_image, self.section_alignment).unwrap_or(self.size_of_image)
    }

    /// Size of the header region.
    pub fn header_span(&self) -> u64 {
        align_up(self.size_of_headers, self.section_alignment).unwrap_or(self.size_of_headers)
    }

    /// Section containing `rva`, if any.
    pub fn section_for(&self, rva: u64) -> Option<&SectionHeader> {
        self.sections
            .iter()
            .filter(|section| section.mapped_size > 0)
            .find(|section| section.contains_rva(rva))
    }

    fn validate_sections(&self, file_len: u64) -> Result<(), MapError> {
        let image_span = self.image_span();
        let header_span = self.header_span();
        let mut spans: Vec<(u64, u64, &str)> = Vec::with_capacity(self.sections.len());

        for section in &self.sections {
            let name = section.name.as_str();
            if section.raw_size > 0 {
                let raw_end = section.raw_offset.checked_add(section.raw_size);
                if raw_end.is_none_or(|end| end > file_len) {
                    return Err(MapError::CorruptSections(format!(
                        "section {name} raw data exceeds the file"
                    )));
                }
            }
            if section.mapped_size == 0 {
                continue;
            }
            if section.virtual_address % self.section_alignment != 0 {
                return Err(MapError::CorruptSections(format!(
                    "section {name} is not aligned to {:#x}",
                    self.section_alignment
                )));
            }
            if section.virtual_address < header_span {
                return Err(MapError::CorruptSections(format!(
                    "section {name} starts inside the headers"
                )));
            }
            let end = section.virtual_address.checked_add(section.mapped_size);
            if end.is_none_or(|end| end > image_span) {
                return Err(MapError::CorruptSections(format!(
                    "section {name} ends beyond SizeOfImage"
                )));
            }
            spans.push((
                section.virtual_address,
                section.virtual_address + section.mapped_size,
                name,
            ));
        }

        spans.sort_unstable_by_key(|span| span.0);
        for pair in spans.windows(2) {
            if pair[0].1 > pair[1].0 {
                return Err(MapError::CorruptSections(format!(
                    "sections {} and {} overlap",
                    pair[0].2, pair[1].2
                )));
            }
        }
        Ok(())
    }
}

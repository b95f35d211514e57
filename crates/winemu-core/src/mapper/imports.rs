//! Import descriptor parsing and forwarder syntax.

use crate::mapper::headers::DataDir;
use crate::mapper::image::ImportSymbol;
use crate::mapper::view::{read_name, read_u32, read_u64};
use crate::mapper::MapError;

const DESCRIPTOR_SIZE: u64 = 20;
const THUNK_SIZE: u64 = 8;
const ORDINAL_FLAG: u64 = 1 << 63;

/// One `IMAGE_IMPORT_DESCRIPTOR` with its thunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ImportDescriptor {
    pub module: String,
    pub entries: Vec<ImportEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ImportEntry {
    pub symbol: ImportSymbol,
    /// RVA of the IAT slot to patch.
    pub iat_rva: u64,
}

/// Reads every import descriptor up to the null terminator.
pub(crate) fn parse_imports(image: &[u8], dir: DataDir) -> Result<Vec<ImportDescriptor>, MapError> {
    let mut descriptors = Vec::new();
    if dir.is_empty() {
        return Ok(descriptors);
    }

    let mut at = dir.rva;
    loop {
        let lookup = u64::from(read_u32(image, at, "import descriptor")?);
        let name = u64::from(read_u32(image, at + 12, "import descriptor")?);
        let first_thunk = u64::from(read_u32(image, at + 16, "import descriptor")?);
        if name == 0 && first_thunk == 0 {
            break;
        }
        if name == 0 || first_thunk == 0 {
            return Err(MapError::InvalidFormat(format!(
                "import descriptor at rva {at:#x} is incomplete"
            )));
        }

        let module = read_name(image, name, "import module name")?;
        let mut thunk = if lookup != 0 { lookup } else { first_thunk };
        let mut iat_rva = first_thunk;
        let mut entries = Vec::new();
        loop {
            let value = read_u64(image, thunk, "import thunk")?;
            if value == 0 {
                break;
            }
            let symbol = if value & ORDINAL_FLAG != 0 {
                #[allow(clippy::cast_possible_truncation)]
                ImportSymbol::Ordinal((value & 0xFFFF) as u16)
            } else {
                ImportSymbol::Name(read_name(image, (value & 0x7FFF_FFFF) + 2, "import name")?)
            };
            entries.push(ImportEntry { symbol, iat_rva });
            thunk += THUNK_SIZE;
            iat_rva += THUNK_SIZE;
        }

        descriptors.push(ImportDescriptor { module, entries });
        at += DESCRIPTOR_SIZE;
    }
    Ok(descriptors)
}

/// Splits a forwarder string (`NTDLL.RtlFree`, `NTDLL.#3`) into a module
/// file name and a symbol.
pub(crate) fn parse_forwarder(forwarder: &str) -> Option<(String, ImportSymbol)> {
    let (module, symbol) = forwarder.rsplit_once('.')?;
    if module.is_empty() || symbol.is_empty() {
        return None;
    }
    let module = if module.contains('.') {
        module.to_owned()
    } else {
        format!("{module}.dll")
    };
    let symbol = match symbol.strip_prefix('#') {
        Some(ordinal) => ImportSymbol::Ordinal(ordinal.parse().ok()?),
        None => ImportSymbol::Name(symbol.to_owned()),
    };
    Some((module, symbol))
}

//! Export directory parsing.

use crate::mapper::headers::DataDir;
use crate::mapper::image::{ExportTable, ExportTarget};
use crate::mapper::view::{read_name, read_u16, read_u32};
use crate::mapper::MapError;

/// Reads the export directory of `image` (RVA-addressed buffer).
pub(crate) fn parse_exports(image: &[u8], dir: DataDir) -> Result<ExportTable, MapError> {
    let mut table = ExportTable::default();
    if dir.is_empty() {
        return Ok(table);
    }

    let base = read_u32(image, dir.rva + 16, "export directory")?;
    let function_count = u64::from(read_u32(image, dir.rva + 20, "export directory")?);
    let name_count = u64::from(read_u32(image, dir.rva + 24, "export directory")?);
    let functions = u64::from(read_u32(image, dir.rva + 28, "export directory")?);
    let names = u64::from(read_u32(image, dir.rva + 32, "export directory")?);
    let ordinals = u64::from(read_u32(image, dir.rva + 36, "export directory")?);

    let image_len = image.len() as u64;
    if function_count * 4 > image_len || name_count * 4 > image_len {
        return Err(MapError::InvalidFormat(
            "export directory counts exceed the image".into(),
        ));
    }

    for index in 0..function_count {
        let rva = read_u32(image, functions + index * 4, "export address table")?;
        if rva == 0 {
            continue;
        }
        #[allow(clippy::cast_possible_truncation)]
        let ordinal = base.wrapping_add(index as u32);
        let target = if dir.contains(u64::from(rva)) {
            ExportTarget::Forwarder(read_name(image, u64::from(rva), "export forwarder")?)
        } else {
            ExportTarget::Rva(rva)
        };
        table.insert(ordinal, target);
    }

    for index in 0..name_count {
        let name_rva = read_u32(image, names + index * 4, "export name table")?;
        let slot = read_u16(image, ordinals + index * 2, "export ordinal table")?;
        if u64::from(slot) >= function_count {
            return Err(MapError::InvalidFormat(format!(
                "export name ordinal {slot} out of range"
            )));
        }
        let name = read_name(image, u64::from(name_rva), "export name")?;
        table.insert_name(name, base.wrapping_add(u32::from(slot)));
    }

    Ok(table)
}

//! Base relocation walker.

use crate::mapper::headers::DataDir;
use crate::mapper::view::{read_u16, read_u32, read_u64, write_u32, write_u64};
use crate::mapper::MapError;

/// `IMAGE_REL_BASED_ABSOLUTE`: padding entry.
pub const REL_BASED_ABSOLUTE: u16 = 0;
/// `IMAGE_REL_BASED_HIGHLOW`: 32-bit field.
pub const REL_BASED_HIGHLOW: u16 = 3;
/// `IMAGE_REL_BASED_DIR64`: 64-bit field.
pub const REL_BASED_DIR64: u16 = 10;

const BLOCK_HEADER_SIZE: u64 = 8;

/// Walks every relocation block of `dir` and adds `delta` to each target.
///
/// Blocks are validated even when `delta` is zero. Returns the number of
/// fields adjusted.
pub(crate) fn apply_relocations(
    image: &mut [u8],
    dir: DataDir,
    delta: u64,
) -> Result<usize, MapError> {
    if dir.is_empty() {
        return Ok(0);
    }
    let end = dir
        .rva
        .checked_add(dir.size)
        .filter(|end| *end <= image.len() as u64)
        .ok_or_else(|| {
            MapError::InvalidFormat("relocation directory lies outside the image".into())
        })?;

    let mut applied = 0;
    let mut block = dir.rva;
    while end - block >= BLOCK_HEADER_SIZE {
        let page_rva = u64::from(read_u32(image, block, "relocation block")?);
        let block_size = u64::from(read_u32(image, block + 4, "relocation block")?);
        if block_size == 0 {
            break;
        }
        if block_size < BLOCK_HEADER_SIZE || block_size > end - block {
            return Err(MapError::InvalidFormat(format!(
                "relocation block at rva {block:#x} has invalid size {block_size:#x}"
            )));
        }

        let mut entry = block + BLOCK_HEADER_SIZE;
        while entry + 2 <= block + block_size {
            let raw = read_u16(image, entry, "relocation entry")?;
            entry += 2;
            let kind = raw >> 12;
            let target = page_rva + u64::from(raw & 0x0FFF);
            match kind {
                REL_BASED_ABSOLUTE => {}
                REL_BASED_HIGHLOW => {
                    let value = read_u32(image, target, "relocation target")?;
                    #[allow(clippy::cast_possible_truncation)]
                    let adjusted = value.wrapping_add(delta as u32);
                    write_u32(image, target, adjusted, "relocation target")?;
                    applied += 1;
                }
                REL_BASED_DIR64 => {
                    let value = read_u64(image, target, "relocation target")?;
                    write_u64(image, target, value.wrapping_add(delta), "relocation target")?;
                    applied += 1;
                }
                _ => {
                    return Err(MapError::UnsupportedRelocation {
                        kind,
                        rva: u32::try_from(target).unwrap_or(u32::MAX),
                    })
                }
            }
        }
        block += block_size;
    }
    Ok(applied)
}

//! Bounds-checked little-endian access to an image buffer by RVA.

use crate::mapper::MapError;

/// Longest import, export or forwarder name accepted.
const MAX_NAME_LEN: usize = 512;

fn range(
    image: &[u8],
    rva: u64,
    len: usize,
    what: &str,
) -> Result<std::ops::Range<usize>, MapError> {
    usize::try_from(rva)
        .ok()
        .and_then(|start| start.checked_add(len).map(|end| start..end))
        .filter(|range| range.end <= image.len())
        .ok_or_else(|| {
            MapError::InvalidFormat(format!("{what} at rva {rva:#x} lies outside the image"))
        })
}

pub(crate) fn read_u16(image: &[u8], rva: u64, what: &str) -> Result<u16, MapError> {
    let range = range(image, rva, 2, what)?;
    let mut bytes = [0u8; 2];
    bytes.copy_from_slice(&image[range]);
    Ok(u16::from_le_bytes(bytes))
}

pub(crate) fn read_u32(image: &[u8], rva: u64, what: &str) -> Result<u32, MapError> {
    let range = range(image, rva, 4, what)?;
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&image[range]);
    Ok(u32::from_le_bytes(bytes))
}

pub(crate) fn read_u64(image: &[u8], rva: u64, what: &str) -> Result<u64, MapError> {
    let range = range(image, rva, 8, what)?;
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&image[range]);
    Ok(u64::from_le_bytes(bytes))
}

pub(crate) fn write_u32(
    image: &mut [u8],
    rva: u64,
    value: u32,
    what: &str,
) -> Result<(), MapError> {
    let range = range(image, rva, 4, what)?;
    image[range].copy_from_slice(&value.to_le_bytes());
    Ok(())
}

pub(crate) fn write_u64(
    image: &mut [u8],
    rva: u64,
    value: u64,
    what: &str,
) -> Result<(), MapError> {
    let range = range(image, rva, 8, what)?;
    image[range].copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Reads a NUL-terminated ASCII name.
pub(crate) fn read_name(image: &[u8], rva: u64, what: &str) -> Result<String, MapError> {
    let start = range(image, rva, 0, what)?.start;
    let window = &image[start..image.len().min(start + MAX_NAME_LEN)];
    let len = window
        .iter()
        .position(|byte| *byte == 0)
        .ok_or_else(|| {
            MapError::InvalidFormat(format!("{what} at rva {rva:#x} is not terminated"))
        })?;
    if len == 0 {
        return Err(MapError::InvalidFormat(format!("{what} at rva {rva:#x} is empty")));
    }
    Ok(String::from_utf8_lossy(&window[..len]).into_owned())
}

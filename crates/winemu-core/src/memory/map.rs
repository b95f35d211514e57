//! Region map backing one emulated process.

use std::collections::BTreeMap;

use crate::memory::{AccessKind, MemoryError, Permissions};

/// Page size used for section and stack layout.
pub const PAGE_SIZE: u64 = 0x1000;
/// Alignment of ranges chosen by [`AddressSpace::find_free`].
pub const ALLOCATION_GRANULARITY: u64 = 0x1_0000;
/// Lowest address dynamic allocation may return.
pub const ALLOCATION_FLOOR: u64 = 0x1_0000;
/// Exclusive upper bound of the user-mode address range.
pub const ADDRESS_LIMIT: u64 = 0x7FFF_FFFF_0000;

/// Rounds `value` up to a power-of-two `alignment`, or `None` on overflow.
#[must_use]
pub const fn align_up(value: u64, alignment: u64) -> Option<u64> {
    match value.checked_add(alignment - 1) {
        Some(sum) => Some(sum & !(alignment - 1)),
        None => None,
    }
}

/// Public descriptor of one mapped region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct RegionInfo {
    /// First address of the region.
    pub base: u64,
    /// Length in bytes (never zero).
    pub size: u64,
    /// Access permissions.
    pub permissions: Permissions,
}

impl RegionInfo {
    /// Exclusive end address.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base + self.size
    }

    /// Returns `true` when `addr` lies inside the region.
    #[must_use]
    pub const fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// Returns `true` when the two regions share at least one byte.
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.base < other.end() && other.base < self.end()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Region {
    permissions: Permissions,
    size: u64,
}

impl Region {
    const fn len(&self) -> u64 {
        self.size
    }
}

const PAGE_LEN: usize = 0x1000;

/// Offset of `addr` inside its page.
#[allow(clippy::cast_possible_truncation)]
const fn page_offset(addr: u64) -> usize {
    // Always below PAGE_SIZE.
    (addr % PAGE_SIZE) as usize
}

/// Emulated memory as an ordered set of disjoint permission-tagged regions.
///
/// Every access is checked against the covering regions before any byte is
/// touched, so a failing write leaves memory unchanged. Backing storage is
/// sparse: a page gets bytes on its first write and reads as zero until then,
/// so reserving a large range costs nothing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AddressSpace {
    regions: BTreeMap<u64, Region>,
    pages: BTreeMap<u64, Box<[u8]>>,
}

impl AddressSpace {
    /// Creates an empty address space.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mapped regions.
    #[must_use]
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Number of pages holding written bytes.
    #[must_use]
    pub fn resident_pages(&self) -> usize {
        self.pages.len()
    }

    /// Iterates region descriptors in ascending address order.
    pub fn regions(&self) -> impl Iterator<Item = RegionInfo> + '_ {
        self.regions.iter().map(|(&base, region)| RegionInfo {
            base,
            size: region.len(),
            permissions: region.permissions,
        })
    }

    /// Returns the region covering `addr`, if any.
    #[must_use]
    pub fn region_at(&self, addr: u64) -> Option<RegionInfo> {
        self.covering(addr).map(|(base, region)| RegionInfo {
            base,
            size: region.len(),
            permissions: region.permissions,
        })
    }

    /// Returns `true` when no region intersects `[base, base + size)`.
    #[must_use]
    pub fn is_free(&self, base: u64, size: u64) -> bool {
        let Some(end) = base.checked_add(size) else {
            return false;
        };
        match self.regions.range(..end).next_back() {
            Some((&other_base, region)) => other_base + region.len() <= base,
            None => true,
        }
    }

    /// Finds a free granularity-aligned range of `size` bytes.
    ///
    /// The search starts at `hint` (raised to the allocation floor) and falls
    /// back to the floor when nothing above the hint fits.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidRange`] for a zero size and
    /// [`MemoryError::NoFreeRange`] when the user range is exhausted.
    pub fn find_free(&self, size: u64, hint: u64) -> Result<u64, MemoryError> {
        self.find_free_excluding(size, hint, &[])
    }

    /// Like [`AddressSpace::find_free`], but also treats every `(base, size)`
    /// in `reserved` as occupied.
    ///
    /// # Errors
    ///
    /// See [`AddressSpace::find_free`].
    pub fn find_free_excluding(
        &self,
        size: u64,
        hint: u64,
        reserved: &[(u64, u64)],
    ) -> Result<u64, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidRange { base: hint, size });
        }
        let mut occupied: Vec<(u64, u64)> = self
            .regions
            .iter()
            .map(|(&base, region)| (base, base + region.len()))
            .chain(
                reserved
                    .iter()
                    .filter(|&&(_, len)| len > 0)
                    .map(|&(base, len)| (base, base.saturating_add(len))),
            )
            .collect();
        occupied.sort_unstable();

        scan_free(&occupied, size, hint.max(ALLOCATION_FLOOR))
            .or_else(|| scan_free(&occupied, size, ALLOCATION_FLOOR))
            .ok_or(MemoryError::NoFreeRange { size })
    }

    /// Allocates a zero-filled region.
    ///
    /// With `base = None` the lowest free range above the allocation floor is
    /// used.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidRange`] for zero or wrapping sizes,
    /// [`MemoryError::Overlap`] when a fixed base is occupied, and
    /// [`MemoryError::NoFreeRange`] when no dynamic range fits.
    pub fn allocate(
        &mut self,
        base: Option<u64>,
        size: u64,
        permissions: Permissions,
    ) -> Result<RegionInfo, MemoryError> {
        let base = match base {
            Some(base) => {
                validate_range(base, size)?;
                if !self.is_free(base, size) {
                    return Err(MemoryError::Overlap { base, size });
                }
                base
            }
            None => self.find_free(size, ALLOCATION_FLOOR)?,
        };

        self.regions.insert(base, Region { permissions, size });

        Ok(RegionInfo {
            base,
            size,
            permissions,
        })
    }

    /// Releases the region starting exactly at `base`.
    ///
    /// The released bytes are discarded, so a later allocation over the same
    /// range reads as zero.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::NotRegionBase`] when no region starts at `base`.
    pub fn free(&mut self, base: u64) -> Result<RegionInfo, MemoryError> {
        let region = self
            .regions
            .remove(&base)
            .ok_or(MemoryError::NotRegionBase { address: base })?;
        self.discard(base, base + region.len());
        Ok(RegionInfo {
            base,
            size: region.len(),
            permissions: region.permissions,
        })
    }

    /// Changes permissions of `[addr, addr + len)`, splitting regions at the
    /// range boundaries.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidRange`] for an empty or wrapping range and
    /// [`MemoryError::Unmapped`] when any byte of the range is not mapped; in
    /// both cases nothing changes.
    pub fn protect(
        &mut self,
        addr: u64,
        len: u64,
        permissions: Permissions,
    ) -> Result<(), MemoryError> {
        validate_range(addr, len)?;
        let end = addr + len;
        self.check(addr, end, None)?;

        self.split_at(addr);
        self.split_at(end);
        for region in self.regions.range_mut(addr..end).map(|(_, region)| region) {
            region.permissions = permissions;
        }
        Ok(())
    }

    /// Reads `buf.len()` bytes at `addr` with read permission.
    ///
    /// # Errors
    ///
    /// Returns the first unmapped or non-readable address touched.
    pub fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        let end = checked_end(addr, buf.len())?;
        self.check(addr, end, Some(AccessKind::Read))?;
        self.copy_out(addr, buf);
        Ok(())
    }

    /// Writes `data` at `addr` with write permission, all-or-nothing.
    ///
    /// # Errors
    ///
    /// Returns the first unmapped or non-writable address touched; memory is
    /// unchanged on error.
    pub fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), MemoryError> {
        let end = checked_end(addr, data.len())?;
        self.check(addr, end, Some(AccessKind::Write))?;
        self.copy_in(addr, data);
        Ok(())
    }

    /// Loader write: bounds-checked, ignores permissions.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::Unmapped`] for the first uncovered address.
    pub fn load(&mut self, addr: u64, data: &[u8]) -> Result<(), MemoryError> {
        let end = checked_end(addr, data.len())?;
        self.check(addr, end, None)?;
        self.copy_in(addr, data);
        Ok(())
    }

    /// Fetches up to `buf.len()` instruction bytes at `addr`.
    ///
    /// Stops early at the first byte that is unmapped or not executable and
    /// returns the number of bytes copied.
    ///
    /// # Errors
    ///
    /// Fails only when the byte at `addr` itself cannot be fetched.
    pub fn fetch(&self, addr: u64, buf: &mut [u8]) -> Result<usize, MemoryError> {
        let mut copied = 0;
        let mut cursor = addr;
        while copied < buf.len() {
            let failure = match self.covering(cursor) {
                None => Some(MemoryError::Unmapped { address: cursor }),
                Some((_, region)) if !region.permissions.allows(AccessKind::Execute) => {
                    Some(MemoryError::PermissionDenied {
                        address: cursor,
                        access: AccessKind::Execute,
                    })
                }
                Some((base, region)) => {
                    let available = base + region.len() - cursor;
                    let take = usize::try_from(available)
                        .unwrap_or(usize::MAX)
                        .min(buf.len() - copied);
                    self.copy_out(cursor, &mut buf[copied..copied + take]);
                    copied += take;
                    match cursor.checked_add(take as u64) {
                        Some(next) => cursor = next,
                        None => break,
                    }
                    None
                }
            };
            if let Some(error) = failure {
                if copied == 0 {
                    return Err(error);
                }
                break;
            }
        }
        Ok(copied)
    }

    /// Reads a little-endian `u8`.
    ///
    /// # Errors
    ///
    /// See [`AddressSpace::read`].
    pub fn read_u8(&self, addr: u64) -> Result<u8, MemoryError> {
        let mut buf = [0u8; 1];
        self.read(addr, &mut buf)?;
        Ok(buf[0])
    }

    /// Reads a little-endian `u16`.
    ///
    /// # Errors
    ///
    /// See [`AddressSpace::read`].
    pub fn read_u16(&self, addr: u64) -> Result<u16, MemoryError> {
        let mut buf = [0u8; 2];
        self.read(addr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    /// Reads a little-endian `u32`.
    ///
    /// # Errors
    ///
    /// See [`AddressSpace::read`].
    pub fn read_u32(&self, addr: u64) -> Result<u32, MemoryError> {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Reads a little-endian `u64`.
    ///
    /// # Errors
    ///
    /// See [`AddressSpace::read`].
    pub fn read_u64(&self, addr: u64) -> Result<u64, MemoryError> {
        let mut buf = [0u8; 8];
        self.read(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Writes a little-endian `u64`.
    ///
    /// # Errors
    ///
    /// See [`AddressSpace::write`].
    pub fn write_u64(&mut self, addr: u64, value: u64) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    fn covering(&self, addr: u64) -> Option<(u64, &Region)> {
        let (&base, region) = self.regions.range(..=addr).next_back()?;
        (addr - base < region.len()).then_some((base, region))
    }

    fn check(&self, addr: u64, end: u64, access: Option<AccessKind>) -> Result<(), MemoryError> {
        let mut cursor = addr;
        while cursor < end {
            let (base, region) = self
                .covering(cursor)
                .ok_or(MemoryError::Unmapped { address: cursor })?;
            if let Some(access) = access {
                if !region.permissions.allows(access) {
                    return Err(MemoryError::PermissionDenied {
                        address: cursor,
                        access,
                    });
                }
            }
            cursor = base + region.len();
        }
        Ok(())
    }

    // Callers have already checked that the range is mapped.
    fn copy_out(&self, addr: u64, buf: &mut [u8]) {
        let mut done = 0;
        while done < buf.len() {
            let cursor = addr + done as u64;
            let offset = page_offset(cursor);
            let take = (PAGE_LEN - offset).min(buf.len() - done);
            let chunk = &mut buf[done..done + take];
            match self.pages.get(&(cursor - offset as u64)) {
                Some(page) => chunk.copy_from_slice(&page[offset..offset + take]),
                None => chunk.fill(0),
            }
            done += take;
        }
    }

    fn copy_in(&mut self, addr: u64, data: &[u8]) {
        let mut done = 0;
        while done < data.len() {
            let cursor = addr + done as u64;
            let offset = page_offset(cursor);
            let take = (PAGE_LEN - offset).min(data.len() - done);
            let page = self
                .pages
                .entry(cursor - offset as u64)
                .or_insert_with(|| vec![0; PAGE_LEN].into_boxed_slice());
            page[offset..offset + take].copy_from_slice(&data[done..done + take]);
            done += take;
        }
    }

    /// Drops the bytes of `[addr, end)`; pages shared with a neighbouring
    /// region are zeroed over the range and dropped once entirely zero.
    fn discard(&mut self, addr: u64, end: u64) {
        let first = addr - page_offset(addr) as u64;
        let touched: Vec<u64> = self.pages.range(first..end).map(|(&page, _)| page).collect();
        for page_base in touched {
            let from = page_base.max(addr);
            let to = (page_base + PAGE_SIZE).min(end);
            if from == page_base && to == page_base + PAGE_SIZE {
                self.pages.remove(&page_base);
                continue;
            }
            if let Some(page) = self.pages.get_mut(&page_base) {
                let lo = page_offset(from);
                page[lo..lo + page_offset(to - from)].fill(0);
                if page.iter().all(|&byte| byte == 0) {
                    self.pages.remove(&page_base);
                }
            }
        }
    }

    fn split_at(&mut self, addr: u64) {
        let Some((&base, region)) = self.regions.range_mut(..addr).next_back() else {
            return;
        };
        if addr - base >= region.len() {
            return;
        }
        let tail = Region {
            permissions: region.permissions,
            size: region.size - (addr - base),
        };
        region.size = addr - base;
        self.regions.insert(addr, tail);
    }
}

fn scan_free(occupied: &[(u64, u64)], size: u64, start: u64) -> Option<u64> {
    let mut candidate = align_up(start, ALLOCATION_GRANULARITY)?;
    for &(base, end) in occupied {
        if end <= candidate {
            continue;
        }
        if base >= candidate.checked_add(size)? {
            break;
        }
        candidate = align_up(end, ALLOCATION_GRANULARITY)?;
    }
    let end = candidate.checked_add(size)?;
    (end <= ADDRESS_LIMIT).then_some(candidate)
}

const fn validate_range(base: u64, size: u64) -> Result<(), MemoryError> {
    if size == 0 {
        return Err(MemoryError::InvalidRange { base, size });
    }
    match base.checked_add(size) {
        Some(end) if end <= ADDRESS_LIMIT => Ok(()),
        _ => Err(MemoryError::InvalidRange { base, size }),
    }
}

fn checked_end(addr: u64, len: usize) -> Result<u64, MemoryError> {
    addr.checked_add(len as u64)
        .ok_or(MemoryError::InvalidRange {
            base: addr,
            size: len as u64,
        })
}

//! Executable memory backing a synthesized image.
//!
//! An [`ImageRegion`] is one anonymous private mapping. It starts out readable and writable
//! so the staged image can be copied in, and is switched to read+execute by
//! [`ImageRegion::commit`]. After that the only path that writes to it again is
//! [`ImageRegion::rewrite`], which briefly adds write permission for relay stub
//! re-encoding. Both writers take `&mut self`, so a caller holding the region behind a lock
//! gets the single-writer discipline for free.
//!
//! # Placement
//!
//! Offsets inside a synthesized image are unsigned 32-bit values relative to its base, and
//! relay stubs reach their targets with signed 32-bit displacements. The region therefore
//! has to sit *below* every address it references and within `i32::MAX` bytes of the highest
//! one. [`ImageRegion::allocate`] takes these addresses as anchors and walks placement hints
//! downward from the lowest anchor until the kernel hands out a conforming address.

use std::{ffi::c_void, io, ptr::NonNull};

use bitflags::bitflags;
use log::{debug, trace};

use crate::{Error, Result};

/// Distance between two consecutive placement hints.
const PLACEMENT_STEP: usize = 1 << 20;

/// Number of placement hints tried before giving up.
const PLACEMENT_ATTEMPTS: usize = 64;

/// Largest distance between the region base and any referenced address.
const REACH: usize = i32::MAX as usize;

bitflags! {
    /// Page protection of a region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: i32 {
        /// Pages can be read
        const READ = libc::PROT_READ;
        /// Pages can be written
        const WRITE = libc::PROT_WRITE;
        /// Pages can be executed
        const EXEC = libc::PROT_EXEC;
    }
}

impl Protection {
    /// Protection while the image is being populated.
    pub const STAGING: Self = Self::READ.union(Self::WRITE);
    /// Protection of a finished image.
    pub const SEALED: Self = Self::READ.union(Self::EXEC);
    /// Protection while relay stubs are rewritten.
    pub const PATCHING: Self = Self::READ.union(Self::WRITE).union(Self::EXEC);
}

/// An anonymous mapping holding one synthesized image.
#[derive(Debug)]
pub struct ImageRegion {
    base: NonNull<u8>,
    size: usize,
    mapped: usize,
    protection: Protection,
}

// The mapping is exclusively owned; every mutation goes through `&mut self`.
unsafe impl Send for ImageRegion {}
unsafe impl Sync for ImageRegion {}

impl ImageRegion {
    /// Maps a region of at least `size` bytes that can reach every address in `anchors`.
    ///
    /// Without anchors the kernel's choice is accepted as is.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if the kernel refuses the mapping, or
    /// [`Error::Placement`] if no hint produced a base from which all anchors are reachable.
    pub fn allocate(size: usize, anchors: &[usize]) -> Result<Self> {
        let mapped = round_to_page(size.max(1));

        let (Some(&low), Some(&high)) = (anchors.iter().min(), anchors.iter().max()) else {
            let base = map(0, mapped).map_err(|source| Error::OutOfMemory { size, source })?;
            return Ok(Self::from_raw(base, size, mapped));
        };

        let Some(limit) = acceptable_window(low, high, mapped) else {
            return Err(Error::Placement { size });
        };

        let mut hint = align_down(low - mapped);
        for attempt in 0..PLACEMENT_ATTEMPTS {
            if hint < limit.0 {
                break;
            }

            let base = map(hint, mapped).map_err(|source| Error::OutOfMemory { size, source })?;
            let address = base.as_ptr() as usize;
            if (limit.0..=limit.1).contains(&address) {
                debug!(
                    "Placed {mapped:#x} byte region at {address:#x} after {} attempt(s)",
                    attempt + 1
                );
                return Ok(Self::from_raw(base, size, mapped));
            }

            trace!("Placement hint {hint:#x} answered with {address:#x}, retrying");
            // SAFETY: `base` was returned by `map` for `mapped` bytes and is not referenced
            // anywhere else.
            unsafe { libc::munmap(base.as_ptr().cast::<c_void>(), mapped) };
            hint = match hint.checked_sub(PLACEMENT_STEP) {
                Some(next) => next,
                None => break,
            };
        }

        Err(Error::Placement { size })
    }

    fn from_raw(base: NonNull<u8>, size: usize, mapped: usize) -> Self {
        ImageRegion {
            base,
            size,
            mapped,
            protection: Protection::STAGING,
        }
    }

    /// Address of the first byte.
    #[must_use]
    pub fn base(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Number of bytes the image occupies.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of bytes actually mapped, a whole number of pages.
    #[must_use]
    pub fn mapped_size(&self) -> usize {
        self.mapped
    }

    /// Current page protection.
    #[must_use]
    pub fn protection(&self) -> Protection {
        self.protection
    }

    /// Returns `true` if `address` lies inside the image bytes.
    #[must_use]
    pub fn contains(&self, address: usize) -> bool {
        address >= self.base() && address - self.base() < self.size
    }

    /// The image bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the mapping is readable in every protection state and at least `size`
        // bytes long; writes require `&mut self`.
        unsafe { std::slice::from_raw_parts(self.base.as_ptr(), self.size) }
    }

    /// Copies the staged image into the region and seals it read+execute.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] if `bytes` is not exactly the image size, or
    /// [`Error::Protection`] if sealing fails.
    pub fn commit(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() != self.size || self.protection != Protection::STAGING {
            return Err(Error::OutOfBounds);
        }

        // SAFETY: the region is writable while staging, `bytes` has exactly `size` bytes and
        // cannot overlap an anonymous mapping we own.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.as_ptr(), bytes.len());
        }
        self.protect(Protection::SEALED)
    }

    /// Rewrites fixed-size records of a sealed image in place.
    ///
    /// Records are copied one after another at whatever alignment `offset` has; a record
    /// is not written atomically and may straddle a cache line. Code executing a record while
    /// it is rewritten can observe a mix of old and new bytes, so callers switch records only
    /// while nothing dispatches through them or accept that window. The pages are writable
    /// only for the duration of this call and are sealed again before it returns.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] if a record does not fit inside the image, or
    /// [`Error::Protection`] if the protection cannot be changed.
    pub fn rewrite<const N: usize>(&mut self, records: &[(usize, [u8; N])]) -> Result<()> {
        if records
            .iter()
            .any(|(offset, _)| offset.checked_add(N).map_or(true, |end| end > self.size))
        {
            return Err(Error::OutOfBounds);
        }
        if records.is_empty() {
            return Ok(());
        }

        self.protect(Protection::PATCHING)?;
        for (offset, record) in records {
            // SAFETY: bounds were checked above and the pages are writable until the
            // protection is restored below.
            unsafe {
                self.base
                    .as_ptr()
                    .add(*offset)
                    .cast::<[u8; N]>()
                    .write_unaligned(*record);
            }
        }
        self.protect(Protection::SEALED)
    }

    fn protect(&mut self, protection: Protection) -> Result<()> {
        // SAFETY: `base` is page aligned and `mapped` covers exactly our own mapping.
        let status = unsafe {
            libc::mprotect(
                self.base.as_ptr().cast::<c_void>(),
                self.mapped,
                protection.bits(),
            )
        };
        if status != 0 {
            return Err(Error::Protection(io::Error::last_os_error()));
        }
        self.protection = protection;
        Ok(())
    }
}

impl Drop for ImageRegion {
    fn drop(&mut self) {
        // SAFETY: the mapping was created by `map` with `mapped` bytes and the region is its
        // only owner.
        unsafe {
            libc::munmap(self.base.as_ptr().cast::<c_void>(), self.mapped);
        }
    }
}

/// The inclusive range of base addresses that reach `[low, high]` from a region of
/// `mapped` bytes, or `None` if it is empty.
fn acceptable_window(low: usize, high: usize, mapped: usize) -> Option<(usize, usize)> {
    let upper = low.checked_sub(mapped)?;
    let lower = high.saturating_sub(REACH - mapped.min(REACH));
    (lower <= upper).then_some((lower, upper))
}

fn map(hint: usize, len: usize) -> io::Result<NonNull<u8>> {
    // SAFETY: an anonymous private mapping without MAP_FIXED never replaces existing
    // mappings; the hint is advisory.
    let ptr = unsafe {
        libc::mmap(
            hint as *mut c_void,
            len,
            Protection::STAGING.bits(),
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    NonNull::new(ptr.cast::<u8>()).ok_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable))
}

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size).unwrap_or(4096).max(1)
}

fn round_to_page(size: usize) -> usize {
    let page = page_size();
    size.div_ceil(page) * page
}

fn align_down(address: usize) -> usize {
    address & !(page_size() - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window() {
        assert_eq!(acceptable_window(0x1000, 0x2000, 0x2000), None);
        let (lower, upper) = acceptable_window(0x5000_0000, 0x5000_1000, 0x1000).unwrap();
        assert_eq!(upper, 0x4fff_f000);
        assert_eq!(lower, 0);
        let (lower, _) = acceptable_window(0x9000_0000, 0x9000_0000, 0x1000).unwrap();
        assert_eq!(lower, 0x9000_0000 - (REACH - 0x1000));
    }

    #[test]
    fn unanchored_region_lifecycle() {
        let mut region = ImageRegion::allocate(24, &[]).unwrap();
        assert_eq!(region.size(), 24);
        assert!(region.mapped_size() >= 24);
        assert_eq!(region.base() % page_size(), 0);
        assert!(region.contains(region.base() + 23));
        assert!(!region.contains(region.base() + 24));

        let staged: Vec<u8> = (0..24).collect();
        region.commit(&staged).unwrap();
        assert_eq!(region.protection(), Protection::SEALED);
        assert_eq!(region.as_slice(), &staged[..]);

        region.rewrite(&[(8, [0xaa_u8; 8])]).unwrap();
        assert_eq!(region.protection(), Protection::SEALED);
        assert_eq!(&region.as_slice()[8..16], &[0xaa; 8]);
        assert_eq!(region.as_slice()[16], 16);

        assert!(matches!(
            region.rewrite(&[(20, [0u8; 8])]),
            Err(Error::OutOfBounds)
        ));
        assert!(region.commit(&staged).is_err());
    }

    #[test]
    fn rewrite_ignores_record_alignment() {
        let mut region = ImageRegion::allocate(1024, &[]).unwrap();
        region.commit(&[0u8; 1024]).unwrap();

        // Offsets that are only 4-aligned, one of them crossing a cache line.
        let records = [(468, [0xe9_u8; 8]), (476, [0xe8; 8]), (508, [0xc2; 8])];
        region.rewrite(&records).unwrap();
        for (offset, record) in records {
            assert_eq!(&region.as_slice()[offset..offset + 8], &record);
        }
        assert_eq!(region.as_slice()[467], 0);
        assert_eq!(region.as_slice()[516], 0);
        assert_eq!(region.protection(), Protection::SEALED);
    }

    #[test]
    fn anchored_region_reaches_anchor() {
        static ANCHOR: [u8; 16] = [0; 16];
        let anchor = ANCHOR.as_ptr() as usize;
        let region = ImageRegion::allocate(4096, &[anchor]).unwrap();
        assert!(region.base() + region.mapped_size() <= anchor);
        assert!(anchor - region.base() <= REACH);
    }

    #[test]
    fn impossible_anchor() {
        let result = ImageRegion::allocate(0x10_000, &[0x100]);
        assert!(matches!(result, Err(Error::Placement { .. })));
    }
}

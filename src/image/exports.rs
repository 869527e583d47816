//! Read-back of a synthesized export directory.
//!
//! [`ExportView`] walks the export directory of a live [`SynthesizedImage`] the way a PE
//! loader resolving imports would: through the data directory, the export directory record
//! and the three tables it points at, adding every offset to the image base. Nothing is
//! taken from the module descriptor, so the view checks what was actually written.

use std::ffi::{c_char, CStr};

use crate::{
    image::{
        io::read_le,
        layout::{read_export_data_directory, DosHeader, ExportDirectory},
        SynthesizedImage,
    },
    Error, Result,
};

/// One entry of the export table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportEntry {
    /// Biased ordinal
    pub ordinal: u32,
    /// Exported name, if any name points at this function
    pub name: Option<String>,
    /// Value of the function slot, zero for an unimplemented function
    pub rva: u32,
}

impl ExportEntry {
    /// Returns `true` if the function slot is empty.
    #[must_use]
    pub fn is_unimplemented(&self) -> bool {
        self.rva == 0
    }
}

/// Export directory of a synthesized image, read through the image's own offsets.
pub struct ExportView<'a> {
    image: &'a SynthesizedImage,
    directory: ExportDirectory,
}

impl<'a> ExportView<'a> {
    /// Locates the export directory of `image` through its headers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Malformed`] if the headers are not ones this crate writes or the
    /// directory lies outside the image, and [`Error::OutOfBounds`] for truncated headers.
    pub fn new(image: &'a SynthesizedImage) -> Result<Self> {
        let bytes = image.bytes();
        let dos = DosHeader::read(bytes, 0)?;
        if dos.magic != goblin::pe::header::DOS_MAGIC {
            return Err(malformed_error!("Bad DOS magic {:#x}", dos.magic));
        }

        let (_, rva, size) = read_export_data_directory(bytes, dos.pe_offset as usize)?;
        if rva == 0 || (rva as usize).saturating_add(size as usize) > bytes.len() {
            return Err(malformed_error!(
                "Export directory {:#x}+{:#x} outside of image",
                rva,
                size
            ));
        }

        let directory = ExportDirectory::read(bytes, rva as usize)?;
        Ok(ExportView { image, directory })
    }

    /// The export directory record.
    #[must_use]
    pub fn directory(&self) -> &ExportDirectory {
        &self.directory
    }

    /// The module name the directory points at.
    #[must_use]
    pub fn module_name(&self) -> &'a CStr {
        // SAFETY: the name offset was computed from a `'static` C string of the descriptor
        // this image was built from.
        unsafe { self.c_str(self.directory.name) }
    }

    /// Value of function slot `index` (unbiased).
    #[must_use]
    pub fn function_rva(&self, index: usize) -> Option<u32> {
        if index >= self.directory.number_of_functions as usize {
            return None;
        }
        read_le(
            self.image.bytes(),
            self.directory.address_of_functions as usize + index * 4,
        )
        .ok()
    }

    /// Absolute address stored in function slot `index`, `None` for an empty slot.
    #[must_use]
    pub fn function_address(&self, index: usize) -> Option<usize> {
        self.function_rva(index)
            .filter(|&rva| rva != 0)
            .map(|rva| self.image.base() + rva as usize)
    }

    /// Name and function index of every named export, in name table order.
    ///
    /// Empty name slots are skipped.
    pub fn names(&self) -> impl Iterator<Item = (&'a CStr, usize)> + '_ {
        (0..self.directory.number_of_names as usize).filter_map(move |j| {
            let rva: u32 = read_le(
                self.image.bytes(),
                self.directory.address_of_names as usize + j * 4,
            )
            .ok()?;
            if rva == 0 {
                return None;
            }
            // SAFETY: non-empty name slots hold offsets of `'static` descriptor strings.
            let name = unsafe { self.c_str(rva) };
            Some((name, usize::from(self.ordinal_at(j))))
        })
    }

    /// Function index exported under `name`, compared exactly.
    #[must_use]
    pub fn lookup_name(&self, name: &str) -> Option<usize> {
        self.names()
            .find(|(candidate, _)| candidate.to_bytes() == name.as_bytes())
            .map(|(_, index)| index)
    }

    /// Function index of the biased `ordinal`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SymbolNotFound`] if the ordinal is outside the function table.
    pub fn index_of_ordinal(&self, ordinal: u32) -> Result<usize> {
        ordinal
            .checked_sub(self.directory.base)
            .filter(|&index| index < self.directory.number_of_functions)
            .map(|index| index as usize)
            .ok_or_else(|| {
                Error::SymbolNotFound(format!(
                    "{}.{}",
                    self.module_name().to_string_lossy(),
                    ordinal
                ))
            })
    }

    /// Every function slot with its biased ordinal and first name.
    #[must_use]
    pub fn entries(&self) -> Vec<ExportEntry> {
        let mut entries: Vec<ExportEntry> = (0..self.directory.number_of_functions as usize)
            .map(|index| ExportEntry {
                ordinal: self.directory.base.wrapping_add(index as u32),
                name: None,
                rva: self.function_rva(index).unwrap_or(0),
            })
            .collect();

        for (name, index) in self.names() {
            if let Some(entry) = entries.get_mut(index) {
                entry
                    .name
                    .get_or_insert_with(|| name.to_string_lossy().into_owned());
            }
        }
        entries
    }

    fn ordinal_at(&self, j: usize) -> u16 {
        let address =
            self.image.base() + self.directory.address_of_name_ordinals as usize + j * 2;
        // SAFETY: the ordinal table offset points at the descriptor's `'static` ordinal
        // table, which has one entry per name.
        unsafe { (address as *const u16).read_unaligned() }
    }

    /// # Safety
    ///
    /// `rva` must be the offset of a NUL-terminated string that outlives `'a`.
    unsafe fn c_str(&self, rva: u32) -> &'a CStr {
        let address = self.image.base() + rva as usize;
        unsafe { CStr::from_ptr(address as *const c_char) }
    }
}

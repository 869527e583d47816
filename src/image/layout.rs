//! PE structures of a synthesized image and their placement.
//!
//! A synthesized image is one contiguous block:
//!
//! ```text
//! +--------------------------+ 0
//! | DOS header               | 64 bytes, e_lfanew -> NT headers
//! | NT headers               | signature + COFF header + optional header
//! | section headers (2)      | .edata, .code
//! +--------------------------+ SizeOfHeaders
//! | export directory         | 40 bytes
//! | function table           | 4 bytes per function
//! | name pointer table       | 4 bytes per name
//! +--------------------------+
//! | relay stubs (optional)   | 8 bytes per function
//! +--------------------------+ SizeOfImage
//! ```
//!
//! Every offset written into these structures is relative to the first byte of the block.
//! The ordinal table and all strings are not part of the block; their offsets point at the
//! module descriptor's static data.

use bitflags::bitflags;
use goblin::pe::{characteristic, header, optional_header, section_table};
use strum::{Display, FromRepr};

use crate::{
    image::io::{read_le_at, write_bytes_at, write_le_at},
    relay::STUB_SIZE,
    Result,
};

/// Size of the DOS header.
pub const DOS_HEADER_SIZE: usize = 64;
/// Size of the `PE\0\0` signature.
pub const PE_SIGNATURE_SIZE: usize = 4;
/// Size of the COFF file header.
pub const COFF_HEADER_SIZE: usize = 20;
/// Size of a PE32 optional header with all data directories.
pub const OPTIONAL_HEADER32_SIZE: usize = 224;
/// Size of a PE32+ optional header with all data directories.
pub const OPTIONAL_HEADER64_SIZE: usize = 240;
/// Size of one section header.
pub const SECTION_HEADER_SIZE: usize = 40;
/// Size of the export directory.
pub const EXPORT_DIRECTORY_SIZE: usize = 40;
/// Number of data directory entries.
pub const NUMBER_OF_DIRECTORY_ENTRIES: u32 = 16;
/// Section count of every synthesized image.
pub const SECTION_COUNT: u16 = 2;
/// Size of one entry of the function or name pointer table.
pub const TABLE_ENTRY_SIZE: usize = 4;
/// Offset of `e_lfanew` inside the DOS header.
const E_LFANEW_OFFSET: usize = 0x3c;
/// Index of the export table among the data directories.
const EXPORT_DIRECTORY_INDEX: usize = 0;

/// Target instruction set recorded in the COFF header.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u16)]
pub enum Machine {
    /// 32-bit x86, PE32 optional header
    #[strum(serialize = "i386")]
    I386 = header::COFF_MACHINE_X86,
    /// x86-64, PE32+ optional header
    #[strum(serialize = "amd64")]
    Amd64 = header::COFF_MACHINE_X86_64,
    /// AArch64, PE32+ optional header
    #[strum(serialize = "arm64")]
    Arm64 = header::COFF_MACHINE_ARM64,
}

impl Machine {
    /// The machine this crate was compiled for.
    #[must_use]
    pub const fn host() -> Self {
        if cfg!(target_arch = "x86") {
            Machine::I386
        } else if cfg!(target_arch = "aarch64") {
            Machine::Arm64
        } else {
            Machine::Amd64
        }
    }

    /// Returns `true` when images for this machine use the PE32+ optional header.
    #[must_use]
    pub const fn is_pe32_plus(self) -> bool {
        !matches!(self, Machine::I386)
    }

    /// Size of the optional header for this machine.
    #[must_use]
    pub const fn optional_header_size(self) -> usize {
        if self.is_pe32_plus() {
            OPTIONAL_HEADER64_SIZE
        } else {
            OPTIONAL_HEADER32_SIZE
        }
    }

    /// Size of signature, COFF header and optional header together.
    #[must_use]
    pub const fn nt_headers_size(self) -> usize {
        PE_SIGNATURE_SIZE + COFF_HEADER_SIZE + self.optional_header_size()
    }
}

bitflags! {
    /// Section characteristics used by synthesized images.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionFlags: u32 {
        /// Section contains initialized data
        const CNT_INITIALIZED_DATA = section_table::IMAGE_SCN_CNT_INITIALIZED_DATA;
        /// Section can be executed
        const MEM_EXECUTE = section_table::IMAGE_SCN_MEM_EXECUTE;
        /// Section can be read
        const MEM_READ = section_table::IMAGE_SCN_MEM_READ;
        /// Section can be written
        const MEM_WRITE = section_table::IMAGE_SCN_MEM_WRITE;
    }
}

/// Byte offsets of every part of a synthesized image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLayout {
    /// Instruction set the headers are written for
    pub machine: Machine,
    /// Offset of the NT headers
    pub nt_headers: usize,
    /// Offset of the first section header
    pub section_headers: usize,
    /// Offset of the export directory, equal to `SizeOfHeaders`
    pub export_directory: usize,
    /// Offset of the function table
    pub functions: usize,
    /// Offset of the name pointer table
    pub names: usize,
    /// Offset of the stub array; equal to `size` when no stubs are reserved
    pub stubs: usize,
    /// Number of function slots
    pub function_count: usize,
    /// Number of name slots
    pub name_count: usize,
    /// Number of reserved stub records, zero or `function_count`
    pub stub_count: usize,
    /// Total image size, `SizeOfImage`
    pub size: usize,
}

impl ImageLayout {
    /// Computes the layout for `function_count` functions and `name_count` names, with one
    /// stub record per function when `with_stubs` is set.
    #[must_use]
    pub fn new(machine: Machine, function_count: usize, name_count: usize, with_stubs: bool) -> Self {
        let nt_headers = DOS_HEADER_SIZE;
        let section_headers = nt_headers + machine.nt_headers_size();
        let export_directory = section_headers + usize::from(SECTION_COUNT) * SECTION_HEADER_SIZE;
        let functions = export_directory + EXPORT_DIRECTORY_SIZE;
        let names = functions + function_count * TABLE_ENTRY_SIZE;
        let stubs = names + name_count * TABLE_ENTRY_SIZE;
        let stub_count = if with_stubs { function_count } else { 0 };
        let size = stubs + stub_count * STUB_SIZE;

        ImageLayout {
            machine,
            nt_headers,
            section_headers,
            export_directory,
            functions,
            names,
            stubs,
            function_count,
            name_count,
            stub_count,
            size,
        }
    }

    /// Size of all fixed headers and the export directory record.
    #[must_use]
    pub fn fixed_size(&self) -> usize {
        self.functions
    }

    /// Size of the export data: directory, function table and name pointer table.
    #[must_use]
    pub fn export_size(&self) -> usize {
        self.stubs - self.export_directory
    }

    /// Size of the stub array.
    #[must_use]
    pub fn code_size(&self) -> usize {
        self.stub_count * STUB_SIZE
    }

    /// Offset of the function table entry for `index`.
    #[must_use]
    pub fn function_slot(&self, index: usize) -> usize {
        self.functions + index * TABLE_ENTRY_SIZE
    }

    /// Offset of the name table entry for `index`.
    #[must_use]
    pub fn name_slot(&self, index: usize) -> usize {
        self.names + index * TABLE_ENTRY_SIZE
    }

    /// Offset of the stub record for function `index`.
    #[must_use]
    pub fn stub_slot(&self, index: usize) -> usize {
        self.stubs + index * STUB_SIZE
    }
}

/// The DOS header; only the magic and `e_lfanew` are populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DosHeader {
    /// `MZ`
    pub magic: u16,
    /// Offset of the NT headers
    pub pe_offset: u32,
}

impl DosHeader {
    /// Writes the header at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if `data` is too short.
    pub fn write(&self, data: &mut [u8], offset: usize) -> Result<()> {
        let mut cursor = offset;
        write_le_at(data, &mut cursor, self.magic)?;
        let mut cursor = offset + E_LFANEW_OFFSET;
        write_le_at(data, &mut cursor, self.pe_offset)
    }

    /// Reads the header at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if `data` is too short.
    pub fn read(data: &[u8], offset: usize) -> Result<Self> {
        let mut cursor = offset;
        let magic = read_le_at(data, &mut cursor)?;
        let mut cursor = offset + E_LFANEW_OFFSET;
        let pe_offset = read_le_at(data, &mut cursor)?;
        Ok(DosHeader { magic, pe_offset })
    }
}

/// Signature, COFF header and optional header of a synthesized image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NtHeaders {
    /// Instruction set, selects PE32 or PE32+
    pub machine: Machine,
    /// Number of section headers
    pub number_of_sections: u16,
    /// COFF characteristics
    pub characteristics: u16,
    /// Offset of the entry point, zero when there is none
    pub entry_point: u32,
    /// Address the image lives at
    pub image_base: u64,
    /// `SizeOfImage`
    pub size_of_image: u32,
    /// `SizeOfHeaders`
    pub size_of_headers: u32,
    /// Export data directory (offset, size)
    pub export_directory: (u32, u32),
}

impl NtHeaders {
    /// `SizeOfCode` of every synthesized image.
    pub const SIZE_OF_CODE: u32 = 0x1000;
    /// Section and file alignment of every synthesized image.
    pub const ALIGNMENT: u32 = 0x1000;

    /// Writes signature, COFF header and optional header at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if `data` is too short.
    pub fn write(&self, data: &mut [u8], offset: usize) -> Result<()> {
        let plus = self.machine.is_pe32_plus();
        let mut cursor = offset;

        write_le_at(data, &mut cursor, header::PE_MAGIC)?;

        // COFF file header
        write_le_at(data, &mut cursor, self.machine as u16)?;
        write_le_at(data, &mut cursor, self.number_of_sections)?;
        write_le_at(data, &mut cursor, 0_u32)?; // TimeDateStamp
        write_le_at(data, &mut cursor, 0_u32)?; // PointerToSymbolTable
        write_le_at(data, &mut cursor, 0_u32)?; // NumberOfSymbols
        write_le_at(data, &mut cursor, self.machine.optional_header_size() as u16)?;
        write_le_at(data, &mut cursor, self.characteristics)?;

        // Standard fields
        let magic = if plus {
            optional_header::MAGIC_64
        } else {
            optional_header::MAGIC_32
        };
        write_le_at(data, &mut cursor, magic)?;
        write_le_at(data, &mut cursor, 0_u8)?; // MajorLinkerVersion
        write_le_at(data, &mut cursor, 0_u8)?; // MinorLinkerVersion
        write_le_at(data, &mut cursor, Self::SIZE_OF_CODE)?;
        write_le_at(data, &mut cursor, 0_u32)?; // SizeOfInitializedData
        write_le_at(data, &mut cursor, 0_u32)?; // SizeOfUninitializedData
        write_le_at(data, &mut cursor, self.entry_point)?;
        write_le_at(data, &mut cursor, 0_u32)?; // BaseOfCode
        if plus {
            write_le_at(data, &mut cursor, self.image_base)?;
        } else {
            write_le_at(data, &mut cursor, 0_u32)?; // BaseOfData
            write_le_at(data, &mut cursor, self.image_base as u32)?;
        }

        // Windows fields
        write_le_at(data, &mut cursor, Self::ALIGNMENT)?; // SectionAlignment
        write_le_at(data, &mut cursor, Self::ALIGNMENT)?; // FileAlignment
        write_le_at(data, &mut cursor, 1_u16)?; // MajorOperatingSystemVersion
        write_le_at(data, &mut cursor, 0_u16)?; // MinorOperatingSystemVersion
        write_le_at(data, &mut cursor, 0_u16)?; // MajorImageVersion
        write_le_at(data, &mut cursor, 0_u16)?; // MinorImageVersion
        write_le_at(data, &mut cursor, 4_u16)?; // MajorSubsystemVersion
        write_le_at(data, &mut cursor, 0_u16)?; // MinorSubsystemVersion
        write_le_at(data, &mut cursor, 0_u32)?; // Win32VersionValue
        write_le_at(data, &mut cursor, self.size_of_image)?;
        write_le_at(data, &mut cursor, self.size_of_headers)?;
        write_le_at(data, &mut cursor, 0_u32)?; // CheckSum
        write_le_at(data, &mut cursor, 0_u16)?; // Subsystem
        write_le_at(data, &mut cursor, 0_u16)?; // DllCharacteristics
        for _ in 0..4 {
            // Stack and heap reserve / commit
            if plus {
                write_le_at(data, &mut cursor, 0_u64)?;
            } else {
                write_le_at(data, &mut cursor, 0_u32)?;
            }
        }
        write_le_at(data, &mut cursor, 0_u32)?; // LoaderFlags
        write_le_at(data, &mut cursor, NUMBER_OF_DIRECTORY_ENTRIES)?;

        // Data directories, only the export table is present
        for index in 0..NUMBER_OF_DIRECTORY_ENTRIES as usize {
            let (rva, size) = if index == EXPORT_DIRECTORY_INDEX {
                self.export_directory
            } else {
                (0, 0)
            };
            write_le_at(data, &mut cursor, rva)?;
            write_le_at(data, &mut cursor, size)?;
        }

        debug_assert_eq!(cursor - offset, self.machine.nt_headers_size());
        Ok(())
    }
}

/// The export data directory entry of the NT headers at `offset`.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if `data` is too short, or
/// [`crate::Error::Malformed`] if the machine or signature is not one this crate writes.
pub fn read_export_data_directory(data: &[u8], offset: usize) -> Result<(Machine, u32, u32)> {
    let mut cursor = offset;
    let signature: u32 = read_le_at(data, &mut cursor)?;
    if signature != header::PE_MAGIC {
        return Err(malformed_error!("Bad PE signature {:#x}", signature));
    }

    let raw_machine: u16 = read_le_at(data, &mut cursor)?;
    let machine = Machine::from_repr(raw_machine)
        .ok_or_else(|| malformed_error!("Unsupported machine {:#x}", raw_machine))?;

    let optional = offset + PE_SIGNATURE_SIZE + COFF_HEADER_SIZE;
    let mut cursor = optional + machine.optional_header_size()
        - NUMBER_OF_DIRECTORY_ENTRIES as usize * 8;
    let rva = read_le_at(data, &mut cursor)?;
    let size = read_le_at(data, &mut cursor)?;
    Ok((machine, rva, size))
}

/// Characteristics of a synthesized DLL image.
#[must_use]
pub fn dll_characteristics() -> u16 {
    characteristic::IMAGE_FILE_DLL
}

/// One section header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionHeader {
    /// Zero-padded section name
    pub name: [u8; 8],
    /// `Misc.VirtualSize`
    pub virtual_size: u32,
    /// Offset of the section inside the image
    pub virtual_address: u32,
    /// `SizeOfRawData`
    pub size_of_raw_data: u32,
    /// `PointerToRawData`, equal to `virtual_address` in a synthesized image
    pub pointer_to_raw_data: u32,
    /// Section characteristics
    pub characteristics: SectionFlags,
}

impl SectionHeader {
    /// A section covering `size` bytes at `offset`, as laid out in memory.
    #[must_use]
    pub fn new(name: &str, offset: u32, size: u32, characteristics: SectionFlags) -> Self {
        let mut raw = [0u8; 8];
        let len = name.len().min(raw.len());
        raw[..len].copy_from_slice(&name.as_bytes()[..len]);
        SectionHeader {
            name: raw,
            virtual_size: size,
            virtual_address: offset,
            size_of_raw_data: size,
            pointer_to_raw_data: offset,
            characteristics,
        }
    }

    /// The section name without padding.
    #[must_use]
    pub fn name(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        std::str::from_utf8(&self.name[..end]).unwrap_or("")
    }

    /// Returns `true` if `offset` lies inside the section's virtual range.
    #[must_use]
    pub fn contains(&self, offset: u32) -> bool {
        offset >= self.virtual_address && offset - self.virtual_address < self.virtual_size
    }

    /// Writes the header at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if `data` is too short.
    pub fn write(&self, data: &mut [u8], offset: usize) -> Result<()> {
        let mut cursor = offset;
        write_bytes_at(data, &mut cursor, &self.name)?;
        write_le_at(data, &mut cursor, self.virtual_size)?;
        write_le_at(data, &mut cursor, self.virtual_address)?;
        write_le_at(data, &mut cursor, self.size_of_raw_data)?;
        write_le_at(data, &mut cursor, self.pointer_to_raw_data)?;
        write_le_at(data, &mut cursor, 0_u32)?; // PointerToRelocations
        write_le_at(data, &mut cursor, 0_u32)?; // PointerToLinenumbers
        write_le_at(data, &mut cursor, 0_u16)?; // NumberOfRelocations
        write_le_at(data, &mut cursor, 0_u16)?; // NumberOfLinenumbers
        write_le_at(data, &mut cursor, self.characteristics.bits())
    }

    /// Reads the header at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if `data` is too short.
    pub fn read(data: &[u8], offset: usize) -> Result<Self> {
        let name_end = offset.checked_add(8).ok_or(crate::Error::OutOfBounds)?;
        let name: [u8; 8] = data
            .get(offset..name_end)
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or(crate::Error::OutOfBounds)?;

        let mut cursor = name_end;
        let virtual_size = read_le_at(data, &mut cursor)?;
        let virtual_address = read_le_at(data, &mut cursor)?;
        let size_of_raw_data = read_le_at(data, &mut cursor)?;
        let pointer_to_raw_data = read_le_at(data, &mut cursor)?;
        cursor += 12;
        let characteristics: u32 = read_le_at(data, &mut cursor)?;

        Ok(SectionHeader {
            name,
            virtual_size,
            virtual_address,
            size_of_raw_data,
            pointer_to_raw_data,
            characteristics: SectionFlags::from_bits_retain(characteristics),
        })
    }
}

/// The export directory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExportDirectory {
    /// Offset of the module name string
    pub name: u32,
    /// Ordinal base
    pub base: u32,
    /// Entries in the function table
    pub number_of_functions: u32,
    /// Entries in the name pointer and ordinal tables
    pub number_of_names: u32,
    /// Offset of the function table
    pub address_of_functions: u32,
    /// Offset of the name pointer table
    pub address_of_names: u32,
    /// Offset of the ordinal table
    pub address_of_name_ordinals: u32,
}

impl ExportDirectory {
    /// Writes the record at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if `data` is too short.
    pub fn write(&self, data: &mut [u8], offset: usize) -> Result<()> {
        let mut cursor = offset;
        write_le_at(data, &mut cursor, 0_u32)?; // Characteristics
        write_le_at(data, &mut cursor, 0_u32)?; // TimeDateStamp
        write_le_at(data, &mut cursor, 0_u16)?; // MajorVersion
        write_le_at(data, &mut cursor, 0_u16)?; // MinorVersion
        write_le_at(data, &mut cursor, self.name)?;
        write_le_at(data, &mut cursor, self.base)?;
        write_le_at(data, &mut cursor, self.number_of_functions)?;
        write_le_at(data, &mut cursor, self.number_of_names)?;
        write_le_at(data, &mut cursor, self.address_of_functions)?;
        write_le_at(data, &mut cursor, self.address_of_names)?;
        write_le_at(data, &mut cursor, self.address_of_name_ordinals)
    }

    /// Reads the record at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if `data` is too short.
    pub fn read(data: &[u8], offset: usize) -> Result<Self> {
        let mut cursor = offset.checked_add(12).ok_or(crate::Error::OutOfBounds)?;
        Ok(ExportDirectory {
            name: read_le_at(data, &mut cursor)?,
            base: read_le_at(data, &mut cursor)?,
            number_of_functions: read_le_at(data, &mut cursor)?,
            number_of_names: read_le_at(data, &mut cursor)?,
            address_of_functions: read_le_at(data, &mut cursor)?,
            address_of_names: read_le_at(data, &mut cursor)?,
            address_of_name_ordinals: read_le_at(data, &mut cursor)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_sizes() {
        assert_eq!(Machine::I386.nt_headers_size(), 248);
        assert_eq!(Machine::Amd64.nt_headers_size(), 264);
        assert!(!Machine::I386.is_pe32_plus());
        assert!(Machine::Arm64.is_pe32_plus());
    }

    #[test]
    fn layout_offsets_i386() {
        let layout = ImageLayout::new(Machine::I386, 3, 2, true);
        assert_eq!(layout.nt_headers, 64);
        assert_eq!(layout.section_headers, 312);
        assert_eq!(layout.export_directory, 392);
        assert_eq!(layout.functions, 432);
        assert_eq!(layout.names, 444);
        assert_eq!(layout.stubs, 452);
        assert_eq!(layout.size, 452 + 3 * 8);
        assert_eq!(layout.export_size(), 40 + 12 + 8);
        assert_eq!(layout.code_size(), 24);
        assert_eq!(layout.stub_slot(2), 452 + 16);
    }

    #[test]
    fn layout_without_stubs() {
        let layout = ImageLayout::new(Machine::Amd64, 4, 1, false);
        assert_eq!(layout.fixed_size(), 64 + 264 + 80 + 40);
        assert_eq!(layout.stub_count, 0);
        assert_eq!(layout.size, layout.stubs);
        assert_eq!(layout.size, layout.fixed_size() + 4 * 4 + 4);
    }

    #[test]
    fn section_header_roundtrip() {
        let flags = SectionFlags::CNT_INITIALIZED_DATA | SectionFlags::MEM_READ;
        let section = SectionHeader::new(".edata", 0x1b0, 0x40, flags);
        let mut data = [0u8; SECTION_HEADER_SIZE];
        section.write(&mut data, 0).unwrap();
        assert_eq!(&data[..8], b".edata\0\0");
        let read = SectionHeader::read(&data, 0).unwrap();
        assert_eq!(read, section);
        assert_eq!(read.name(), ".edata");
        assert!(read.contains(0x1b0));
        assert!(read.contains(0x1ef));
        assert!(!read.contains(0x1f0));
    }

    #[test]
    fn nt_headers_expose_export_directory() {
        for machine in [Machine::I386, Machine::Amd64] {
            let headers = NtHeaders {
                machine,
                number_of_sections: SECTION_COUNT,
                characteristics: dll_characteristics(),
                entry_point: 0,
                image_base: 0x1000_0000,
                size_of_image: 0x200,
                size_of_headers: 0x188,
                export_directory: (0x188, 0x30),
            };
            let mut data = vec![0u8; machine.nt_headers_size()];
            headers.write(&mut data, 0).unwrap();
            let (read_machine, rva, size) = read_export_data_directory(&data, 0).unwrap();
            assert_eq!(read_machine, machine);
            assert_eq!((rva, size), (0x188, 0x30));
        }
    }

    #[test]
    fn export_directory_roundtrip() {
        let directory = ExportDirectory {
            name: 0x10,
            base: 1,
            number_of_functions: 2,
            number_of_names: 2,
            address_of_functions: 0x1b0,
            address_of_names: 0x1b8,
            address_of_name_ordinals: 0x2000,
        };
        let mut data = [0u8; EXPORT_DIRECTORY_SIZE];
        directory.write(&mut data, 0).unwrap();
        assert_eq!(ExportDirectory::read(&data, 0).unwrap(), directory);
    }
}

//! Synthesis of in-memory PE images for built-in modules.
//!
//! [`synthesize`] turns a [`ModuleDescriptor`] into a [`SynthesizedImage`]: a mapped,
//! read+execute block holding PE headers, an export directory whose tables point at the
//! module's functions and names, and optionally one relay stub per function. The layout is
//! described in [`crate::image::layout`].
//!
//! The image is staged in an ordinary buffer by an [`ImageBuilder`] that already knows the
//! final base address. Every address it embeds goes through [`ImageBuilder::rva`], which
//! refuses anything that does not fit a 32-bit offset from that base, so a finished image
//! never carries a truncated offset.

use std::{ffi::CStr, ops::Range};

use log::{debug, info};

use crate::{
    builtin::ModuleDescriptor,
    config::RelayConfig,
    image::{
        io::write_le_at,
        layout::{
            dll_characteristics, DosHeader, ExportDirectory, ImageLayout, Machine, NtHeaders,
            SectionFlags, SectionHeader, SECTION_COUNT, SECTION_HEADER_SIZE,
        },
        region::ImageRegion,
    },
    relay::{ArgCode, DispatchMode, StubRecord, StubSlot, STUB_SIZE},
    Error, Result,
};

/// Name of the export data section.
pub const EXPORT_SECTION_NAME: &str = ".edata";
/// Name of the relay stub section.
pub const CODE_SECTION_NAME: &str = ".code";

/// A built-in module materialized as a PE image in executable memory.
///
/// The image never moves. Apart from [`SynthesizedImage::reencode`], nothing writes to it
/// after synthesis.
#[derive(Debug)]
pub struct SynthesizedImage {
    descriptor: &'static ModuleDescriptor,
    region: ImageRegion,
    layout: ImageLayout,
    stub_slots: Vec<StubSlot>,
}

impl SynthesizedImage {
    /// Descriptor the image was built from.
    #[must_use]
    pub fn descriptor(&self) -> &'static ModuleDescriptor {
        self.descriptor
    }

    /// Address of the image, also its module handle.
    #[must_use]
    pub fn base(&self) -> usize {
        self.region.base()
    }

    /// `SizeOfImage`.
    #[must_use]
    pub fn size(&self) -> usize {
        self.layout.size
    }

    /// Offsets of every structure inside the image.
    #[must_use]
    pub fn layout(&self) -> &ImageLayout {
        &self.layout
    }

    /// All image bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        self.region.as_slice()
    }

    /// The header bytes: DOS header, NT headers and section headers.
    #[must_use]
    pub fn headers(&self) -> &[u8] {
        &self.bytes()[..self.layout.export_directory]
    }

    /// Returns `true` if the image was built with a stub array.
    #[must_use]
    pub fn is_relay_capable(&self) -> bool {
        self.layout.stub_count > 0
    }

    /// Absolute address range of the stub array, empty when the image has none.
    #[must_use]
    pub fn stub_range(&self) -> Range<usize> {
        let start = self.base() + self.layout.stubs;
        start..start + self.layout.code_size()
    }

    /// What occupies each function's stub record.
    #[must_use]
    pub fn stub_slots(&self) -> &[StubSlot] {
        &self.stub_slots
    }

    /// Address of the stub record of function `index`, if the image has a stub array.
    #[must_use]
    pub fn stub_address(&self, index: usize) -> Option<usize> {
        (index < self.layout.stub_count).then(|| self.base() + self.layout.stub_slot(index))
    }

    /// Maps an address inside the stub array back to its function index.
    ///
    /// Any address inside a record maps to that record, so both the stub's own address and
    /// the return address pushed by its `call` resolve.
    #[must_use]
    pub fn stub_index(&self, address: usize) -> Option<usize> {
        let range = self.stub_range();
        range
            .contains(&address)
            .then(|| (address - range.start) / STUB_SIZE)
    }

    /// Decodes the stub record of function `index`.
    #[must_use]
    pub fn read_stub(&self, index: usize) -> Option<StubRecord> {
        if index >= self.layout.stub_count {
            return None;
        }
        let offset = self.layout.stub_slot(index);
        let bytes: [u8; STUB_SIZE] = self.bytes()[offset..offset + STUB_SIZE].try_into().ok()?;
        Some(StubRecord::decode(bytes))
    }

    /// The address stored in function slot `index`, zero for an empty slot.
    #[must_use]
    pub fn function_address(&self, index: usize) -> Option<usize> {
        if index >= self.layout.function_count {
            return None;
        }
        let rva = crate::image::io::read_le::<u32>(self.bytes(), self.layout.function_slot(index))
            .ok()?;
        Some(if rva == 0 { 0 } else { self.base() + rva as usize })
    }

    /// Rewrites every switchable stub into `mode`.
    ///
    /// Register and absent slots are left alone, as are stubs already in `mode`. All records
    /// are re-encoded before any of them is written, and written in one pass while the image
    /// is briefly writable. Returns the number of stubs that changed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `mode` is [`DispatchMode::Traced`] without a trampoline,
    /// [`Error::OffsetOverflow`] if a target is out of reach, or [`Error::Protection`] if the
    /// image cannot be made writable.
    pub fn reencode(&mut self, mode: DispatchMode, trampoline: Option<usize>) -> Result<usize> {
        let trampoline = match (mode, trampoline) {
            (DispatchMode::Traced, None) => {
                return Err(Error::Config(
                    "relay tracing requires a trampoline address".to_string(),
                ))
            }
            (_, trampoline) => trampoline.unwrap_or(0),
        };

        let mut records = Vec::new();
        for (index, slot) in self.stub_slots.iter().enumerate() {
            let StubSlot::Dispatch(current) = *slot else {
                continue;
            };
            if current == mode {
                continue;
            }
            let (Some(function), Some(ArgCode::Normal { words, caller_pops })) = (
                self.descriptor.function(index),
                self.descriptor.arg_code(index).map(ArgCode::classify),
            ) else {
                continue;
            };

            let stub = self.base() + self.layout.stub_slot(index);
            let record =
                StubRecord::for_mode(mode, stub, function as usize, trampoline, words, caller_pops)?;
            records.push((index, record));
        }

        let writes: Vec<(usize, [u8; STUB_SIZE])> = records
            .iter()
            .map(|(index, record)| (self.layout.stub_slot(*index), record.encode()))
            .collect();
        self.region.rewrite(&writes)?;

        for (index, _) in &records {
            self.stub_slots[*index] = StubSlot::Dispatch(mode);
        }
        debug!(
            "{}: {} stub(s) switched to {mode}",
            self.descriptor.module_name(),
            records.len()
        );
        Ok(records.len())
    }
}

/// Stages image bytes for a known base address.
pub struct ImageBuilder {
    base: usize,
    layout: ImageLayout,
    data: Vec<u8>,
}

impl ImageBuilder {
    /// Creates a zeroed staging buffer for an image that will live at `base`.
    #[must_use]
    pub fn new(base: usize, layout: ImageLayout) -> Self {
        ImageBuilder {
            base,
            layout,
            data: vec![0; layout.size],
        }
    }

    /// Offset of `address` from the image base.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OffsetOverflow`] if `address` is below the base or more than
    /// `u32::MAX` bytes above it.
    pub fn rva(&self, address: usize, what: &'static str) -> Result<u32> {
        address
            .checked_sub(self.base)
            .and_then(|offset| u32::try_from(offset).ok())
            .ok_or(Error::OffsetOverflow {
                what,
                target: address,
                base: self.base,
            })
    }

    /// Offset of a structure inside the image itself.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OffsetOverflow`] if the image is larger than 4 GiB.
    pub fn local(&self, offset: usize, what: &'static str) -> Result<u32> {
        self.rva(self.base + offset, what)
    }

    /// Writes DOS header, NT headers and both section headers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OffsetOverflow`] if an offset does not fit 32 bits.
    pub fn write_headers(&mut self, entry_point: u32) -> Result<()> {
        let layout = self.layout;
        let export_rva = self.local(layout.export_directory, "export directory")?;
        let export_size = self.local(layout.export_size(), "export size")?;
        let code_rva = self.local(layout.stubs, "code section")?;
        let code_size = self.local(layout.code_size(), "code size")?;

        DosHeader {
            magic: goblin::pe::header::DOS_MAGIC,
            pe_offset: self.local(layout.nt_headers, "NT headers")?,
        }
        .write(&mut self.data, 0)?;

        NtHeaders {
            machine: layout.machine,
            number_of_sections: SECTION_COUNT,
            characteristics: dll_characteristics(),
            entry_point,
            image_base: self.base as u64,
            size_of_image: self.local(layout.size, "image size")?,
            size_of_headers: export_rva,
            export_directory: (export_rva, export_size),
        }
        .write(&mut self.data, layout.nt_headers)?;

        SectionHeader::new(
            EXPORT_SECTION_NAME,
            export_rva,
            export_size,
            SectionFlags::CNT_INITIALIZED_DATA
                | SectionFlags::MEM_EXECUTE
                | SectionFlags::MEM_READ
                | SectionFlags::MEM_WRITE,
        )
        .write(&mut self.data, layout.section_headers)?;

        SectionHeader::new(
            CODE_SECTION_NAME,
            code_rva,
            code_size,
            SectionFlags::CNT_INITIALIZED_DATA | SectionFlags::MEM_EXECUTE | SectionFlags::MEM_READ,
        )
        .write(&mut self.data, layout.section_headers + SECTION_HEADER_SIZE)
    }

    /// Writes the export directory record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OffsetOverflow`] if the module name or ordinal table is out of reach.
    pub fn write_export_directory(&mut self, descriptor: &ModuleDescriptor) -> Result<()> {
        let layout = self.layout;
        let ordinals = if descriptor.ordinals.is_empty() {
            0
        } else {
            self.rva(descriptor.ordinals.as_ptr() as usize, "ordinal table")?
        };

        ExportDirectory {
            name: self.rva(descriptor.name.as_ptr() as usize, "module name")?,
            base: descriptor.base,
            number_of_functions: self.local(layout.function_count, "function count")?,
            number_of_names: self.local(layout.name_count, "name count")?,
            address_of_functions: self.local(layout.functions, "function table")?,
            address_of_names: self.local(layout.names, "name table")?,
            address_of_name_ordinals: ordinals,
        }
        .write(&mut self.data, layout.export_directory)
    }

    /// Stores `rva` in function slot `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] if `index` is past the function table.
    pub fn set_function(&mut self, index: usize, rva: u32) -> Result<()> {
        if index >= self.layout.function_count {
            return Err(Error::OutOfBounds);
        }
        let mut offset = self.layout.function_slot(index);
        write_le_at(&mut self.data, &mut offset, rva)
    }

    /// Stores the offset of `name` in name slot `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] if `index` is past the name table, or
    /// [`Error::OffsetOverflow`] if the string is out of reach.
    pub fn set_name(&mut self, index: usize, name: &CStr) -> Result<()> {
        if index >= self.layout.name_count {
            return Err(Error::OutOfBounds);
        }
        let rva = self.rva(name.as_ptr() as usize, "export name")?;
        let mut offset = self.layout.name_slot(index);
        write_le_at(&mut self.data, &mut offset, rva)
    }

    /// Stores `record` as the stub of function `index` and points the function slot at it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] if the image has no stub for `index`.
    pub fn set_stub(&mut self, index: usize, record: &StubRecord) -> Result<()> {
        if index >= self.layout.stub_count {
            return Err(Error::OutOfBounds);
        }
        let offset = self.layout.stub_slot(index);
        self.data[offset..offset + STUB_SIZE].copy_from_slice(&record.encode());
        let rva = self.local(offset, "stub")?;
        self.set_function(index, rva)
    }

    /// Absolute address of the stub record of function `index`.
    #[must_use]
    pub fn stub_address(&self, index: usize) -> usize {
        self.base + self.layout.stub_slot(index)
    }

    /// The staged bytes.
    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        self.data
    }
}

/// Builds the image of `descriptor` for the relay configuration `relay`.
///
/// A stub array is reserved when [`crate::relay::RelayMode::is_capable`] holds for the
/// configured mode. Switchable stubs are emitted in `dispatch` form.
///
/// # Errors
///
/// Returns [`Error::Malformed`] for an inconsistent descriptor, [`Error::Config`] when traced
/// stubs are requested without a trampoline, and the allocation, placement and offset errors
/// of [`ImageRegion::allocate`] and [`ImageBuilder`].
pub fn synthesize(
    descriptor: &'static ModuleDescriptor,
    relay: &RelayConfig,
    dispatch: DispatchMode,
) -> Result<SynthesizedImage> {
    descriptor.validate()?;

    let with_stubs = relay.mode.is_capable();
    let trampoline = match (with_stubs, dispatch, relay.trampoline) {
        (true, DispatchMode::Traced, None) => {
            return Err(Error::Config(
                "relay tracing requires a trampoline address".to_string(),
            ))
        }
        (_, _, trampoline) => trampoline,
    };

    let layout = ImageLayout::new(
        Machine::host(),
        descriptor.function_count(),
        descriptor.name_count(),
        with_stubs,
    );

    let mut anchors = vec![descriptor.name.as_ptr() as usize];
    if !descriptor.ordinals.is_empty() {
        anchors.push(descriptor.ordinals.as_ptr() as usize);
    }
    anchors.extend(descriptor.names.iter().flatten().map(|name| name.as_ptr() as usize));
    anchors.extend(descriptor.functions.iter().flatten().map(|&f| f as usize));
    anchors.extend(descriptor.entry_point.map(|f| f as usize));
    if with_stubs {
        anchors.extend(trampoline);
    }

    let mut region = ImageRegion::allocate(layout.size, &anchors)?;
    let mut builder = ImageBuilder::new(region.base(), layout);

    let entry_point = match descriptor.entry_point {
        Some(entry) => builder.rva(entry as usize, "entry point")?,
        None => 0,
    };
    builder.write_headers(entry_point)?;
    builder.write_export_directory(descriptor)?;

    let mut stub_slots = vec![StubSlot::Absent; descriptor.function_count()];
    for (index, slot) in stub_slots.iter_mut().enumerate() {
        let Some(function) = descriptor.function(index) else {
            continue;
        };
        let target = function as usize;
        let rva = builder.rva(target, "function")?;
        builder.set_function(index, rva)?;

        if !with_stubs {
            continue;
        }
        if let Some(name) = descriptor.export_name(index) {
            let label = descriptor.label(index);
            if !relay.filter.shows(&label) {
                debug!("No relay for {label} ({})", name.to_string_lossy());
                continue;
            }
        }

        let stub = builder.stub_address(index);
        let record = match descriptor.arg_code(index).map(ArgCode::classify) {
            Some(ArgCode::Register) => {
                *slot = StubSlot::Register;
                StubRecord::register(stub, target)?
            }
            Some(ArgCode::Normal { words, caller_pops }) => {
                *slot = StubSlot::Dispatch(dispatch);
                StubRecord::for_mode(
                    dispatch,
                    stub,
                    target,
                    trampoline.unwrap_or(0),
                    words,
                    caller_pops,
                )?
            }
            Some(ArgCode::Extern) | None => continue,
        };
        builder.set_stub(index, &record)?;
    }

    for (index, name) in descriptor.names.iter().enumerate() {
        if let Some(name) = name {
            builder.set_name(index, name)?;
        }
    }

    region.commit(&builder.finish())?;

    info!(
        "Synthesized {} at {:#x}: {} function(s), {} name(s), {} stub(s)",
        descriptor.module_name(),
        region.base(),
        layout.function_count,
        layout.name_count,
        stub_slots.iter().filter(|s| **s != StubSlot::Absent).count()
    );

    Ok(SynthesizedImage {
        descriptor,
        region,
        layout,
        stub_slots,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        builtin::EntryPoint,
        image::layout::{read_export_data_directory, DOS_HEADER_SIZE},
        relay::{DispatchOpcode, RelayFilter, RelayMode, ReturnOpcode, STUBS_SUPPORTED},
    };

    unsafe extern "C" fn alpha() {}
    unsafe extern "C" fn beta() {}
    unsafe extern "C" fn gamma() {}
    unsafe extern "C" fn trampoline() {}

    static FUNCTIONS: [Option<EntryPoint>; 4] = [Some(alpha), Some(beta), None, Some(gamma)];

    static SAMPLE: ModuleDescriptor = ModuleDescriptor {
        name: c"SAMPLE",
        base: 1,
        functions: &FUNCTIONS,
        args: &[0x02, 0xff, 0x00, 0xfe],
        arg_types: &[],
        names: &[Some(c"Alpha"), Some(c"Beta"), Some(c"Gamma")],
        ordinals: &[0, 1, 3],
        entry_point: Some(alpha),
    };

    fn relay(mode: RelayMode) -> RelayConfig {
        RelayConfig {
            mode,
            trampoline: Some(trampoline as usize),
            filter: RelayFilter::new(),
        }
    }

    #[test]
    fn headers_without_stubs() {
        let image = synthesize(&SAMPLE, &relay(RelayMode::Disabled), DispatchMode::Direct).unwrap();
        assert!(!image.is_relay_capable());
        assert!(image.stub_range().is_empty());
        assert_eq!(image.size(), image.layout().fixed_size() + 4 * 4 + 3 * 4);

        let dos = DosHeader::read(image.bytes(), 0).unwrap();
        assert_eq!(dos.magic, goblin::pe::header::DOS_MAGIC);
        assert_eq!(dos.pe_offset as usize, DOS_HEADER_SIZE);

        let (machine, rva, size) =
            read_export_data_directory(image.bytes(), dos.pe_offset as usize).unwrap();
        assert_eq!(machine, Machine::host());
        assert_eq!(rva as usize, image.layout().export_directory);
        assert_eq!(size as usize, image.layout().export_size());

        assert_eq!(image.function_address(0), Some(alpha as usize));
        assert_eq!(image.function_address(1), Some(beta as usize));
        assert_eq!(image.function_address(2), Some(0));
        assert_eq!(image.function_address(4), None);
    }

    #[test]
    fn section_headers() {
        let image = synthesize(&SAMPLE, &relay(RelayMode::Warn), DispatchMode::Direct).unwrap();
        let layout = image.layout();
        let edata = SectionHeader::read(image.bytes(), layout.section_headers).unwrap();
        let code =
            SectionHeader::read(image.bytes(), layout.section_headers + SECTION_HEADER_SIZE)
                .unwrap();
        assert_eq!(edata.name(), EXPORT_SECTION_NAME);
        assert_eq!(code.name(), CODE_SECTION_NAME);
        assert!(edata.characteristics.contains(SectionFlags::MEM_WRITE));
        assert!(!code.characteristics.contains(SectionFlags::MEM_WRITE));
        assert_eq!(code.virtual_address as usize, layout.stubs);
        assert_eq!(code.virtual_size as usize, layout.code_size());
    }

    #[test]
    fn stubs_follow_argument_codes() {
        if !STUBS_SUPPORTED {
            return;
        }
        let image = synthesize(&SAMPLE, &relay(RelayMode::Warn), DispatchMode::Direct).unwrap();
        assert_eq!(
            image.stub_slots(),
            &[
                StubSlot::Dispatch(DispatchMode::Direct),
                StubSlot::Absent,
                StubSlot::Absent,
                StubSlot::Register
            ]
        );

        let first = image.read_stub(0).unwrap();
        let stub = image.stub_address(0).unwrap();
        assert_eq!(first.dispatch_opcode(), Some(DispatchOpcode::Jump));
        assert_eq!(first.return_opcode(), Some(ReturnOpcode::ReturnPop));
        assert_eq!(first.pop, 8);
        assert_eq!(first.transfer_target(stub), alpha as usize);
        assert_eq!(image.function_address(0), Some(stub));
        assert_eq!(image.function_address(1), Some(beta as usize));

        let register = image.read_stub(3).unwrap();
        assert_eq!(register.dispatch_opcode(), Some(DispatchOpcode::Call));
        assert_eq!(register.return_opcode(), Some(ReturnOpcode::Nop));
        assert_eq!(
            register.transfer_target(image.stub_address(3).unwrap()),
            gamma as usize
        );
        assert_eq!(image.stub_index(stub + 5), Some(0));
        assert_eq!(image.stub_index(stub + 8), Some(1));
    }

    #[test]
    fn filtered_exports_keep_raw_slots() {
        if !STUBS_SUPPORTED {
            return;
        }
        let mut config = relay(RelayMode::Warn);
        config.filter = RelayFilter::new().exclude("Alpha");
        let image = synthesize(&SAMPLE, &config, DispatchMode::Direct).unwrap();
        assert_eq!(image.stub_slots()[0], StubSlot::Absent);
        assert_eq!(image.function_address(0), Some(alpha as usize));
        assert_eq!(image.read_stub(0).unwrap().encode(), [0; STUB_SIZE]);
    }

    #[test]
    fn reencode_roundtrip() {
        if !STUBS_SUPPORTED {
            return;
        }
        let config = relay(RelayMode::Warn);
        let mut image = synthesize(&SAMPLE, &config, DispatchMode::Direct).unwrap();
        let before = image.bytes().to_vec();

        assert_eq!(
            image.reencode(DispatchMode::Traced, config.trampoline).unwrap(),
            1
        );
        let traced = image.read_stub(0).unwrap();
        assert_eq!(traced.dispatch_opcode(), Some(DispatchOpcode::Call));
        assert_eq!(
            traced.transfer_target(image.stub_address(0).unwrap()),
            trampoline as usize
        );
        assert_eq!(image.read_stub(3).unwrap().return_opcode(), Some(ReturnOpcode::Nop));

        assert_eq!(image.reencode(DispatchMode::Traced, config.trampoline).unwrap(), 0);
        assert_eq!(image.reencode(DispatchMode::Direct, None).unwrap(), 1);
        assert_eq!(image.bytes(), &before[..]);

        assert!(matches!(
            image.reencode(DispatchMode::Traced, None),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn traced_without_trampoline() {
        let config = RelayConfig {
            mode: RelayMode::Trace,
            trampoline: None,
            filter: RelayFilter::new(),
        };
        let result = synthesize(&SAMPLE, &config, DispatchMode::Traced);
        assert_eq!(result.is_err(), STUBS_SUPPORTED);
    }
}

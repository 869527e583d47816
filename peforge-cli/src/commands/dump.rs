use peforge::{
    image::{
        layout::{
            read_export_data_directory, DosHeader, ExportDirectory, SectionHeader, SECTION_COUNT,
            SECTION_HEADER_SIZE,
        },
        SynthesizedImage,
    },
    relay::{DispatchMode, StubSlot},
};
use serde::Serialize;

use crate::{
    app::GlobalOptions,
    commands::{demo_loader, load},
    output::{emit, hex, hex_dump, print_rows, Align, Fields, Report, Row},
};

#[derive(Debug, Serialize)]
struct SectionInfo {
    name: String,
    virtual_address: String,
    virtual_size: u32,
    characteristics: String,
}

impl Row for SectionInfo {
    const COLUMNS: &'static [(&'static str, Align)] = &[
        ("Name", Align::Left),
        ("Address", Align::Right),
        ("Size", Align::Right),
        ("Flags", Align::Left),
    ];

    fn cells(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            self.virtual_address.clone(),
            format!("{:#x}", self.virtual_size),
            self.characteristics.clone(),
        ]
    }
}

#[derive(Debug, Serialize)]
struct StubSummary {
    range: String,
    direct: usize,
    traced: usize,
    register: usize,
    absent: usize,
}

#[derive(Debug, Serialize)]
struct DumpReport {
    module: String,
    path_name: String,
    base: String,
    size: usize,
    machine: String,
    pe_offset: u32,
    export_directory: String,
    export_size: u32,
    ordinal_base: u32,
    functions: u32,
    names: u32,
    sections: Vec<SectionInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stubs: Option<StubSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    header_bytes: Option<Vec<String>>,
}

fn summarize_stubs(image: &SynthesizedImage) -> Option<StubSummary> {
    if !image.is_relay_capable() {
        return None;
    }
    let range = image.stub_range();
    let mut summary = StubSummary {
        range: format!("{}..{}", hex(range.start), hex(range.end)),
        direct: 0,
        traced: 0,
        register: 0,
        absent: 0,
    };
    for slot in image.stub_slots() {
        match slot {
            StubSlot::Dispatch(DispatchMode::Direct) => summary.direct += 1,
            StubSlot::Dispatch(DispatchMode::Traced) => summary.traced += 1,
            StubSlot::Register => summary.register += 1,
            StubSlot::Absent => summary.absent += 1,
        }
    }
    Some(summary)
}

fn describe(image: &SynthesizedImage, with_hex: bool) -> peforge::Result<DumpReport> {
    let bytes = image.bytes();
    let dos = DosHeader::read(bytes, 0)?;
    let (machine, export_rva, export_size) =
        read_export_data_directory(bytes, dos.pe_offset as usize)?;
    let directory = ExportDirectory::read(bytes, export_rva as usize)?;

    let sections = (0..usize::from(SECTION_COUNT))
        .map(|i| {
            let header =
                SectionHeader::read(bytes, image.layout().section_headers + i * SECTION_HEADER_SIZE)?;
            Ok(SectionInfo {
                name: header.name().to_string(),
                virtual_address: hex(header.virtual_address as usize),
                virtual_size: header.virtual_size,
                characteristics: format!("{:#010x}", header.characteristics.bits()),
            })
        })
        .collect::<peforge::Result<Vec<_>>>()?;

    let descriptor = image.descriptor();
    Ok(DumpReport {
        module: descriptor.module_name().into_owned(),
        path_name: peforge::loader::canonical_path(descriptor),
        base: hex(image.base()),
        size: image.size(),
        machine: machine.to_string(),
        pe_offset: dos.pe_offset,
        export_directory: hex(export_rva as usize),
        export_size,
        ordinal_base: directory.base,
        functions: directory.number_of_functions,
        names: directory.number_of_names,
        sections,
        stubs: summarize_stubs(image),
        header_bytes: with_hex.then(|| hex_dump(image.headers())),
    })
}

impl Report for DumpReport {
    fn render(&self) {
        let fields = Fields::new(16);
        fields.line("Module", format_args!("{} ({})", self.module, self.path_name));
        fields.line("Base", &self.base);
        fields.line("Size", format_args!("{:#x}", self.size));
        fields.line("Machine", &self.machine);
        fields.line("PE offset", format_args!("{:#x}", self.pe_offset));
        fields.line(
            "Export directory",
            format_args!("{} ({:#x} bytes)", self.export_directory, self.export_size),
        );
        fields.line(
            "Exports",
            format_args!(
                "{} functions, {} names, ordinal base {}",
                self.functions, self.names, self.ordinal_base
            ),
        );

        println!();
        print_rows("Sections:", &self.sections);

        println!();
        match &self.stubs {
            Some(stubs) => fields.line(
                "Relay stubs",
                format_args!(
                    "{} ({} direct, {} traced, {} register, {} without stub)",
                    stubs.range, stubs.direct, stubs.traced, stubs.register, stubs.absent
                ),
            ),
            None => fields.line("Relay stubs", "none"),
        }

        if let Some(lines) = &self.header_bytes {
            println!("\nHeaders:");
            for line in lines {
                println!("  {line}");
            }
        }
    }
}

pub fn run(module: &str, force: bool, with_hex: bool, opts: &GlobalOptions) -> anyhow::Result<()> {
    let loader = demo_loader(opts)?;
    let handle = load(&loader, module, force)?;
    let report = loader.with_image(handle, |image| describe(image, with_hex))??;
    emit(&report, opts)
}

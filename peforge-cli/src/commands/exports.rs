use peforge::image::{ExportView, SynthesizedImage};
use serde::Serialize;

use crate::{
    app::GlobalOptions,
    commands::{demo_loader, load},
    output::{emit, hex, print_rows, Align, Report, Row},
};

/// How a call through an export slot is dispatched.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
enum ExportKind {
    Stub,
    Direct,
    Unimplemented,
}

impl ExportKind {
    fn as_str(self) -> &'static str {
        match self {
            ExportKind::Stub => "stub",
            ExportKind::Direct => "direct",
            ExportKind::Unimplemented => "unimplemented",
        }
    }
}

#[derive(Debug, Serialize)]
struct ExportRow {
    ordinal: u32,
    name: Option<String>,
    rva: String,
    address: Option<String>,
    kind: ExportKind,
}

impl Row for ExportRow {
    const COLUMNS: &'static [(&'static str, Align)] = &[
        ("Ordinal", Align::Right),
        ("Name", Align::Left),
        ("RVA", Align::Right),
        ("Address", Align::Right),
        ("Kind", Align::Left),
    ];

    fn cells(&self) -> Vec<String> {
        vec![
            self.ordinal.to_string(),
            self.name.clone().unwrap_or_else(|| "<ordinal-only>".to_string()),
            self.rva.clone(),
            self.address.clone().unwrap_or_else(|| "-".to_string()),
            self.kind.as_str().to_string(),
        ]
    }
}

#[derive(Debug, Serialize)]
struct ExportsReport {
    module: String,
    exports: Vec<ExportRow>,
}

impl Report for ExportsReport {
    fn render(&self) {
        print_rows(
            &format!("{} exports ({} entries):", self.module, self.exports.len()),
            &self.exports,
        );
    }
}

fn collect(image: &SynthesizedImage) -> peforge::Result<ExportsReport> {
    let view = ExportView::new(image)?;
    let stubs = image.stub_range();
    let exports = view
        .entries()
        .into_iter()
        .map(|entry| {
            let address =
                (!entry.is_unimplemented()).then(|| image.base() + entry.rva as usize);
            let kind = match address {
                None => ExportKind::Unimplemented,
                Some(a) if stubs.contains(&a) => ExportKind::Stub,
                Some(_) => ExportKind::Direct,
            };
            ExportRow {
                ordinal: entry.ordinal,
                name: entry.name,
                rva: hex(entry.rva as usize),
                address: address.map(hex),
                kind,
            }
        })
        .collect();

    Ok(ExportsReport {
        module: view.module_name().to_string_lossy().into_owned(),
        exports,
    })
}

pub fn run(module: &str, force: bool, opts: &GlobalOptions) -> anyhow::Result<()> {
    let loader = demo_loader(opts)?;
    let handle = load(&loader, module, force)?;
    let report = loader.with_image(handle, collect)??;
    emit(&report, opts)
}

use serde::Serialize;

use crate::{
    app::GlobalOptions,
    commands::demo_loader,
    output::{emit, print_rows, Align, Report, Row},
};

#[derive(Debug, Serialize)]
struct ModuleRow {
    name: String,
    enabled: bool,
    base: u32,
    functions: usize,
    names: usize,
    unimplemented: usize,
}

impl Row for ModuleRow {
    const COLUMNS: &'static [(&'static str, Align)] = &[
        ("Name", Align::Left),
        ("Enabled", Align::Left),
        ("Base", Align::Right),
        ("Functions", Align::Right),
        ("Names", Align::Right),
        ("Unimplemented", Align::Right),
    ];

    fn cells(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            if self.enabled { "yes" } else { "no" }.to_string(),
            self.base.to_string(),
            self.functions.to_string(),
            self.names.to_string(),
            self.unimplemented.to_string(),
        ]
    }
}

#[derive(Debug, Serialize)]
struct ModulesReport {
    modules: Vec<ModuleRow>,
}

impl Report for ModulesReport {
    fn render(&self) {
        print_rows(
            &format!("Built-in modules ({} entries):", self.modules.len()),
            &self.modules,
        );
    }
}

pub fn run(opts: &GlobalOptions) -> anyhow::Result<()> {
    let loader = demo_loader(opts)?;

    let modules = loader
        .registry()
        .iter()
        .map(|(_, descriptor, enabled)| ModuleRow {
            name: descriptor.module_name().into_owned(),
            enabled,
            base: descriptor.base,
            functions: descriptor.function_count(),
            names: descriptor.name_count(),
            unimplemented: descriptor.functions.iter().filter(|f| f.is_none()).count(),
        })
        .collect();

    emit(&ModulesReport { modules }, opts)
}

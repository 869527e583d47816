//! Rendering shared by the commands.
//!
//! Every command builds one serializable report. With `--json` the report is printed as
//! JSON; otherwise it renders itself from labelled fields, row tables and hex helpers.

use std::fmt::Display;

use comfy_table::{presets, CellAlignment, ContentArrangement, Table};
use serde::Serialize;

use crate::app::GlobalOptions;

/// A command result with a human-readable form.
pub trait Report: Serialize {
    fn render(&self);
}

/// Prints `report` as JSON with `--json`, rendered text otherwise.
pub fn emit<R: Report>(report: &R, opts: &GlobalOptions) -> anyhow::Result<()> {
    if opts.json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        report.render();
    }
    Ok(())
}

#[derive(Clone, Copy)]
pub enum Align {
    Left,
    Right,
}

/// A record shown as one line of a table.
pub trait Row {
    /// Header and alignment of each column, in cell order.
    const COLUMNS: &'static [(&'static str, Align)];

    fn cells(&self) -> Vec<String>;
}

/// Lays `rows` out in columns separated by two spaces, header first.
pub fn table_lines<'a, R: Row + 'a>(rows: impl IntoIterator<Item = &'a R>) -> Vec<String> {
    let mut table = Table::new();
    table
        .load_preset(presets::NOTHING)
        .set_content_arrangement(ContentArrangement::Disabled)
        .set_header(R::COLUMNS.iter().map(|(header, _)| *header));

    let last = R::COLUMNS.len().saturating_sub(1);
    for (i, (_, align)) in R::COLUMNS.iter().enumerate() {
        if let Some(column) = table.column_mut(i) {
            column.set_cell_alignment(match align {
                Align::Left => CellAlignment::Left,
                Align::Right => CellAlignment::Right,
            });
            column.set_padding((u16::from(i != 0), u16::from(i != last)));
        }
    }
    for row in rows {
        table.add_row(row.cells());
    }

    table
        .to_string()
        .lines()
        .map(|line| line.trim_end().to_string())
        .collect()
}

/// Prints `title` and the table of `rows` indented below it.
pub fn print_rows<'a, R: Row + 'a>(title: &str, rows: impl IntoIterator<Item = &'a R>) {
    println!("{title}");
    for line in table_lines(rows) {
        println!("  {line}");
    }
}

/// `Label:` / value lines with the values starting in one column.
pub struct Fields {
    width: usize,
}

impl Fields {
    /// Aligns values for labels up to `longest` characters.
    pub fn new(longest: usize) -> Self {
        Fields { width: longest + 3 }
    }

    pub fn line(&self, label: &str, value: impl Display) {
        println!("{:<width$}{value}", format!("{label}:"), width = self.width);
    }
}

pub fn hex(value: usize) -> String {
    format!("{value:#x}")
}

/// Bytes as space-separated lowercase pairs.
pub fn hex_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// A 16-bytes-per-line dump, each line prefixed with its offset.
pub fn hex_dump(bytes: &[u8]) -> Vec<String> {
    bytes
        .chunks(16)
        .enumerate()
        .map(|(line, chunk)| format!("{:08x}  {}", line * 16, hex_bytes(chunk)))
        .collect()
}

use anyhow::{bail, Context};
use peforge::{
    relay::{StubRecord, STUB_RETURN_OFFSET},
    Error, ProcName,
};
use serde::Serialize;

use crate::{
    app::GlobalOptions,
    commands::{demo_loader, load},
    output::{emit, hex, hex_bytes, Fields, Report},
};

#[derive(Debug, Serialize)]
struct StubInfo {
    bytes: String,
    dispatch: Option<String>,
    target: String,
}

#[derive(Debug, Serialize)]
struct ResolveReport {
    export: String,
    address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unimplemented: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stub: Option<StubInfo>,
    tracing: bool,
}

fn parse_export(export: &str) -> anyhow::Result<ProcName<'_>> {
    match export.strip_prefix('#') {
        Some(ordinal) => {
            let ordinal = ordinal
                .parse()
                .with_context(|| format!("invalid ordinal: {export}"))?;
            Ok(ProcName::Ordinal(ordinal))
        }
        None if export.is_empty() => bail!("empty export name"),
        None => Ok(ProcName::Name(export)),
    }
}

fn describe_stub(record: StubRecord, stub: usize) -> StubInfo {
    StubInfo {
        bytes: hex_bytes(&record.encode()),
        dispatch: record.dispatch_opcode().map(|op| op.to_string()),
        target: hex(record.transfer_target(stub)),
    }
}

impl Report for ResolveReport {
    fn render(&self) {
        let fields = Fields::new(8);
        fields.line("Export", &self.export);
        match (&self.address, &self.unimplemented) {
            (_, Some(message)) => fields.line("Address", format_args!("none ({message})")),
            (Some(address), None) => fields.line("Address", address),
            (None, None) => fields.line("Address", "none"),
        }
        if let Some(label) = &self.label {
            fields.line("Relay", label);
        }
        if let Some(function) = &self.function {
            fields.line("Function", function);
        }
        if let Some(stub) = &self.stub {
            fields.line("Stub", &stub.bytes);
            fields.line(
                "Dispatch",
                format_args!("{} -> {}", stub.dispatch.as_deref().unwrap_or("?"), stub.target),
            );
        }
        fields.line("Tracing", if self.tracing { "on" } else { "off" });
    }
}

pub fn run(
    module: &str,
    export: &str,
    force: bool,
    trace: bool,
    opts: &GlobalOptions,
) -> anyhow::Result<()> {
    let proc = parse_export(export)?;
    let loader = demo_loader(opts)?;
    let handle = load(&loader, module, force)?;
    if trace {
        loader
            .set_relay_tracing(true)
            .context("failed to switch relay tracing on")?;
    }

    let mut output = ResolveReport {
        export: export.to_string(),
        address: None,
        unimplemented: None,
        label: None,
        function: None,
        stub: None,
        tracing: loader.is_tracing()?,
    };

    match loader.proc_address(handle, proc) {
        Ok(address) => {
            output.address = Some(hex(address));
            if let Some(entry) = loader.resolve_relay(address + STUB_RETURN_OFFSET) {
                output.label = Some(entry.label.clone());
                output.function = Some(hex(entry.function));
                output.stub = loader.with_image(handle, |image| {
                    image
                        .read_stub(entry.index)
                        .zip(image.stub_address(entry.index))
                        .map(|(record, stub)| describe_stub(record, stub))
                })?;
            }
        }
        Err(err @ Error::UnimplementedEntry { .. }) => output.unimplemented = Some(err.to_string()),
        Err(err) => return Err(err).with_context(|| format!("cannot resolve {export}")),
    }

    emit(&output, opts)
}

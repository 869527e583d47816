mod app;
mod commands;
mod output;

use clap::Parser;

use crate::app::{Cli, Command};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // peforge info+ on stderr unless --json; --verbose enables debug; RUST_LOG overrides
    if !cli.global.json {
        let level = if cli.global.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        };
        env_logger::Builder::new()
            .filter_module("peforge", level)
            .parse_default_env()
            .target(env_logger::Target::Stderr)
            .format_timestamp(None)
            .format_module_path(false)
            .format_target(false)
            .init();
    }

    match &cli.command {
        Command::Modules => commands::modules::run(&cli.global),
        Command::Dump { module, force, hex } => {
            commands::dump::run(module, *force, *hex, &cli.global)
        }
        Command::Exports { module, force } => commands::exports::run(module, *force, &cli.global),
        Command::Resolve {
            module,
            export,
            force,
            trace,
        } => commands::resolve::run(module, export, *force, *trace, &cli.global),
    }
}

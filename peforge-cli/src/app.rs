use clap::{Parser, Subcommand, ValueEnum};
use peforge::relay::RelayMode;

/// peforge - synthesize and inspect built-in Windows module images
#[derive(Debug, Parser)]
#[command(name = "peforge", version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOptions,

    #[command(subcommand)]
    pub command: Command,
}

/// Options shared across all subcommands.
#[derive(Debug, Parser)]
pub struct GlobalOptions {
    /// Emit output as JSON instead of human-readable text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Enable verbose (debug-level) logging output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Relay mode for synthesized images. Defaults to the PEFORGE_DEBUG setting.
    #[arg(long, global = true, value_enum, value_name = "MODE")]
    pub relay: Option<RelayArg>,
}

/// Relay mode as accepted on the command line.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum RelayArg {
    /// No stub array
    Off,
    /// Stubs jump straight to the functions
    Warn,
    /// Stubs call the relay trampoline
    Trace,
}

impl From<RelayArg> for RelayMode {
    fn from(arg: RelayArg) -> Self {
        match arg {
            RelayArg::Off => RelayMode::Disabled,
            RelayArg::Warn => RelayMode::Warn,
            RelayArg::Trace => RelayMode::Trace,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List the built-in module catalog and each module's enablement.
    Modules,

    /// Synthesize a module image and show its headers, sections and stub array.
    Dump {
        /// Module name or path (e.g. kernel32, C:\WINDOWS\SYSTEM\USER32.DLL).
        #[arg(value_name = "MODULE")]
        module: String,

        /// Load the module even if it is disabled.
        #[arg(short, long)]
        force: bool,

        /// Also print a hex dump of the header bytes.
        #[arg(long)]
        hex: bool,
    },

    /// List the exports of a synthesized module image.
    Exports {
        /// Module name or path.
        #[arg(value_name = "MODULE")]
        module: String,

        /// Load the module even if it is disabled.
        #[arg(short, long)]
        force: bool,
    },

    /// Resolve an export and map its relay stub back to the export label.
    Resolve {
        /// Module name or path.
        #[arg(value_name = "MODULE")]
        module: String,

        /// Export name, or `#N` for a biased ordinal.
        #[arg(value_name = "EXPORT")]
        export: String,

        /// Load the module even if it is disabled.
        #[arg(short, long)]
        force: bool,

        /// Switch relay tracing on before inspecting the stub.
        #[arg(long)]
        trace: bool,
    },
}

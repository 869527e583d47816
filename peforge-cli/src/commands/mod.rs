pub mod catalog;
pub mod dump;
pub mod exports;
pub mod modules;
pub mod resolve;

use anyhow::Context;
use peforge::{BuiltinLoader, LoaderConfig, ModuleHandle};

use crate::app::GlobalOptions;

/// Build a loader over the demo catalog, configured from the environment and `--relay`.
pub fn demo_loader(opts: &GlobalOptions) -> anyhow::Result<BuiltinLoader> {
    let mut config = LoaderConfig::from_env().context("invalid PEFORGE_* environment")?;
    if let Some(relay) = opts.relay {
        config = config.relay_mode(relay.into());
    }
    let config = config.trampoline(catalog::relay_trampoline as usize);
    BuiltinLoader::new(catalog::catalog(), config).context("demo catalog rejected")
}

/// Load `module` through `loader`, with context for the error message.
pub fn load(loader: &BuiltinLoader, module: &str, force: bool) -> anyhow::Result<ModuleHandle> {
    loader
        .load_image(module, force)
        .with_context(|| format!("failed to load built-in module: {module}"))
}

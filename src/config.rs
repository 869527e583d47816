//! Configuration for the built-in module loader.
//!
//! This module provides the configuration types that control image synthesis and relay
//! debugging: which relay level images are built for, where the shared relay trampoline
//! lives, which exports are relayed at all, and which built-in modules are switched on or
//! off before the first load.
//!
//! Configuration can be assembled programmatically or read from the environment:
//!
//! | Variable | Format | Example |
//! |---|---|---|
//! | `PEFORGE_DEBUG` | debug channel list | `warn+relay,+heap` |
//! | `PEFORGE_RELAY_INCLUDE` | `;`-separated items | `KERNEL32;USER32.MessageBoxA` |
//! | `PEFORGE_RELAY_EXCLUDE` | `;`-separated items | `RtlUnwind;NTDLL` |
//! | `PEFORGE_DLL_OVERRIDES` | `names=+` / `names=-` groups | `comctl32,ole32=+;ddraw=-` |

use log::debug;

use crate::{
    relay::{RelayFilter, RelayMode},
    Error, Result,
};

/// Environment variable holding the debug channel list.
pub const ENV_DEBUG: &str = "PEFORGE_DEBUG";
/// Environment variable holding the relay include list.
pub const ENV_RELAY_INCLUDE: &str = "PEFORGE_RELAY_INCLUDE";
/// Environment variable holding the relay exclude list.
pub const ENV_RELAY_EXCLUDE: &str = "PEFORGE_RELAY_EXCLUDE";
/// Environment variable holding module enable / disable overrides.
pub const ENV_DLL_OVERRIDES: &str = "PEFORGE_DLL_OVERRIDES";

/// Relay debugging configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayConfig {
    /// Relay level images are built for.
    pub mode: RelayMode,

    /// Address of the shared relay trampoline that traced stubs call.
    ///
    /// Required before any stub can be put into traced form.
    pub trampoline: Option<usize>,

    /// Exports rejected by this filter get no stub.
    pub filter: RelayFilter,
}

impl RelayConfig {
    /// Checks that the configuration can be honored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when tracing is requested on a stub-capable target without
    /// a trampoline address.
    pub fn validate(&self) -> Result<()> {
        if self.mode.is_capable() && self.mode == RelayMode::Trace && self.trampoline.is_none() {
            return Err(Error::Config(
                "relay tracing requires a trampoline address".to_string(),
            ));
        }
        Ok(())
    }
}

/// Enables or disables one built-in module by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleOverride {
    /// Module name, path and extension are ignored when matching
    pub name: String,
    /// New enablement
    pub enabled: bool,
}

impl ModuleOverride {
    /// Parses `;`-separated groups of the form `name[,name...]=+` or `name[,name...]=-`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a group without `=`, with a flag other than `+` / `-`,
    /// or without any name.
    ///
    /// ```rust
    /// use peforge::config::ModuleOverride;
    ///
    /// let overrides = ModuleOverride::parse_list("comctl32,ole32=+;ddraw=-")?;
    /// assert_eq!(overrides.len(), 3);
    /// assert!(!overrides[2].enabled);
    /// # Ok::<(), peforge::Error>(())
    /// ```
    pub fn parse_list(list: &str) -> Result<Vec<ModuleOverride>> {
        let mut overrides = Vec::new();
        for group in list.split(';').map(str::trim).filter(|g| !g.is_empty()) {
            let Some((names, flag)) = group.rsplit_once('=') else {
                return Err(Error::Config(format!("override '{group}' lacks '='")));
            };
            let enabled = match flag.trim() {
                "+" => true,
                "-" => false,
                other => {
                    return Err(Error::Config(format!(
                        "override flag '{other}' must be '+' or '-'"
                    )))
                }
            };

            let before = overrides.len();
            overrides.extend(
                names
                    .split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(|name| ModuleOverride {
                        name: name.to_string(),
                        enabled,
                    }),
            );
            if overrides.len() == before {
                return Err(Error::Config(format!("override '{group}' names no module")));
            }
        }
        Ok(overrides)
    }
}

/// Configuration of a [`crate::BuiltinLoader`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoaderConfig {
    /// Relay debugging configuration.
    pub relay: RelayConfig,

    /// Enablement overrides applied when the loader is created.
    pub overrides: Vec<ModuleOverride>,
}

impl LoaderConfig {
    /// Creates the default configuration: no relay stubs, no overrides.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the relay level.
    #[must_use]
    pub fn relay_mode(mut self, mode: RelayMode) -> Self {
        self.relay.mode = mode;
        self
    }

    /// Sets the relay trampoline address.
    #[must_use]
    pub fn trampoline(mut self, address: usize) -> Self {
        self.relay.trampoline = Some(address);
        self
    }

    /// Sets the relay filter.
    #[must_use]
    pub fn relay_filter(mut self, filter: RelayFilter) -> Self {
        self.relay.filter = filter;
        self
    }

    /// Appends enablement overrides.
    #[must_use]
    pub fn overrides(mut self, overrides: impl IntoIterator<Item = ModuleOverride>) -> Self {
        self.overrides.extend(overrides);
        self
    }

    /// Derives the relay level from a debug channel list.
    ///
    /// Items are comma separated and have the form `[class]+channel` or `[class]-channel`,
    /// where class is one of `err`, `warn`, `fixme`, `trace` and an empty class addresses all
    /// of them. Only the `relay` channel (or `all`) is interpreted: trace messages select
    /// [`RelayMode::Trace`], warn messages alone select [`RelayMode::Warn`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an item without `+` / `-` or with an unknown class.
    ///
    /// ```rust
    /// use peforge::{config::LoaderConfig, relay::RelayMode};
    ///
    /// assert_eq!(LoaderConfig::from_debug_spec("+relay")?.relay.mode, RelayMode::Trace);
    /// assert_eq!(LoaderConfig::from_debug_spec("warn+relay")?.relay.mode, RelayMode::Warn);
    /// assert_eq!(LoaderConfig::from_debug_spec("+relay,-relay")?.relay.mode, RelayMode::Disabled);
    /// # Ok::<(), peforge::Error>(())
    /// ```
    pub fn from_debug_spec(spec: &str) -> Result<Self> {
        let mut warn = false;
        let mut trace = false;

        for item in spec.split(',').map(str::trim).filter(|i| !i.is_empty()) {
            let Some(split) = item.find(['+', '-']) else {
                return Err(Error::Config(format!("debug item '{item}' lacks '+' or '-'")));
            };
            let (class, rest) = item.split_at(split);
            let on = rest.starts_with('+');
            let channel = &rest[1..];
            if !channel.eq_ignore_ascii_case("relay") && !channel.eq_ignore_ascii_case("all") {
                debug!("ignoring debug channel '{channel}'");
                continue;
            }

            match class.to_ascii_lowercase().as_str() {
                "" => {
                    warn = on;
                    trace = on;
                }
                "warn" => warn = on,
                "trace" => trace = on,
                "err" | "fixme" => {}
                other => return Err(Error::Config(format!("unknown debug class '{other}'"))),
            }
        }

        let mode = if trace {
            RelayMode::Trace
        } else if warn {
            RelayMode::Warn
        } else {
            RelayMode::Disabled
        };
        Ok(LoaderConfig::new().relay_mode(mode))
    }

    /// Reads the configuration from the `PEFORGE_*` environment variables.
    ///
    /// Unset variables keep their defaults. The trampoline address cannot come from the
    /// environment; set it with [`LoaderConfig::trampoline`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a variable is present but malformed.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var(ENV_DEBUG) {
            Ok(spec) => LoaderConfig::from_debug_spec(&spec)?,
            Err(_) => LoaderConfig::new(),
        };

        let mut filter = RelayFilter::new();
        if let Ok(list) = std::env::var(ENV_RELAY_INCLUDE) {
            filter = filter.include(&list);
        }
        if let Ok(list) = std::env::var(ENV_RELAY_EXCLUDE) {
            filter = filter.exclude(&list);
        }
        config.relay.filter = filter;

        if let Ok(list) = std::env::var(ENV_DLL_OVERRIDES) {
            config.overrides = ModuleOverride::parse_list(&list)?;
        }

        Ok(config)
    }
}

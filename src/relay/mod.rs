//! Relay stubs and relay tracing support.
//!
//! Relaying routes calls into built-in exports through small generated stubs so that a
//! tracing trampoline can log every call before forwarding it. This module holds the stub
//! encoding ([`StubRecord`]), the argument-code classification ([`ArgCode`]), the relay
//! include / exclude filter ([`RelayFilter`]) and [`RelayEntry`], the result of mapping a
//! relay return address back to its export.
//!
//! Stubs are only generated on x86 targets; elsewhere images are built without a stub array
//! and every function slot points straight at its implementation.

mod filter;
mod stub;

use std::fmt;

use strum::{Display, EnumString};

pub use filter::RelayFilter;
pub use stub::{
    ArgCode, DispatchMode, DispatchOpcode, ReturnOpcode, StubRecord, StubSlot, STUB_RETURN_OFFSET,
    STUB_SIZE,
};

/// Whether this target can execute relay stubs.
pub const STUBS_SUPPORTED: bool = cfg!(any(target_arch = "x86", target_arch = "x86_64"));

/// Relay debugging level.
#[derive(Debug, Display, EnumString, Clone, Copy, PartialEq, Eq, Default)]
#[strum(ascii_case_insensitive)]
pub enum RelayMode {
    /// Images carry no stub array; tracing can never be switched on.
    #[default]
    #[strum(serialize = "off")]
    Disabled,
    /// Images carry stubs in direct form; tracing can be switched on later.
    #[strum(serialize = "warn")]
    Warn,
    /// Images carry stubs in traced form.
    #[strum(serialize = "trace")]
    Trace,
}

impl RelayMode {
    /// Returns `true` when images built in this mode reserve a stub array.
    #[must_use]
    pub fn is_capable(self) -> bool {
        STUBS_SUPPORTED && self != RelayMode::Disabled
    }

    /// Dispatch form stubs are first emitted in.
    #[must_use]
    pub fn initial_dispatch(self) -> DispatchMode {
        if self == RelayMode::Trace {
            DispatchMode::Traced
        } else {
            DispatchMode::Direct
        }
    }
}

/// An export recovered from a relay return address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEntry {
    /// Diagnostic label `"<module>.<ordinal>: <name>"`
    pub label: String,
    /// Argument type mask recorded for the export
    pub arg_types: u32,
    /// Address of the real implementation
    pub function: usize,
    /// Unbiased function index inside the module
    pub index: usize,
}

impl fmt::Display for RelayEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parsing() {
        assert_eq!("TRACE".parse::<RelayMode>().unwrap(), RelayMode::Trace);
        assert_eq!("warn".parse::<RelayMode>().unwrap(), RelayMode::Warn);
        assert_eq!("off".parse::<RelayMode>().unwrap(), RelayMode::Disabled);
        assert!("loud".parse::<RelayMode>().is_err());
        assert_eq!(RelayMode::Trace.to_string(), "trace");
    }

    #[test]
    fn initial_dispatch() {
        assert_eq!(RelayMode::Trace.initial_dispatch(), DispatchMode::Traced);
        assert_eq!(RelayMode::Warn.initial_dispatch(), DispatchMode::Direct);
        assert!(!RelayMode::Disabled.is_capable());
        assert_eq!(RelayMode::Warn.is_capable(), STUBS_SUPPORTED);
    }
}

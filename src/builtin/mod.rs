//! Built-in module metadata.
//!
//! A built-in module is a compiled-in stand-in for a real Windows DLL. This module holds the
//! static description of such modules ([`ModuleDescriptor`]) and the [`Registry`] that maps
//! requested names onto them and tracks which of them may be loaded.

mod descriptor;
mod registry;

pub use descriptor::{EntryPoint, ModuleDescriptor};
pub use registry::{normalize_module_name, BuiltinEntry, ModuleId, Registry};

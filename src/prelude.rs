//! # peforge Prelude
//!
//! This module provides a convenient prelude for the most commonly used types and traits
//! from the peforge library.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all peforge operations
pub use crate::Error;

/// The result type used throughout peforge
pub use crate::Result;

// ================================================================================================
// Module Metadata
// ================================================================================================

/// Static export tables and catalog entries
pub use crate::builtin::{BuiltinEntry, EntryPoint, ModuleDescriptor, ModuleId, Registry};

// ================================================================================================
// Loading
// ================================================================================================

/// Loader, handles and export requests
pub use crate::loader::{BuiltinLoader, ModuleHandle, ModuleInfo, ProcName};

/// Library façade and its collaborator tables
pub use crate::loader::{LegacyFlags, LegacyModuleTable, LoadedLibrary, ModuleRefTable};

/// Configuration
pub use crate::config::{LoaderConfig, ModuleOverride, RelayConfig};

// ================================================================================================
// Images and Relay
// ================================================================================================

/// Synthesized images and their export view
pub use crate::image::{ExportView, SynthesizedImage};

/// Relay modes, stubs and resolution results
pub use crate::relay::{DispatchMode, RelayEntry, RelayFilter, RelayMode, StubRecord};

// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
// - 'image/region.rs' maps, protects and patches executable memory through libc
// - 'image/exports.rs' reads export strings and ordinals through image offsets

//! # peforge
//!
//! Synthesized PE images for compiled-in Windows modules.
//!
//! A *built-in* module is a Rust stand-in for a Windows DLL: its exports are ordinary
//! functions listed in a static [`builtin::ModuleDescriptor`]. `peforge` turns such a
//! descriptor into a real in-memory PE image with DOS and NT headers, an `.edata` export
//! directory and an optional `.code` section of x86 relay stubs, so that any code walking
//! PE export tables can resolve the module exactly like a DLL loaded from disk.
//!
//! ## Features
//!
//! - **Image synthesis** - headers, export directory and function / name tables in one
//!   mapping, every offset relative to the image base
//! - **Relay stubs** - one 8-byte `jmp` / `call` stub per export that can be switched between
//!   direct dispatch and a tracing trampoline at runtime
//! - **Relay resolution** - stub return addresses map back to `MODULE.ordinal: name` labels
//! - **Module policy** - case-insensitive lookup ignoring path and extension, per-module
//!   enablement with forced loads and configuration overrides
//! - **Library façade** - all-or-nothing registration with external module tables
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use peforge::prelude::*;
//!
//! unsafe extern "C" fn get_version() {}
//!
//! static FUNCTIONS: [Option<EntryPoint>; 1] = [Some(get_version)];
//! static KERNEL32: ModuleDescriptor = ModuleDescriptor {
//!     name: c"KERNEL32",
//!     base: 1,
//!     functions: &FUNCTIONS,
//!     args: &[0x00],
//!     arg_types: &[],
//!     names: &[Some(c"GetVersion")],
//!     ordinals: &[0],
//!     entry_point: None,
//! };
//!
//! let loader = BuiltinLoader::new([BuiltinEntry::enabled(&KERNEL32)], LoaderConfig::from_env()?)?;
//! let module = loader.load_image("kernel32.dll", false)?;
//! let address = loader.proc_address(module, ProcName::Name("GetVersion"))?;
//! # Ok::<(), peforge::Error>(())
//! ```
//!
//! ## Relay Debugging
//!
//! Images built with [`relay::RelayMode::Warn`] or [`relay::RelayMode::Trace`] carry a stub
//! per export. [`BuiltinLoader::set_relay_tracing`] rewrites all of them between a direct
//! `jmp` to the implementation and a `call` into a trampoline supplied through
//! [`config::LoaderConfig::trampoline`]; the trampoline uses
//! [`BuiltinLoader::resolve_relay`] to find out which export was called.
//!
//! ## Platform Support
//!
//! Images are mapped with `mmap` and follow the host instruction set (PE32 on x86, PE32+
//! elsewhere). Relay stubs are only generated on x86 and x86-64.

#[macro_use]
pub(crate) mod macros;

#[macro_use]
pub(crate) mod error;

/// Convenient re-exports of the most commonly used types and traits.
///
/// # Example
///
/// ```rust,no_run
/// use peforge::prelude::*;
///
/// let config = LoaderConfig::from_env()?;
/// let loader = BuiltinLoader::new(Vec::<BuiltinEntry>::new(), config)?;
/// assert!(loader.loaded()?.is_empty());
/// # Ok::<(), peforge::Error>(())
/// ```
pub mod prelude;

/// Static module metadata and the module catalog.
///
/// # Key Types
///
/// - [`builtin::ModuleDescriptor`] - compiled-in export tables of one module
/// - [`builtin::Registry`] - name lookup and enablement over a catalog
/// - [`builtin::BuiltinEntry`] - one catalog line
pub mod builtin;

/// Loader, relay and environment configuration.
pub mod config;

/// PE image synthesis and read-back.
///
/// # Key Types
///
/// - [`image::SynthesizedImage`] - a mapped image with optional relay stubs
/// - [`image::ExportView`] - the export directory as a PE loader sees it
/// - [`image::ImageLayout`] - offsets of every structure in an image
pub mod image;

/// Module loading, relay control and the unimplemented-entry hard stop.
pub mod loader;

/// Relay stub encoding, relay modes and the relay filter.
pub mod relay;

/// `peforge` Result type
///
/// A type alias for `std::result::Result<T, Error>` where the error type is always
/// [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `peforge` Error type
///
/// The main error type for all operations in this crate.
///
/// # Examples
///
/// ```rust,no_run
/// use peforge::{builtin::BuiltinEntry, BuiltinLoader, Error, LoaderConfig};
///
/// let loader = BuiltinLoader::new(Vec::<BuiltinEntry>::new(), LoaderConfig::new())?;
/// match loader.load_image("SHELL32", false) {
///     Ok(handle) => println!("Loaded at {handle}"),
///     Err(Error::ModuleNotFound(name)) => println!("No module {name}"),
///     Err(e) => println!("Error: {e}"),
/// }
/// # Ok::<(), peforge::Error>(())
/// ```
pub use error::Error;

/// Win32 error codes reported by the library-load façade.
pub use error::{ERROR_FILE_NOT_FOUND, ERROR_OUTOFMEMORY};

/// Main entry point for loading built-in modules.
///
/// See [`loader::BuiltinLoader`].
pub use loader::{BuiltinLoader, ModuleHandle, ProcName};

/// Loader configuration.
pub use config::{LoaderConfig, RelayConfig};

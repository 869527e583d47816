//! Library-load façade over [`BuiltinLoader`].
//!
//! Loading a built-in module as a library takes three steps beyond synthesizing its image:
//! a 16-bit companion module is created for the legacy subsystem, and the image is registered
//! in the module reference table of the surrounding loader. Both tables live outside this
//! crate and are reached through [`LegacyModuleTable`] and [`ModuleRefTable`].
//!
//! The operation is all or nothing. If a later step fails, whatever the earlier steps created
//! is released again and the failure is reported with a single Win32 error category through
//! [`Error::win32_code`].

use bitflags::bitflags;
use log::{debug, error, warn};

use crate::{
    loader::{canonical_path, BuiltinLoader, ModuleHandle},
    Error, Result,
};

bitflags! {
    /// Flags of a 16-bit module record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LegacyFlags: u16 {
        /// Single data segment
        const SINGLEDATA = 0x0001;
        /// Module wraps a 32-bit module
        const WIN32 = 0x0010;
        /// Module is built in
        const BUILTIN = 0x0020;
        /// Module is a library
        const LIBMODULE = 0x8000;
    }
}

impl LegacyFlags {
    /// Flags of the companion module of a built-in 32-bit library.
    pub const BUILTIN_WIN32: Self = Self::LIBMODULE
        .union(Self::SINGLEDATA)
        .union(Self::WIN32)
        .union(Self::BUILTIN);
}

/// The 16-bit module table.
pub trait LegacyModuleTable {
    /// Handle of a 16-bit module
    type Handle: Copy;

    /// Creates a companion module for the 32-bit `module` with the given path name and
    /// flags. A refusal is reported as its Win32 error code.
    ///
    /// # Errors
    ///
    /// The Win32 error code of the refusal.
    fn create_dummy(
        &mut self,
        path_name: &str,
        module: ModuleHandle,
        flags: LegacyFlags,
    ) -> std::result::Result<Self::Handle, u32>;

    /// Releases a companion module.
    fn free(&mut self, handle: Self::Handle);
}

/// The 32-bit module reference table.
pub trait ModuleRefTable {
    /// Record the table keeps per loaded module
    type Record;

    /// Creates a record for the image at `module`, or `None` if the table refuses it.
    fn create_module(&mut self, module: ModuleHandle, path_name: &str, flags: u32)
        -> Option<Self::Record>;
}

/// Everything a successful library load created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedLibrary<H, R> {
    /// Handle of the synthesized image
    pub module: ModuleHandle,
    /// Handle of the 16-bit companion module
    pub legacy: H,
    /// Module reference table record
    pub record: R,
    /// Canonical path name, `<NAME>.DLL`
    pub path_name: String,
}

/// Appends `.DLL` to `path` unless its file name already has an extension.
///
/// ```rust
/// use peforge::loader::library::library_file_name;
///
/// assert_eq!(library_file_name("kernel32"), "kernel32.DLL");
/// assert_eq!(library_file_name("c:\\dir.d\\user32"), "c:\\dir.d\\user32.DLL");
/// assert_eq!(library_file_name("gdi32.dll"), "gdi32.dll");
/// ```
#[must_use]
pub fn library_file_name(path: &str) -> String {
    let has_extension = path
        .rfind('.')
        .is_some_and(|dot| !path[dot..].contains(['/', '\\']));
    if has_extension {
        path.to_string()
    } else {
        format!("{path}.DLL")
    }
}

impl BuiltinLoader {
    /// Loads a built-in module as a library.
    ///
    /// The module is force-loaded, a companion module with [`LegacyFlags::BUILTIN_WIN32`] is
    /// created in `legacy` and a record is created in `records`.
    ///
    /// # Errors
    ///
    /// Returns the load error for an unknown module ([`Error::win32_code`] reports
    /// file-not-found), [`Error::LegacyModule`] if the companion module is refused, or
    /// [`Error::ModuleRecord`] if the record is refused (both out-of-memory). On error
    /// nothing created by this call is left behind.
    pub fn load_library<L, R>(
        &self,
        path: &str,
        flags: u32,
        legacy: &mut L,
        records: &mut R,
    ) -> Result<LoadedLibrary<L::Handle, R::Record>>
    where
        L: LegacyModuleTable,
        R: ModuleRefTable,
    {
        let file_name = library_file_name(path);
        let module = self.load_image(&file_name, true)?;
        let path_name = self.with_image(module, |image| canonical_path(image.descriptor()))?;

        let companion = match legacy.create_dummy(&path_name, module, LegacyFlags::BUILTIN_WIN32)
        {
            Ok(handle) => handle,
            Err(code) => {
                self.release(module);
                return Err(Error::LegacyModule(code));
            }
        };

        let Some(record) = records.create_module(module, &path_name, flags) else {
            error!("can't load {path_name}");
            legacy.free(companion);
            self.release(module);
            return Err(Error::ModuleRecord(path_name));
        };

        debug!("Loaded library {file_name} as {path_name} at {module}");
        Ok(LoadedLibrary {
            module,
            legacy: companion,
            record,
            path_name,
        })
    }

    fn release(&self, module: ModuleHandle) {
        if let Err(err) = self.unload(module) {
            warn!("Failed to release {module}: {err}");
        }
    }
}

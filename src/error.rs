use thiserror::Error;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// Win32 `ERROR_FILE_NOT_FOUND`.
pub const ERROR_FILE_NOT_FOUND: u32 = 2;

/// Win32 `ERROR_OUTOFMEMORY`.
pub const ERROR_OUTOFMEMORY: u32 = 14;

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Every failure except [`Error::UnimplementedEntry`] is recoverable and is handed back to the
/// caller as an `Err` value. Nothing in the loading pipeline unwinds or aborts on its own.
///
/// # Error Categories
///
/// ## Not found
/// - [`Error::ModuleNotFound`] - The requested name matches no built-in module
/// - [`Error::SymbolNotFound`] - An export name or ordinal is absent from a module
/// - [`Error::InvalidHandle`] - A module handle does not belong to the loader
///
/// ## Disabled by policy
/// - [`Error::ModuleDisabled`] - The module exists but is switched off and was not force-loaded
///
/// ## Resource exhaustion
/// - [`Error::OutOfMemory`] - The operating system refused the image allocation
/// - [`Error::Placement`] - No address was found from which every embedded offset fits 32 bits
/// - [`Error::OffsetOverflow`] - A self-relative offset or stub displacement does not fit
/// - [`Error::Protection`] - The operating system refused a protection change
/// - [`Error::LegacyModule`] - The 16-bit companion module could not be created
/// - [`Error::ModuleRecord`] - The module table refused the synthesized image
///
/// ## Invalid input
/// - [`Error::Malformed`] - A module descriptor has inconsistent tables
/// - [`Error::OutOfBounds`] - An image structure would be read or written past its buffer
/// - [`Error::Config`] - A configuration string could not be parsed
///
/// ## Terminal
/// - [`Error::UnimplementedEntry`] - An export without implementation was requested.
///   This is non-recoverable by contract, see [`crate::loader::unimplemented`]
///
/// # Examples
///
/// ```rust,ignore
/// use peforge::{BuiltinLoader, Error};
///
/// match loader.load_image("KERNEL32.DLL", false) {
///     Ok(handle) => println!("loaded at {handle}"),
///     Err(Error::ModuleDisabled(name)) => eprintln!("{name} is switched off"),
///     Err(e) if e.win32_code() == Some(peforge::ERROR_FILE_NOT_FOUND) => eprintln!("no such module"),
///     Err(e) => eprintln!("load failed: {e}"),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// No built-in module carries the requested name.
    #[error("No built-in module named '{0}'")]
    ModuleNotFound(String),

    /// The module exists but is disabled and the load was not forced.
    #[error("Built-in module '{0}' is disabled")]
    ModuleDisabled(String),

    /// The executable region for an image could not be allocated.
    ///
    /// # Fields
    ///
    /// * `size` - Number of bytes that were requested
    /// * `source` - The operating system error
    #[error("Failed to allocate {size} bytes for a module image: {source}")]
    OutOfMemory {
        /// The requested size in bytes
        size: usize,
        /// The underlying operating system error
        source: std::io::Error,
    },

    /// Memory could be allocated, but never at an address from which all referenced code and
    /// data is reachable through 32-bit offsets.
    #[error("No placement for a {size} byte image keeps all offsets within 32 bits")]
    Placement {
        /// The requested size in bytes
        size: usize,
    },

    /// The protection of an image region could not be changed.
    #[error("Failed to change the protection of a module image: {0}")]
    Protection(std::io::Error),

    /// A self-relative offset or a stub displacement does not fit its encoded width.
    #[error("Offset of {what} overflows: target {target:#x}, base {base:#x}")]
    OffsetOverflow {
        /// Which field was being encoded
        what: &'static str,
        /// Address the offset should reach
        target: usize,
        /// Address the offset is relative to
        base: usize,
    },

    /// A module descriptor is internally inconsistent.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// The handle does not refer to an image owned by this loader.
    #[error("Invalid module handle {0:#x}")]
    InvalidHandle(usize),

    /// An export was requested that the module does not have.
    #[error("Symbol not found - {0}")]
    SymbolNotFound(String),

    /// An export slot without implementation was requested.
    ///
    /// Calling such an entry point has no recovery path. Callers that need the hard stop
    /// hand this error to [`crate::loader::unimplemented::fatal`].
    #[error("No handler for Win32 routine {module}.{ordinal}: {name}")]
    UnimplementedEntry {
        /// Module name
        module: String,
        /// Biased export ordinal
        ordinal: u32,
        /// Export name, or `???` when the ordinal has none
        name: String,
    },

    /// The legacy 16-bit companion module could not be created.
    #[error("Failed to create the 16-bit companion module - error {0}")]
    LegacyModule(u32),

    /// The surrounding loader refused to create a module record for a synthesized image.
    #[error("Failed to create a module record for {0}")]
    ModuleRecord(String),

    /// An out of bound access was attempted while reading or writing image structures.
    #[error("Out of Bound access would have occurred!")]
    OutOfBounds,

    /// A configuration string could not be parsed.
    #[error("Invalid configuration - {0}")]
    Config(String),

    /// Failed to lock target.
    ///
    /// This error occurs when a lock guarding the loaded images has been poisoned by a
    /// panicking thread.
    #[error("Failed to lock target")]
    LockError,
}

impl Error {
    /// Maps this error onto the Win32 error category reported by the library-load façade.
    ///
    /// Lookup failures map to `ERROR_FILE_NOT_FOUND`, allocation and bookkeeping failures to
    /// `ERROR_OUTOFMEMORY`. Configuration and terminal errors have no Win32 counterpart.
    #[must_use]
    pub fn win32_code(&self) -> Option<u32> {
        match self {
            Error::ModuleNotFound(_) | Error::ModuleDisabled(_) | Error::SymbolNotFound(_) => {
                Some(ERROR_FILE_NOT_FOUND)
            }
            Error::OutOfMemory { .. }
            | Error::Placement { .. }
            | Error::Protection(_)
            | Error::OffsetOverflow { .. }
            | Error::LegacyModule(_)
            | Error::ModuleRecord(_)
            | Error::InvalidHandle(_)
            | Error::LockError => Some(ERROR_OUTOFMEMORY),
            Error::Malformed { .. }
            | Error::OutOfBounds
            | Error::Config(_)
            | Error::UnimplementedEntry { .. } => None,
        }
    }

    /// Returns `true` for errors that must end the process.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::UnimplementedEntry { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn win32_categories() {
        assert_eq!(
            Error::ModuleNotFound("FOO".into()).win32_code(),
            Some(ERROR_FILE_NOT_FOUND)
        );
        assert_eq!(
            Error::ModuleDisabled("FOO".into()).win32_code(),
            Some(ERROR_FILE_NOT_FOUND)
        );
        assert_eq!(
            Error::Placement { size: 4096 }.win32_code(),
            Some(ERROR_OUTOFMEMORY)
        );
        assert_eq!(Error::LegacyModule(11).win32_code(), Some(ERROR_OUTOFMEMORY));
        assert_eq!(Error::Config("x".into()).win32_code(), None);
    }

    #[test]
    fn unimplemented_is_terminal() {
        let error = Error::UnimplementedEntry {
            module: "FOO".into(),
            ordinal: 3,
            name: "Bar".into(),
        };
        assert!(error.is_terminal());
        assert_eq!(error.to_string(), "No handler for Win32 routine FOO.3: Bar");
        assert!(!Error::LockError.is_terminal());
    }

    #[test]
    fn malformed_macro() {
        let error = malformed_error!("table {} too short", "names");
        match error {
            Error::Malformed { message, line, .. } => {
                assert_eq!(message, "table names too short");
                assert!(line > 0);
            }
            _ => panic!("expected Malformed"),
        }
    }
}

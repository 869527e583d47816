//! Static export metadata of one built-in module.
//!
//! A [`ModuleDescriptor`] is the compiled-in description of everything a built-in module
//! exports: its name, its ordinal base, the ordinal-indexed function table with one
//! argument code per slot, and the name table with its name-to-ordinal companion. It is
//! plain `'static` data and is never mutated; the image synthesizer points the synthesized
//! export directory straight at the descriptor's strings and ordinal table.
//!
//! # Table shapes
//!
//! ```text
//! functions[i]  args[i]  arg_types[i]     i = 0 .. nb_funcs
//! names[j]      ordinals[j]               j = 0 .. nb_names, ordinals[j] indexes functions
//! ```
//!
//! # Examples
//!
//! ```rust,ignore
//! use peforge::builtin::{EntryPoint, ModuleDescriptor};
//!
//! unsafe extern "C" fn beep() {}
//!
//! static FUNCTIONS: [Option<EntryPoint>; 2] = [Some(beep), None];
//! pub static DEMO: ModuleDescriptor = ModuleDescriptor {
//!     name: c"DEMO32",
//!     base: 1,
//!     functions: &FUNCTIONS,
//!     args: &[0x02, 0xff],
//!     arg_types: &[0, 0],
//!     names: &[Some(c"Beep"), Some(c"Missing")],
//!     ordinals: &[0, 1],
//!     entry_point: None,
//! };
//! ```

use std::{borrow::Cow, ffi::CStr};

use crate::Result;

/// Address-only view of an exported function.
///
/// The real signature of each export differs; the descriptor only needs an address that can
/// be embedded in the image, so every entry is stored as this erased function pointer.
pub type EntryPoint = unsafe extern "C" fn();

/// Compiled-in description of a built-in module's exports.
#[derive(Debug)]
pub struct ModuleDescriptor {
    /// Module name without extension, e.g. `KERNEL32`
    pub name: &'static CStr,
    /// Ordinal bias added to every function index
    pub base: u32,
    /// Ordinal-indexed function table, `None` marks an unimplemented slot
    pub functions: &'static [Option<EntryPoint>],
    /// Per-function argument code, see [`crate::relay::ArgCode`]
    pub args: &'static [u8],
    /// Per-function argument type mask, handed to the relay tracer
    pub arg_types: &'static [u32],
    /// Exported names, `None` for a name slot that is skipped
    pub names: &'static [Option<&'static CStr>],
    /// Function index for each entry of `names`
    pub ordinals: &'static [u16],
    /// Optional module entry point
    pub entry_point: Option<EntryPoint>,
}

impl ModuleDescriptor {
    /// Number of function slots.
    #[must_use]
    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    /// Number of exported names.
    #[must_use]
    pub fn name_count(&self) -> usize {
        self.names.len()
    }

    /// The module name as text.
    #[must_use]
    pub fn module_name(&self) -> Cow<'static, str> {
        self.name.to_string_lossy()
    }

    /// Returns the function at `index`, or `None` for an empty or out-of-range slot.
    #[must_use]
    pub fn function(&self, index: usize) -> Option<EntryPoint> {
        self.functions.get(index).copied().flatten()
    }

    /// Returns the raw argument code of the function at `index`.
    #[must_use]
    pub fn arg_code(&self, index: usize) -> Option<u8> {
        self.args.get(index).copied()
    }

    /// Returns the argument type mask of the function at `index`, zero when none is recorded.
    #[must_use]
    pub fn arg_type(&self, index: usize) -> u32 {
        self.arg_types.get(index).copied().unwrap_or(0)
    }

    /// Returns the exported name of the function at `index`.
    ///
    /// The first entry of the ordinal table pointing at `index` wins.
    #[must_use]
    pub fn export_name(&self, index: usize) -> Option<&'static CStr> {
        self.ordinals
            .iter()
            .position(|&ordinal| usize::from(ordinal) == index)
            .and_then(|j| self.names.get(j).copied().flatten())
    }

    /// Returns the function index exported under `name`, compared case-sensitively as the
    /// export name table is.
    #[must_use]
    pub fn index_of_name(&self, name: &str) -> Option<usize> {
        self.names
            .iter()
            .position(|entry| entry.is_some_and(|n| n.to_bytes() == name.as_bytes()))
            .and_then(|j| self.ordinals.get(j))
            .map(|&ordinal| usize::from(ordinal))
    }

    /// Returns the biased ordinal of the function at `index`.
    #[must_use]
    pub fn biased_ordinal(&self, index: usize) -> u32 {
        self.base.wrapping_add(index as u32)
    }

    /// Formats the diagnostic label `"<module>.<ordinal>: <name>"` of the function at `index`.
    ///
    /// The ordinal is biased by the module base; functions without a name print `???`.
    #[must_use]
    pub fn label(&self, index: usize) -> String {
        let name = self
            .export_name(index)
            .map_or(Cow::Borrowed("???"), CStr::to_string_lossy);
        format!(
            "{}.{}: {}",
            self.module_name(),
            self.biased_ordinal(index),
            name
        )
    }

    /// Checks that the parallel tables agree with each other.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] when the argument tables do not match the function
    /// table, the name and ordinal tables differ in length, an ordinal points past the
    /// function table, or the module name is empty.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(malformed_error!("Module descriptor without a name"));
        }

        let module = self.module_name();
        let nb_funcs = self.functions.len();
        if self.args.len() != nb_funcs {
            return Err(malformed_error!(
                "{}: {} argument codes for {} functions",
                module,
                self.args.len(),
                nb_funcs
            ));
        }

        if !self.arg_types.is_empty() && self.arg_types.len() != nb_funcs {
            return Err(malformed_error!(
                "{}: {} argument types for {} functions",
                module,
                self.arg_types.len(),
                nb_funcs
            ));
        }

        if self.names.len() != self.ordinals.len() {
            return Err(malformed_error!(
                "{}: {} names but {} ordinals",
                module,
                self.names.len(),
                self.ordinals.len()
            ));
        }

        if let Some(bad) = self
            .ordinals
            .iter()
            .find(|&&ordinal| usize::from(ordinal) >= nb_funcs)
        {
            return Err(malformed_error!(
                "{}: ordinal {} outside of {} functions",
                module,
                bad,
                nb_funcs
            ));
        }

        if u32::try_from(nb_funcs)
            .ok()
            .and_then(|n| self.base.checked_add(n))
            .is_none()
        {
            return Err(malformed_error!("{}: ordinal base overflows", module));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    unsafe extern "C" fn first() {}
    unsafe extern "C" fn second() {}

    static FUNCTIONS: [Option<EntryPoint>; 3] = [Some(first), None, Some(second)];

    static SAMPLE: ModuleDescriptor = ModuleDescriptor {
        name: c"SAMPLE",
        base: 5,
        functions: &FUNCTIONS,
        args: &[0x01, 0xff, 0x82],
        arg_types: &[0x1, 0, 0x3],
        names: &[Some(c"Second"), Some(c"First"), None],
        ordinals: &[2, 0, 1],
        entry_point: None,
    };

    #[test]
    fn lookups() {
        assert!(SAMPLE.validate().is_ok());
        assert_eq!(SAMPLE.function_count(), 3);
        assert_eq!(SAMPLE.name_count(), 3);
        assert!(SAMPLE.function(0).is_some());
        assert!(SAMPLE.function(1).is_none());
        assert!(SAMPLE.function(7).is_none());
        assert_eq!(SAMPLE.export_name(0), Some(c"First"));
        assert_eq!(SAMPLE.export_name(2), Some(c"Second"));
        assert_eq!(SAMPLE.export_name(1), None);
        assert_eq!(SAMPLE.index_of_name("Second"), Some(2));
        assert_eq!(SAMPLE.index_of_name("second"), None);
        assert_eq!(SAMPLE.arg_type(2), 0x3);
        assert_eq!(SAMPLE.arg_type(9), 0);
    }

    #[test]
    fn labels_use_biased_ordinals() {
        assert_eq!(SAMPLE.label(0), "SAMPLE.5: First");
        assert_eq!(SAMPLE.label(2), "SAMPLE.7: Second");
        assert_eq!(SAMPLE.label(1), "SAMPLE.6: ???");
    }

    #[test]
    fn lookups_tolerate_unvalidated_tables() {
        static LOPSIDED: ModuleDescriptor = ModuleDescriptor {
            name: c"LOPSIDED",
            base: 1,
            functions: &FUNCTIONS,
            args: &[0, 0, 0],
            arg_types: &[],
            names: &[Some(c"Only"), Some(c"Orphan")],
            ordinals: &[1, 2, 0],
            entry_point: None,
        };
        assert!(LOPSIDED.validate().is_err());
        assert_eq!(LOPSIDED.export_name(1), Some(c"Only"));
        assert_eq!(LOPSIDED.export_name(0), None);
        assert_eq!(LOPSIDED.index_of_name("Orphan"), Some(2));
        assert_eq!(LOPSIDED.label(0), "LOPSIDED.1: ???");

        static NO_ORDINALS: ModuleDescriptor = ModuleDescriptor {
            name: c"LOPSIDED",
            base: 1,
            functions: &FUNCTIONS,
            args: &[0, 0, 0],
            arg_types: &[],
            names: &[Some(c"Stray")],
            ordinals: &[],
            entry_point: None,
        };
        assert_eq!(NO_ORDINALS.index_of_name("Stray"), None);
    }

    #[test]
    fn validate_rejects_mismatched_tables() {
        static SHORT_ARGS: ModuleDescriptor = ModuleDescriptor {
            name: c"BROKEN",
            base: 1,
            functions: &FUNCTIONS,
            args: &[0x01],
            arg_types: &[],
            names: &[],
            ordinals: &[],
            entry_point: None,
        };
        assert!(matches!(
            SHORT_ARGS.validate(),
            Err(Error::Malformed { .. })
        ));

        static BAD_ORDINAL: ModuleDescriptor = ModuleDescriptor {
            name: c"BROKEN",
            base: 1,
            functions: &FUNCTIONS,
            args: &[0, 0, 0],
            arg_types: &[],
            names: &[Some(c"Far")],
            ordinals: &[3],
            entry_point: None,
        };
        assert!(BAD_ORDINAL.validate().is_err());

        static UNNAMED: ModuleDescriptor = ModuleDescriptor {
            name: c"",
            base: 1,
            functions: &[],
            args: &[],
            arg_types: &[],
            names: &[],
            ordinals: &[],
            entry_point: None,
        };
        assert!(UNNAMED.validate().is_err());
    }
}

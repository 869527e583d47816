//! Catalog of built-in modules and their enablement state.
//!
//! The [`Registry`] pairs an immutable catalog of [`BuiltinEntry`] values with a mutable
//! enablement map keyed by [`ModuleId`]. The catalog never changes after construction; the
//! map starts from each entry's default and only ever changes through [`Registry::enable`]
//! (a forced load) or configuration overrides applied when a loader is created.

use dashmap::DashMap;
use log::warn;

use crate::{builtin::ModuleDescriptor, config::ModuleOverride, Result};

/// Identity of a module inside one [`Registry`], the index of its catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(usize);

impl ModuleId {
    /// Catalog index of this module.
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

/// One catalog line: a descriptor and whether it is usable without a forced load.
#[derive(Debug, Clone, Copy)]
pub struct BuiltinEntry {
    /// Export metadata of the module
    pub descriptor: &'static ModuleDescriptor,
    /// Enablement before any forced load or override
    pub enabled_by_default: bool,
}

impl BuiltinEntry {
    /// A module that loads without being forced.
    #[must_use]
    pub const fn enabled(descriptor: &'static ModuleDescriptor) -> Self {
        Self {
            descriptor,
            enabled_by_default: true,
        }
    }

    /// A module that is skipped unless a load forces it.
    #[must_use]
    pub const fn disabled(descriptor: &'static ModuleDescriptor) -> Self {
        Self {
            descriptor,
            enabled_by_default: false,
        }
    }
}

/// Immutable module catalog with a process-lifetime enablement map.
pub struct Registry {
    catalog: Vec<BuiltinEntry>,
    enabled: DashMap<ModuleId, bool>,
}

impl Registry {
    /// Creates a registry over `catalog`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] when a descriptor fails
    /// [`ModuleDescriptor::validate`] or two entries share a name (compared without case).
    pub fn new<I>(catalog: I) -> Result<Self>
    where
        I: IntoIterator<Item = BuiltinEntry>,
    {
        let catalog: Vec<BuiltinEntry> = catalog.into_iter().collect();
        for (index, entry) in catalog.iter().enumerate() {
            entry.descriptor.validate()?;

            let name = entry.descriptor.name.to_bytes();
            if catalog[..index]
                .iter()
                .any(|other| other.descriptor.name.to_bytes().eq_ignore_ascii_case(name))
            {
                return Err(malformed_error!(
                    "Duplicate built-in module {}",
                    entry.descriptor.module_name()
                ));
            }
        }

        let enabled = catalog
            .iter()
            .enumerate()
            .map(|(index, entry)| (ModuleId(index), entry.enabled_by_default))
            .collect();

        Ok(Registry { catalog, enabled })
    }

    /// Number of catalog entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.catalog.len()
    }

    /// Returns `true` if the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.catalog.is_empty()
    }

    /// Finds the module a requested name refers to.
    ///
    /// The request may carry a directory and an extension, both are stripped by
    /// [`normalize_module_name`] before a case-insensitive comparison.
    #[must_use]
    pub fn find(&self, requested: &str) -> Option<ModuleId> {
        let wanted = normalize_module_name(requested).as_bytes();
        self.catalog
            .iter()
            .position(|entry| entry.descriptor.name.to_bytes().eq_ignore_ascii_case(wanted))
            .map(ModuleId)
    }

    /// Returns the descriptor of `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` was produced by a different registry with a longer catalog.
    #[must_use]
    pub fn descriptor(&self, id: ModuleId) -> &'static ModuleDescriptor {
        self.catalog[id.0].descriptor
    }

    /// Returns the current enablement of `id`.
    #[must_use]
    pub fn is_enabled(&self, id: ModuleId) -> bool {
        self.enabled.get(&id).is_some_and(|flag| *flag)
    }

    /// Enables `id` for the rest of the registry's lifetime.
    ///
    /// Returns `true` if the module was disabled before.
    pub fn enable(&self, id: ModuleId) -> bool {
        !self.enabled.insert(id, true).unwrap_or(false)
    }

    /// Applies enable/disable overrides by module name.
    ///
    /// Names that match no module are reported and skipped. Returns the number of overrides
    /// that took effect.
    pub fn apply_overrides(&self, overrides: &[ModuleOverride]) -> usize {
        let mut applied = 0;
        for item in overrides {
            match self.find(&item.name) {
                Some(id) => {
                    self.enabled.insert(id, item.enabled);
                    applied += 1;
                }
                None => warn!("Override for unknown built-in module {}", item.name),
            }
        }
        applied
    }

    /// Iterates over the catalog with the current enablement of every entry.
    pub fn iter(&self) -> impl Iterator<Item = (ModuleId, &'static ModuleDescriptor, bool)> + '_ {
        self.catalog.iter().enumerate().map(|(index, entry)| {
            let id = ModuleId(index);
            (id, entry.descriptor, self.is_enabled(id))
        })
    }
}

/// Reduces a requested module path to the bare module name.
///
/// Everything up to the last path separator (`\` or `/`) is dropped, then everything from
/// the last `.` on.
///
/// ```rust
/// use peforge::builtin::normalize_module_name;
///
/// assert_eq!(normalize_module_name("C:\\WINDOWS\\SYSTEM\\kernel32.dll"), "kernel32");
/// assert_eq!(normalize_module_name("user32"), "user32");
/// ```
#[must_use]
pub fn normalize_module_name(path: &str) -> &str {
    let file = path
        .rfind(['\\', '/'])
        .map_or(path, |separator| &path[separator + 1..]);
    file.rfind('.').map_or(file, |dot| &file[..dot])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{builtin::EntryPoint, Error};

    unsafe extern "C" fn noop() {}

    static FUNCTIONS: [Option<EntryPoint>; 1] = [Some(noop)];

    static ALPHA: ModuleDescriptor = ModuleDescriptor {
        name: c"ALPHA32",
        base: 1,
        functions: &FUNCTIONS,
        args: &[0],
        arg_types: &[],
        names: &[Some(c"Noop")],
        ordinals: &[0],
        entry_point: None,
    };

    static BETA: ModuleDescriptor = ModuleDescriptor {
        name: c"BETA",
        base: 1,
        functions: &FUNCTIONS,
        args: &[0],
        arg_types: &[],
        names: &[],
        ordinals: &[],
        entry_point: None,
    };

    static ALPHA_AGAIN: ModuleDescriptor = ModuleDescriptor {
        name: c"alpha32",
        base: 1,
        functions: &[],
        args: &[],
        arg_types: &[],
        names: &[],
        ordinals: &[],
        entry_point: None,
    };

    fn registry() -> Registry {
        Registry::new([BuiltinEntry::enabled(&ALPHA), BuiltinEntry::disabled(&BETA)]).unwrap()
    }

    #[test]
    fn normalize() {
        assert_eq!(normalize_module_name("KERNEL32.DLL"), "KERNEL32");
        assert_eq!(normalize_module_name("c:\\windows\\system\\gdi32.dll"), "gdi32");
        assert_eq!(normalize_module_name("/usr/lib/wine/ole32.dll.so"), "ole32.dll");
        assert_eq!(normalize_module_name("dir.d\\plain"), "plain");
        assert_eq!(normalize_module_name(""), "");
    }

    #[test]
    fn find_is_case_insensitive() {
        let registry = registry();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.find("alpha32.dll").map(ModuleId::index), Some(0));
        assert_eq!(registry.find("C:\\x\\Beta.DLL").map(ModuleId::index), Some(1));
        assert!(registry.find("gamma").is_none());
    }

    #[test]
    fn enable_is_sticky() {
        let registry = registry();
        let beta = registry.find("beta").unwrap();
        assert!(!registry.is_enabled(beta));
        assert!(registry.enable(beta));
        assert!(registry.is_enabled(beta));
        assert!(!registry.enable(beta));
    }

    #[test]
    fn overrides() {
        let registry = registry();
        let applied = registry.apply_overrides(&[
            ModuleOverride {
                name: "alpha32".into(),
                enabled: false,
            },
            ModuleOverride {
                name: "missing".into(),
                enabled: true,
            },
        ]);
        assert_eq!(applied, 1);
        let states: Vec<bool> = registry.iter().map(|(_, _, enabled)| enabled).collect();
        assert_eq!(states, vec![false, false]);
    }

    #[test]
    fn duplicates_are_rejected() {
        let result = Registry::new([
            BuiltinEntry::enabled(&ALPHA),
            BuiltinEntry::enabled(&ALPHA_AGAIN),
        ]);
        assert!(matches!(result, Err(Error::Malformed { .. })));
    }
}

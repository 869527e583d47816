//! Loading of built-in modules and relay debugging over the loaded images.
//!
//! [`BuiltinLoader`] owns a [`Registry`] and every [`SynthesizedImage`] it produced. It
//! resolves requested names, applies the enable / disable policy, synthesizes images on
//! demand and hands out [`ModuleHandle`]s, which are the image base addresses. The relay side
//! switches the stubs of all loaded images between direct and traced dispatch and maps relay
//! return addresses back to the exports they belong to.
//!
//! # Concurrency
//!
//! The enablement map is a concurrent map; the loaded images and the current dispatch mode
//! share one reader-writer lock. Loading, unloading and switching relay tracing take the
//! write side, so stub re-encoding never overlaps another writer or a resolution. Calls that
//! are executing *through* a stub are not synchronized with a switch. Stub records are packed
//! behind the name table without padding and are not rewritten atomically, so a call entering
//! a stub during a switch may run a half-written record. Switch tracing while no other thread
//! is calling through built-in exports, or accept that window.
//!
//! # Examples
//!
//! ```rust,ignore
//! use peforge::{BuiltinLoader, LoaderConfig, ProcName};
//!
//! let loader = BuiltinLoader::new(CATALOG, LoaderConfig::from_env()?)?;
//! let kernel32 = loader.load_image("C:\\WINDOWS\\SYSTEM\\KERNEL32.DLL", false)?;
//! let beep = loader.proc_address(kernel32, ProcName::Name("Beep"))?;
//! ```

pub mod library;
pub mod unimplemented;

use std::{fmt, num::NonZeroUsize, ops::Range, sync::RwLock};

use log::{debug, info, trace, warn};

use crate::{
    builtin::{BuiltinEntry, ModuleDescriptor, ModuleId, Registry},
    config::LoaderConfig,
    image::{synthesize, ExportView, SynthesizedImage},
    relay::{DispatchMode, RelayEntry},
    Error, Result,
};

pub use library::{LegacyFlags, LegacyModuleTable, LoadedLibrary, ModuleRefTable};
pub use unimplemented::{describe_unimplemented, fatal, unimplemented_entry};

/// Handle of a loaded built-in module, the base address of its image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleHandle(NonZeroUsize);

impl ModuleHandle {
    /// Wraps a raw image base address.
    #[must_use]
    pub fn from_address(address: usize) -> Option<Self> {
        NonZeroUsize::new(address).map(ModuleHandle)
    }

    /// The image base address.
    #[must_use]
    pub fn address(self) -> usize {
        self.0.get()
    }
}

impl fmt::Display for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.address())
    }
}

/// How an export is requested from a loaded module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcName<'a> {
    /// By exported name, compared exactly
    Name(&'a str),
    /// By biased ordinal
    Ordinal(u32),
}

/// Summary of one loaded image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    /// Module handle
    pub handle: ModuleHandle,
    /// Catalog identity
    pub id: ModuleId,
    /// Module name
    pub name: String,
    /// Canonical path name, `<NAME>.DLL`
    pub path_name: String,
    /// `SizeOfImage`
    pub size: usize,
    /// Absolute range of the stub array, empty when the image has none
    pub stubs: Range<usize>,
}

/// Canonical path name reported for a built-in module.
#[must_use]
pub fn canonical_path(descriptor: &ModuleDescriptor) -> String {
    format!("{}.DLL", descriptor.module_name())
}

struct LoadedImage {
    id: ModuleId,
    image: SynthesizedImage,
}

struct LoaderState {
    images: Vec<LoadedImage>,
    dispatch: DispatchMode,
}

/// Loader of built-in modules.
///
/// Every load synthesizes a new image, even for a module that is already loaded; only the
/// enablement of a forced module is remembered. Images live until they are unloaded or the
/// loader is dropped.
pub struct BuiltinLoader {
    registry: Registry,
    config: LoaderConfig,
    state: RwLock<LoaderState>,
}

impl BuiltinLoader {
    /// Creates a loader over `catalog`, applying the enablement overrides of `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Malformed`] for an invalid catalog and [`Error::Config`] for an
    /// inconsistent relay configuration.
    pub fn new<I>(catalog: I, config: LoaderConfig) -> Result<Self>
    where
        I: IntoIterator<Item = BuiltinEntry>,
    {
        let registry = Registry::new(catalog)?;
        let applied = registry.apply_overrides(&config.overrides);
        if applied > 0 {
            debug!("Applied {applied} module override(s)");
        }
        Self::with_registry(registry, config)
    }

    /// Creates a loader over an existing registry. Overrides in `config` are not applied.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an inconsistent relay configuration.
    pub fn with_registry(registry: Registry, config: LoaderConfig) -> Result<Self> {
        config.relay.validate()?;
        let dispatch = config.relay.mode.initial_dispatch();
        Ok(BuiltinLoader {
            registry,
            config,
            state: RwLock::new(LoaderState {
                images: Vec::new(),
                dispatch,
            }),
        })
    }

    /// The module catalog and its enablement.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The configuration the loader was created with.
    #[must_use]
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Loads the built-in module `name` refers to.
    ///
    /// `name` may carry a directory and an extension. A disabled module is only loaded when
    /// `force` is set, which also enables it for every later load.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ModuleNotFound`] for an unknown name, [`Error::ModuleDisabled`] for a
    /// disabled module without `force`, or the error of image synthesis.
    pub fn load_image(&self, name: &str, force: bool) -> Result<ModuleHandle> {
        let Some(id) = self.registry.find(name) else {
            return Err(Error::ModuleNotFound(name.to_string()));
        };
        let descriptor = self.registry.descriptor(id);

        if !self.registry.is_enabled(id) {
            if !force {
                debug!("Skipping disabled built-in module {}", descriptor.module_name());
                return Err(Error::ModuleDisabled(descriptor.module_name().into_owned()));
            }
            if self.registry.enable(id) {
                info!("Built-in module {} enabled by forced load", descriptor.module_name());
            }
        }

        let mut state = write_lock!(self.state);
        let image = synthesize(descriptor, &self.config.relay, state.dispatch)?;
        let handle = ModuleHandle::from_address(image.base()).ok_or(Error::InvalidHandle(0))?;
        state.images.push(LoadedImage { id, image });

        debug!("Loaded {} as {handle}", canonical_path(descriptor));
        Ok(handle)
    }

    /// Releases the image behind `handle`.
    ///
    /// The module's enablement is not touched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] if `handle` does not belong to this loader.
    pub fn unload(&self, handle: ModuleHandle) -> Result<()> {
        let mut state = write_lock!(self.state);
        let Some(position) = state
            .images
            .iter()
            .position(|loaded| loaded.image.base() == handle.address())
        else {
            return Err(Error::InvalidHandle(handle.address()));
        };

        let loaded = state.images.remove(position);
        debug!(
            "Unloaded {} from {handle}",
            loaded.image.descriptor().module_name()
        );
        Ok(())
    }

    /// Summaries of all loaded images, in load order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockError`] if the image lock is poisoned.
    pub fn loaded(&self) -> Result<Vec<ModuleInfo>> {
        let state = read_lock!(self.state);
        Ok(state
            .images
            .iter()
            .filter_map(|loaded| {
                let image = &loaded.image;
                Some(ModuleInfo {
                    handle: ModuleHandle::from_address(image.base())?,
                    id: loaded.id,
                    name: image.descriptor().module_name().into_owned(),
                    path_name: canonical_path(image.descriptor()),
                    size: image.size(),
                    stubs: image.stub_range(),
                })
            })
            .collect())
    }

    /// Runs `f` on the image behind `handle`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] if `handle` does not belong to this loader.
    pub fn with_image<R>(
        &self,
        handle: ModuleHandle,
        f: impl FnOnce(&SynthesizedImage) -> R,
    ) -> Result<R> {
        let state = read_lock!(self.state);
        state
            .images
            .iter()
            .find(|loaded| loaded.image.base() == handle.address())
            .map(|loaded| f(&loaded.image))
            .ok_or(Error::InvalidHandle(handle.address()))
    }

    /// Resolves an export of a loaded module to its address.
    ///
    /// The export directory of the image is walked exactly as a PE loader would. For a
    /// relayed export the result is the address of its stub.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] for an unknown handle, [`Error::SymbolNotFound`] for
    /// an absent name or ordinal, and [`Error::UnimplementedEntry`] for an export whose
    /// function slot is empty.
    pub fn proc_address(&self, handle: ModuleHandle, proc: ProcName<'_>) -> Result<usize> {
        let state = read_lock!(self.state);
        let Some(loaded) = state
            .images
            .iter()
            .find(|loaded| loaded.image.base() == handle.address())
        else {
            return Err(Error::InvalidHandle(handle.address()));
        };

        let view = ExportView::new(&loaded.image)?;
        let index = match proc {
            ProcName::Name(name) => view.lookup_name(name).ok_or_else(|| {
                Error::SymbolNotFound(format!(
                    "{}.{}",
                    view.module_name().to_string_lossy(),
                    name
                ))
            })?,
            ProcName::Ordinal(ordinal) => view.index_of_ordinal(ordinal)?,
        };

        view.function_address(index).ok_or_else(|| {
            let descriptor = loaded.image.descriptor();
            describe_unimplemented(descriptor, descriptor.biased_ordinal(index))
        })
    }

    /// Returns `true` while newly built and existing stubs dispatch through the trampoline.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockError`] if the image lock is poisoned.
    pub fn is_tracing(&self) -> Result<bool> {
        Ok(read_lock!(self.state).dispatch == DispatchMode::Traced)
    }

    /// Switches every relay stub of every loaded image to traced (`enabled`) or direct
    /// dispatch. Images loaded afterwards are built in the same form.
    ///
    /// Does nothing when the loader builds images without stubs. Returns the number of
    /// stubs that changed.
    ///
    /// A switch is all or nothing: if any image fails to re-encode, the images already
    /// switched are put back and the tracing state is left unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when tracing is switched on without a trampoline address,
    /// and the re-encoding errors of [`SynthesizedImage::reencode`].
    pub fn set_relay_tracing(&self, enabled: bool) -> Result<usize> {
        if !self.config.relay.mode.is_capable() {
            debug!("Relay tracing unavailable, images carry no stubs");
            return Ok(0);
        }

        let mode = if enabled {
            DispatchMode::Traced
        } else {
            DispatchMode::Direct
        };
        if mode == DispatchMode::Traced && self.config.relay.trampoline.is_none() {
            return Err(Error::Config(
                "relay tracing requires a trampoline address".to_string(),
            ));
        }

        let mut state = write_lock!(self.state);
        let changed = self.switch_images(&mut state, mode, self.config.relay.trampoline)?;

        info!("Relay tracing switched to {mode}, {changed} stub(s) rewritten");
        Ok(changed)
    }

    /// Re-encodes the stubs of every enabled image for `mode`, undoing the images already
    /// switched when one fails.
    fn switch_images(
        &self,
        state: &mut LoaderState,
        mode: DispatchMode,
        trampoline: Option<usize>,
    ) -> Result<usize> {
        let previous = state.dispatch;
        let mut changed = 0;
        for position in 0..state.images.len() {
            let loaded = &mut state.images[position];
            if !self.registry.is_enabled(loaded.id) {
                continue;
            }
            match loaded.image.reencode(mode, trampoline) {
                Ok(count) => changed += count,
                Err(err) => {
                    for undo in &mut state.images[..=position] {
                        if let Err(undo_err) =
                            undo.image.reencode(previous, self.config.relay.trampoline)
                        {
                            warn!(
                                "{}: stubs left in {mode} form: {undo_err}",
                                undo.image.descriptor().module_name()
                            );
                        }
                    }
                    return Err(err);
                }
            }
        }
        state.dispatch = mode;
        Ok(changed)
    }

    /// Maps a relay return address back to the export whose stub it belongs to.
    ///
    /// A miss is reported and answered with `None`; it never fails otherwise.
    #[must_use]
    pub fn resolve_relay(&self, address: usize) -> Option<RelayEntry> {
        let Ok(state) = self.state.read() else {
            warn!("Image lock poisoned while resolving relay address {address:#x}");
            return None;
        };

        let found = state.images.iter().find_map(|loaded| {
            if !self.registry.is_enabled(loaded.id) {
                return None;
            }
            let index = loaded.image.stub_index(address)?;
            let descriptor = loaded.image.descriptor();
            let function = descriptor.function(index)?;
            Some(RelayEntry {
                label: descriptor.label(index),
                arg_types: descriptor.arg_type(index),
                function: function as usize,
                index,
            })
        });

        if found.is_none() {
            warn!("No relay entry for address {address:#x}");
        }
        found
    }

    /// Logs a relay call through the stub `return_address` belongs to and returns its label.
    ///
    /// Unknown addresses are logged with a generic label.
    pub fn log_relay_call(&self, return_address: usize) -> String {
        let label = match self.resolve_relay(return_address) {
            Some(entry) => entry.label,
            None => format!("???.???: {return_address:#x}"),
        };
        trace!(target: "relay", "Call {label}");
        label
    }
}

impl fmt::Debug for BuiltinLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let loaded = self.state.read().map(|state| state.images.len()).unwrap_or(0);
        f.debug_struct("BuiltinLoader")
            .field("modules", &self.registry.len())
            .field("loaded", &loaded)
            .field("relay", &self.config.relay.mode)
            .finish()
    }
}

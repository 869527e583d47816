//! Integration tests for module lookup, enablement and the image lifecycle.

mod common;

use common::*;
use peforge::{config::ModuleOverride, prelude::*, ERROR_FILE_NOT_FOUND};

#[test]
fn unknown_module_is_not_found() {
    let loader = loader(RelayMode::Disabled);
    let result = loader.load_image("NOSUCH.DLL", true);
    assert!(matches!(result, Err(Error::ModuleNotFound(ref name)) if name == "NOSUCH.DLL"));
    assert_eq!(
        result.err().and_then(|e| e.win32_code()),
        Some(ERROR_FILE_NOT_FOUND)
    );
}

#[test]
fn names_ignore_path_extension_and_case() -> Result<()> {
    let loader = loader(RelayMode::Disabled);
    for name in [
        "KERNEL32",
        "kernel32.dll",
        "C:\\WINDOWS\\SYSTEM\\Kernel32.DLL",
        "/opt/win/kernel32.dll",
    ] {
        let handle = loader.load_image(name, false)?;
        let info = loader
            .loaded()?
            .into_iter()
            .find(|info| info.handle == handle)
            .ok_or(Error::InvalidHandle(handle.address()))?;
        assert_eq!(info.name, "KERNEL32");
        assert_eq!(info.path_name, "KERNEL32.DLL");
    }
    Ok(())
}

#[test]
fn disabled_module_needs_force() -> Result<()> {
    let loader = loader(RelayMode::Disabled);
    let spare = loader
        .registry()
        .find("comctl32")
        .ok_or(Error::ModuleNotFound("comctl32".into()))?;
    assert!(!loader.registry().is_enabled(spare));

    let result = loader.load_image("COMCTL32.DLL", false);
    assert!(matches!(result, Err(Error::ModuleDisabled(_))));
    assert!(loader.loaded()?.is_empty());

    let forced = loader.load_image("COMCTL32.DLL", true)?;
    assert!(loader.registry().is_enabled(spare));

    let again = loader.load_image("comctl32", false)?;
    assert_ne!(forced, again);
    Ok(())
}

#[test]
fn two_loads_are_independent_images() -> Result<()> {
    let loader = loader(RelayMode::Warn);
    let first = loader.load_image("FOO", true)?;
    let second = loader.load_image("FOO", true)?;
    assert_ne!(first, second);

    let first_bytes = loader.with_image(first, |image| image.bytes().to_vec())?;
    let second_bytes = loader.with_image(second, |image| image.bytes().to_vec())?;
    assert_eq!(first_bytes.len(), second_bytes.len());

    // Both images resolve their own exports.
    let a = loader.proc_address(first, ProcName::Name("Bar"))?;
    let b = loader.proc_address(second, ProcName::Name("Bar"))?;
    if peforge::relay::STUBS_SUPPORTED {
        assert_ne!(a, b);
    } else {
        assert_eq!(a, b);
    }

    loader.unload(first)?;
    assert_eq!(loader.proc_address(second, ProcName::Name("Bar"))?, b);
    Ok(())
}

#[test]
fn unload_releases_only_the_image() -> Result<()> {
    let loader = loader(RelayMode::Disabled);
    let handle = loader.load_image("COMCTL32", true)?;
    assert_eq!(loader.loaded()?.len(), 1);

    loader.unload(handle)?;
    assert!(loader.loaded()?.is_empty());
    assert!(matches!(loader.unload(handle), Err(Error::InvalidHandle(_))));
    assert!(matches!(
        loader.proc_address(handle, ProcName::Ordinal(2)),
        Err(Error::InvalidHandle(_))
    ));

    // The forced enablement survives the unload.
    loader.load_image("COMCTL32", false)?;
    Ok(())
}

#[test]
fn overrides_apply_at_creation() -> Result<()> {
    let config = LoaderConfig::new().overrides(ModuleOverride::parse_list("comctl32=+;foo=-")?);
    let loader = BuiltinLoader::new(catalog(), config)?;

    loader.load_image("comctl32", false)?;
    assert!(matches!(
        loader.load_image("foo", false),
        Err(Error::ModuleDisabled(_))
    ));
    Ok(())
}

#[test]
fn proc_address_resolves_names_and_ordinals() -> Result<()> {
    let loader = loader(RelayMode::Disabled);
    let handle = loader.load_image("kernel32", false)?;

    assert_eq!(
        loader.proc_address(handle, ProcName::Name("CreateFileA"))?,
        open_file as usize
    );
    assert_eq!(
        loader.proc_address(handle, ProcName::Ordinal(2))?,
        close_file as usize
    );

    match loader.proc_address(handle, ProcName::Name("GetTickCount")) {
        Err(Error::UnimplementedEntry {
            module,
            ordinal,
            name,
        }) => {
            assert_eq!(module, "KERNEL32");
            assert_eq!(ordinal, 3);
            assert_eq!(name, "GetTickCount");
        }
        other => panic!("expected an unimplemented entry, got {other:?}"),
    }

    assert!(matches!(
        loader.proc_address(handle, ProcName::Ordinal(7)),
        Err(Error::UnimplementedEntry { ref name, .. }) if name == "???"
    ));
    assert!(matches!(
        loader.proc_address(handle, ProcName::Ordinal(0)),
        Err(Error::SymbolNotFound(_))
    ));
    Ok(())
}

#[test]
fn dropping_the_loader_releases_images() -> Result<()> {
    let loader = loader(RelayMode::Warn);
    for _ in 0..16 {
        loader.load_image("KERNEL32", false)?;
    }
    assert_eq!(loader.loaded()?.len(), 16);
    drop(loader);
    Ok(())
}

#[test]
fn invalid_catalog_is_rejected() {
    let result = BuiltinLoader::new(
        [BuiltinEntry::enabled(&FOO), BuiltinEntry::disabled(&FOO)],
        LoaderConfig::new(),
    );
    assert!(matches!(result, Err(Error::Malformed { .. })));
}

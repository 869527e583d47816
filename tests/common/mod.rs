//! Fixture modules shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};

use peforge::prelude::*;

pub static CALLS: AtomicUsize = AtomicUsize::new(0);

// Distinct bodies keep the linker from folding the functions onto one address.
macro_rules! export {
    ($($name:ident = $tag:expr),* $(,)?) => {
        $(
            pub unsafe extern "C" fn $name() {
                std::hint::black_box($tag);
            }
        )*
    };
}

export!(
    f_a = 0xa1_u32,
    f_b = 0xb2_u32,
    open_file = 0x01_u32,
    close_file = 0x02_u32,
    raise = 0x03_u32,
    printf = 0x04_u32,
    dll_main = 0x05_u32,
    trampoline = 0x06_u32,
);

pub unsafe extern "C" fn bump() {
    CALLS.fetch_add(1, Ordering::SeqCst);
}

pub fn calls() -> usize {
    CALLS.load(Ordering::SeqCst)
}

static FOO_FUNCTIONS: [Option<EntryPoint>; 2] = [Some(f_a), Some(f_b)];

/// Two functions: a stdcall one with two argument words and an extern one.
pub static FOO: ModuleDescriptor = ModuleDescriptor {
    name: c"FOO",
    base: 1,
    functions: &FOO_FUNCTIONS,
    args: &[0x02, 0xff],
    arg_types: &[0x3, 0],
    names: &[Some(c"Bar"), Some(c"Baz")],
    ordinals: &[0, 1],
    entry_point: None,
};

static KERNEL_FUNCTIONS: [Option<EntryPoint>; 7] = [
    Some(open_file),
    Some(close_file),
    None,
    Some(raise),
    Some(printf),
    Some(bump),
    None,
];

/// Every kind of slot: stdcall, cdecl, register, extern, unnamed and unimplemented.
pub static KERNEL: ModuleDescriptor = ModuleDescriptor {
    name: c"KERNEL32",
    base: 1,
    functions: &KERNEL_FUNCTIONS,
    args: &[0x03, 0x01, 0x00, 0xfe, 0x81, 0x00, 0x02],
    arg_types: &[0x1, 0x0, 0x0, 0x0, 0x2, 0x0, 0x0],
    names: &[
        Some(c"CloseHandle"),
        Some(c"CreateFileA"),
        Some(c"GetTickCount"),
        Some(c"RaiseException"),
        Some(c"wsprintfA"),
        Some(c"Bump"),
    ],
    ordinals: &[1, 0, 2, 3, 4, 5],
    entry_point: Some(dll_main),
};

static SPARE_FUNCTIONS: [Option<EntryPoint>; 1] = [Some(f_a)];

/// A module that is off until a load forces it.
pub static SPARE: ModuleDescriptor = ModuleDescriptor {
    name: c"COMCTL32",
    base: 2,
    functions: &SPARE_FUNCTIONS,
    args: &[0x00],
    arg_types: &[],
    names: &[Some(c"InitCommonControls")],
    ordinals: &[0],
    entry_point: None,
};

static STUBS_FUNCTIONS: [Option<EntryPoint>; 3] = [Some(f_a), None, None];

/// A module with unimplemented exports.
pub static STUBS: ModuleDescriptor = ModuleDescriptor {
    name: c"STUBS",
    base: 10,
    functions: &STUBS_FUNCTIONS,
    args: &[0x00, 0x00, 0x00],
    arg_types: &[],
    names: &[Some(c"Present"), Some(c"Missing")],
    ordinals: &[0, 2],
    entry_point: None,
};

pub fn catalog() -> Vec<BuiltinEntry> {
    vec![
        BuiltinEntry::enabled(&FOO),
        BuiltinEntry::enabled(&KERNEL),
        BuiltinEntry::disabled(&SPARE),
        BuiltinEntry::enabled(&STUBS),
    ]
}

pub fn relay_config(mode: RelayMode) -> LoaderConfig {
    LoaderConfig::new()
        .relay_mode(mode)
        .trampoline(trampoline as usize)
}

pub fn loader(mode: RelayMode) -> BuiltinLoader {
    BuiltinLoader::new(catalog(), relay_config(mode)).expect("fixture catalog is valid")
}

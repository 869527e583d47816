//! A small catalog of built-in modules to exercise the loader with.
//!
//! The functions only record that they ran; nothing in the CLI calls through them.

use std::sync::atomic::{AtomicU32, Ordering};

use peforge::builtin::{BuiltinEntry, EntryPoint, ModuleDescriptor};

static CALLS: AtomicU32 = AtomicU32::new(0);

macro_rules! builtin {
    ($($name:ident = $tag:expr),* $(,)?) => {
        $(
            unsafe extern "C" fn $name() {
                CALLS.fetch_add($tag, Ordering::Relaxed);
            }
        )*
    };
}

builtin!(
    beep = 1,
    close_handle = 2,
    create_file = 3,
    get_tick_count = 4,
    raise_exception = 5,
    wsprintf = 6,
    kernel_main = 7,
    message_box = 8,
    get_desktop_window = 9,
    init_common_controls = 10,
);

/// Target of traced relay stubs.
pub unsafe extern "C" fn relay_trampoline() {
    CALLS.fetch_add(0x100, Ordering::Relaxed);
}

static KERNEL32_FUNCTIONS: [Option<EntryPoint>; 8] = [
    Some(beep),
    Some(close_handle),
    Some(create_file),
    None,
    Some(get_tick_count),
    Some(raise_exception),
    Some(wsprintf),
    None,
];

static KERNEL32: ModuleDescriptor = ModuleDescriptor {
    name: c"KERNEL32",
    base: 1,
    functions: &KERNEL32_FUNCTIONS,
    args: &[0x02, 0x01, 0x07, 0x01, 0x00, 0xfe, 0x82, 0x00],
    arg_types: &[0x0, 0x0, 0x1, 0x0, 0x0, 0x0, 0x6, 0x0],
    names: &[
        Some(c"Beep"),
        Some(c"CloseHandle"),
        Some(c"CreateFileA"),
        Some(c"FatalAppExitA"),
        Some(c"GetTickCount"),
        Some(c"RaiseException"),
        Some(c"wsprintfA"),
    ],
    ordinals: &[0, 1, 2, 3, 4, 5, 6],
    entry_point: Some(kernel_main),
};

static USER32_FUNCTIONS: [Option<EntryPoint>; 2] = [Some(get_desktop_window), Some(message_box)];

static USER32: ModuleDescriptor = ModuleDescriptor {
    name: c"USER32",
    base: 1,
    functions: &USER32_FUNCTIONS,
    args: &[0x00, 0x04],
    arg_types: &[0x0, 0x6],
    names: &[Some(c"GetDesktopWindow"), Some(c"MessageBoxA")],
    ordinals: &[0, 1],
    entry_point: None,
};

static COMCTL32_FUNCTIONS: [Option<EntryPoint>; 1] = [Some(init_common_controls)];

static COMCTL32: ModuleDescriptor = ModuleDescriptor {
    name: c"COMCTL32",
    base: 17,
    functions: &COMCTL32_FUNCTIONS,
    args: &[0xff],
    arg_types: &[],
    names: &[Some(c"InitCommonControls")],
    ordinals: &[0],
    entry_point: None,
};

/// KERNEL32 and USER32 are enabled, COMCTL32 is off until forced.
pub fn catalog() -> [BuiltinEntry; 3] {
    [
        BuiltinEntry::enabled(&KERNEL32),
        BuiltinEntry::enabled(&USER32),
        BuiltinEntry::disabled(&COMCTL32),
    ]
}

#![no_main]

use libfuzzer_sys::fuzz_target;
use peforge::{
    builtin::normalize_module_name, config::ModuleOverride, relay::RelayFilter, LoaderConfig,
};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let _ = LoaderConfig::from_debug_spec(text);
    let _ = ModuleOverride::parse_list(text);
    if let Ok(filter) = text.parse::<RelayFilter>() {
        let _ = filter.shows("KERNEL32.1: CreateFileA");
    }
    let _ = normalize_module_name(text);
});

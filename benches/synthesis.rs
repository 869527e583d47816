#![allow(unused)]
extern crate peforge;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use peforge::{
    image::synthesize,
    prelude::*,
    relay::{STUBS_SUPPORTED, STUB_RETURN_OFFSET},
};
use std::hint::black_box;

macro_rules! export {
    ($($name:ident = $tag:expr),* $(,)?) => {
        $(
            unsafe extern "C" fn $name() {
                black_box($tag);
            }
        )*
    };
}

export!(
    open = 1_u32,
    close = 2_u32,
    read = 3_u32,
    write = 4_u32,
    seek = 5_u32,
    flush = 6_u32,
    tracer = 7_u32,
);

static FUNCTIONS: [Option<EntryPoint>; 8] = [
    Some(open),
    Some(close),
    Some(read),
    Some(write),
    Some(seek),
    Some(flush),
    None,
    Some(close),
];

static FILES: ModuleDescriptor = ModuleDescriptor {
    name: c"FILES",
    base: 1,
    functions: &FUNCTIONS,
    args: &[0x03, 0x01, 0x03, 0x03, 0x83, 0x01, 0x00, 0xfe],
    arg_types: &[],
    names: &[
        Some(c"CloseFile"),
        Some(c"FlushFile"),
        Some(c"OpenFile"),
        Some(c"ReadFile"),
        Some(c"SeekFile"),
        Some(c"WriteFile"),
    ],
    ordinals: &[1, 5, 0, 2, 4, 3],
    entry_point: None,
};

fn relay(mode: RelayMode) -> LoaderConfig {
    LoaderConfig::new()
        .relay_mode(mode)
        .trampoline(tracer as usize)
}

/// Benchmark image synthesis with and without a stub array
fn bench_synthesize(c: &mut Criterion) {
    let mut group = c.benchmark_group("synthesize");
    for mode in [RelayMode::Disabled, RelayMode::Warn] {
        let config = relay(mode).relay;
        group.bench_with_input(BenchmarkId::from_parameter(mode), &config, |b, config| {
            b.iter(|| {
                let image = synthesize(black_box(&FILES), config, DispatchMode::Direct).unwrap();
                black_box(image.size())
            });
        });
    }
    group.finish();
}

/// Benchmark relay address resolution across several loaded images
fn bench_resolve_relay(c: &mut Criterion) {
    if !STUBS_SUPPORTED {
        return;
    }
    let loader =
        BuiltinLoader::new([BuiltinEntry::enabled(&FILES)], relay(RelayMode::Warn)).unwrap();
    let mut handles = Vec::new();
    for _ in 0..8 {
        handles.push(loader.load_image("FILES", false).unwrap());
    }
    let last = *handles.last().unwrap();
    let address = loader
        .with_image(last, |image| image.stub_address(5))
        .unwrap()
        .unwrap()
        + STUB_RETURN_OFFSET;

    c.bench_function("resolve_relay", |b| {
        b.iter(|| black_box(loader.resolve_relay(black_box(address))));
    });

    c.bench_function("relay_tracing_toggle", |b| {
        b.iter(|| {
            loader.set_relay_tracing(true).unwrap();
            loader.set_relay_tracing(false).unwrap()
        });
    });
}

/// Benchmark export lookup by name
fn bench_proc_address(c: &mut Criterion) {
    let loader =
        BuiltinLoader::new([BuiltinEntry::enabled(&FILES)], relay(RelayMode::Disabled)).unwrap();
    let handle = loader.load_image("files.dll", false).unwrap();

    c.bench_function("proc_address", |b| {
        b.iter(|| {
            black_box(
                loader
                    .proc_address(handle, ProcName::Name(black_box("WriteFile")))
                    .unwrap(),
            )
        });
    });
}

criterion_group!(
    benches,
    bench_synthesize,
    bench_resolve_relay,
    bench_proc_address
);
criterion_main!(benches);

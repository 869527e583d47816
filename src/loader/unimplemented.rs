//! The hard stop for exports without implementation.
//!
//! A function slot left empty by a module descriptor has nothing to run. Resolving such an
//! export through [`crate::BuiltinLoader::proc_address`] yields
//! [`Error::UnimplementedEntry`]; code that reaches such an entry at call time has no way to
//! continue and ends the process through [`unimplemented_entry`] or [`fatal`], which report
//! the module, the ordinal and the export name before exiting with status 1.

use log::error;

use crate::{builtin::ModuleDescriptor, Error};

/// Exit status of a process stopped by an unimplemented entry.
pub const UNIMPLEMENTED_EXIT_CODE: i32 = 1;

/// Builds the error describing a call to the biased `ordinal` of `descriptor`.
///
/// The name is the first name whose ordinal table entry plus the module base equals
/// `ordinal`, or `???` when there is none.
#[must_use]
pub fn describe_unimplemented(descriptor: &ModuleDescriptor, ordinal: u32) -> Error {
    let name = descriptor
        .ordinals
        .iter()
        .position(|&index| descriptor.base.wrapping_add(u32::from(index)) == ordinal)
        .and_then(|j| descriptor.names.get(j).copied().flatten())
        .map_or_else(|| "???".to_string(), |name| name.to_string_lossy().into_owned());

    Error::UnimplementedEntry {
        module: descriptor.module_name().into_owned(),
        ordinal,
        name,
    }
}

/// Reports a call to the unimplemented biased `ordinal` of `descriptor` and ends the
/// process. `caller` is the approximate return address, when known.
pub fn unimplemented_entry(descriptor: &ModuleDescriptor, ordinal: u32, caller: Option<usize>) -> ! {
    let err = describe_unimplemented(descriptor, ordinal);
    match caller {
        Some(address) => error!("{err} (called from {address:#x})"),
        None => error!("{err}"),
    }
    terminate(&err)
}

/// Reports `err` and ends the process with status 1.
pub fn fatal(err: Error) -> ! {
    error!("{err}");
    terminate(&err)
}

fn terminate(err: &Error) -> ! {
    // The logger may not be initialized this early or may filter errors out.
    eprintln!("{err}");
    std::process::exit(UNIMPLEMENTED_EXIT_CODE)
}

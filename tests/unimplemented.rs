//! Integration tests for the process exit on unimplemented entries.
//!
//! Each case re-runs this test binary filtered down to one helper test with an environment
//! variable set; the helper then takes the exit path and the parent checks the status and
//! the message on stderr.

mod common;

use std::process::{Command, Output};

use common::*;
use peforge::{
    loader::{fatal, unimplemented::UNIMPLEMENTED_EXIT_CODE, unimplemented_entry},
    prelude::*,
};

const CHILD: &str = "PEFORGE_UNIMPLEMENTED_CHILD";

fn run_child(test: &str) -> Output {
    let exe = std::env::current_exe().expect("test binary path");
    Command::new(exe)
        .args([test, "--exact", "--nocapture", "--test-threads=1"])
        .env(CHILD, test)
        .output()
        .expect("child test process")
}

fn is_child(test: &str) -> bool {
    std::env::var(CHILD).is_ok_and(|value| value == test)
}

#[test]
fn child_unimplemented_entry() {
    if is_child("child_unimplemented_entry") {
        unimplemented_entry(&STUBS, 12, Some(0x1000));
    }
}

#[test]
fn child_fatal_resolution() {
    if is_child("child_fatal_resolution") {
        let loader = loader(RelayMode::Disabled);
        let handle = loader.load_image("STUBS", false).expect("fixture loads");
        if let Err(err) = loader.proc_address(handle, ProcName::Name("Missing")) {
            fatal(err);
        }
    }
}

#[test]
fn unimplemented_entry_exits_with_status_one() {
    let output = run_child("child_unimplemented_entry");
    assert_eq!(output.status.code(), Some(UNIMPLEMENTED_EXIT_CODE));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("No handler for Win32 routine STUBS.12: Missing"),
        "{stderr}"
    );
}

#[test]
fn fatal_resolution_exits_with_status_one() {
    let output = run_child("child_fatal_resolution");
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("No handler for Win32 routine STUBS.12: Missing"),
        "{stderr}"
    );
}

#[test]
fn resolution_reports_before_exit() -> Result<()> {
    let loader = loader(RelayMode::Disabled);
    let handle = loader.load_image("STUBS", false)?;
    assert_eq!(
        loader.proc_address(handle, ProcName::Name("Present"))?,
        f_a as usize
    );
    let err = loader
        .proc_address(handle, ProcName::Ordinal(11))
        .unwrap_err();
    assert_eq!(err.to_string(), "No handler for Win32 routine STUBS.11: ???");
    Ok(())
}

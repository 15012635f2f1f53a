//! Tests for debugger executable location.

mod common;

use cdbsh::error::EngineError;
use cdbsh::locator::{OsArch, find_tool_path};
use common::FakeFs;
use std::path::{Path, PathBuf};

fn roots(paths: &[&str]) -> Vec<PathBuf> {
    paths.iter().map(PathBuf::from).collect()
}

#[test]
fn test_configured_path_wins_when_present() {
    let fs = FakeFs::new(&["/custom/cdb.exe", "/kits/x64/cdb.exe"]);
    let path = find_tool_path(
        &fs,
        "cdb.exe",
        Some(Path::new("/custom/cdb.exe")),
        OsArch::X64,
        &roots(&["/kits"]),
    )
    .unwrap();
    assert_eq!(path, PathBuf::from("/custom/cdb.exe"));
}

#[test]
fn test_missing_configured_path_falls_back_to_roots() {
    let fs = FakeFs::new(&["/kits/x64/cdb.exe"]);
    let path = find_tool_path(
        &fs,
        "cdb.exe",
        Some(Path::new("/nope/cdb.exe")),
        OsArch::X64,
        &roots(&["/kits"]),
    )
    .unwrap();
    assert_eq!(path, PathBuf::from("/kits/x64/cdb.exe"));
}

#[test]
fn test_x64_prefers_x64_over_x86() {
    let fs = FakeFs::new(&["/kits/x86/cdb.exe", "/kits/x64/cdb.exe"]);
    let path = find_tool_path(&fs, "cdb.exe", None, OsArch::X64, &roots(&["/kits"])).unwrap();
    assert_eq!(path, PathBuf::from("/kits/x64/cdb.exe"));
}

#[test]
fn test_x64_falls_back_to_x86() {
    let fs = FakeFs::new(&["/kits/x86/cdb.exe"]);
    let path = find_tool_path(&fs, "cdb.exe", None, OsArch::X64, &roots(&["/kits"])).unwrap();
    assert_eq!(path, PathBuf::from("/kits/x86/cdb.exe"));
}

#[test]
fn test_arm64_priority_order() {
    // arm64 beats x64 beats x86.
    let fs = FakeFs::new(&[
        "/kits/x86/cdb.exe",
        "/kits/x64/cdb.exe",
        "/kits/arm64/cdb.exe",
    ]);
    let path = find_tool_path(&fs, "cdb.exe", None, OsArch::Arm64, &roots(&["/kits"])).unwrap();
    assert_eq!(path, PathBuf::from("/kits/arm64/cdb.exe"));

    let fs = FakeFs::new(&["/kits/x86/cdb.exe", "/kits/x64/cdb.exe"]);
    let path = find_tool_path(&fs, "cdb.exe", None, OsArch::Arm64, &roots(&["/kits"])).unwrap();
    assert_eq!(path, PathBuf::from("/kits/x64/cdb.exe"));
}

#[test]
fn test_x86_never_probes_wider_arches() {
    let fs = FakeFs::new(&["/kits/x64/cdb.exe", "/kits/arm64/cdb.exe"]);
    let err = find_tool_path(&fs, "cdb.exe", None, OsArch::X86, &roots(&["/kits"])).unwrap_err();
    assert!(matches!(err, EngineError::ToolNotFound(_)));
}

#[test]
fn test_roots_probed_in_order() {
    let fs = FakeFs::new(&["/old-kits/x64/cdb.exe", "/new-kits/x64/cdb.exe"]);
    let path = find_tool_path(
        &fs,
        "cdb.exe",
        None,
        OsArch::X64,
        &roots(&["/new-kits", "/old-kits"]),
    )
    .unwrap();
    assert_eq!(path, PathBuf::from("/new-kits/x64/cdb.exe"));
}

#[test]
fn test_nothing_found_is_tool_not_found() {
    let fs = FakeFs::new(&[]);
    let err = find_tool_path(&fs, "cdb.exe", None, OsArch::X64, &roots(&["/kits"])).unwrap_err();
    match err {
        EngineError::ToolNotFound(tool) => assert_eq!(tool, "cdb.exe"),
        other => panic!("expected ToolNotFound, got {other:?}"),
    }
}

//! Integration tests for the winemu runner.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow as _;
use clap as _;
use tracing as _;
use tracing_subscriber as _;
use winemu_core as _;
use winemu_image::samples;

fn binary_path() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop();
    path.pop();
    path.join("winemu")
}

fn write_sample(dir: &Path, name: &str, image: &[u8]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, image).unwrap();
    path
}

fn winemu(args: &[&str]) -> std::process::Output {
    Command::new(binary_path())
        .args(args)
        .output()
        .expect("failed to run winemu")
}

#[test]
fn exit_code_mirrors_the_guest() {
    let temp_dir = tempfile::tempdir().unwrap();
    let exe = write_sample(temp_dir.path(), "ret.exe", &samples::return_code(42).unwrap());

    let output = winemu(&["--quiet", exe.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(42));
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("exited with code 42"), "{stdout}");
}

#[test]
fn guest_receives_the_command_line() {
    let temp_dir = tempfile::tempdir().unwrap();
    let exe = write_sample(temp_dir.path(), "len.exe", &samples::argument_length().unwrap());

    // "len.exe abc" is 11 UTF-16 units.
    let output = winemu(&["-q", exe.to_str().unwrap(), "abc"]);
    assert_eq!(output.status.code(), Some(11));
}

#[test]
fn fault_is_reported_with_disassembly() {
    let temp_dir = tempfile::tempdir().unwrap();
    let exe = write_sample(temp_dir.path(), "bp.exe", &samples::breakpoint().unwrap());

    let output = winemu(&["-q", exe.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(1));
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("breakpoint"), "{stdout}");
    assert!(stdout.contains("int3"), "{stdout}");
    assert!(stdout.contains("in bp.exe at rva 0x1001"), "{stdout}");
}

#[test]
fn instruction_limit_suspends_the_run() {
    let temp_dir = tempfile::tempdir().unwrap();
    let exe = write_sample(temp_dir.path(), "sum.exe", &samples::sum_to(100).unwrap());

    let output = winemu(&["-q", "-n", "10", exe.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(3));
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("suspended after 10 instructions"), "{stdout}");
}

#[test]
fn dependencies_come_from_search_paths() {
    let exe_dir = tempfile::tempdir().unwrap();
    let lib_dir = tempfile::tempdir().unwrap();
    let exe = write_sample(exe_dir.path(), "importer.exe", &samples::importer().unwrap());
    write_sample(
        lib_dir.path(),
        samples::MATH_LIBRARY,
        &samples::math_library(winemu_image::DEFAULT_DLL_BASE).unwrap(),
    );

    let missing = winemu(&["-q", exe.to_str().unwrap()]);
    assert_eq!(missing.status.code(), Some(1));
    let stderr = String::from_utf8(missing.stderr).unwrap();
    assert!(stderr.contains("unresolved import mathlib.dll!add_one"), "{stderr}");

    let output = winemu(&[
        "-q",
        "--search-path",
        lib_dir.path().to_str().unwrap(),
        exe.to_str().unwrap(),
    ]);
    assert_eq!(output.status.code(), Some(42));
}

#[test]
fn trace_prints_every_retired_instruction() {
    let temp_dir = tempfile::tempdir().unwrap();
    let exe = write_sample(temp_dir.path(), "t.exe", &samples::terminate(0).unwrap());

    let output = winemu(&["-q", "--trace", exe.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(0));
    let stderr = String::from_utf8(output.stderr).unwrap();
    assert_eq!(stderr.lines().filter(|l| l.starts_with("retired")).count(), 4);
    assert!(stderr.contains("syscall 0x2c"), "{stderr}");
}

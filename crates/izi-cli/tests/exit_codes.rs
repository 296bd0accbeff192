//! Runs the built `izi` binary against small `.izi` files and checks exit
//! codes and output, mirroring how the teacher's compiler crate drives a
//! file through `tempfile` for its cache-key tests.

use std::fs;
use std::process::Command;

use tempfile::tempdir;

fn izi_bin() -> &'static str {
    env!("CARGO_BIN_EXE_izi")
}

#[test]
fn runs_a_program_successfully() {
    let dir = tempdir().unwrap();
    let script = dir.path().join("ok.izi");
    fs::write(&script, "print 1 + 2 * 3;").unwrap();

    let output = Command::new(izi_bin()).arg(&script).output().unwrap();
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "7\n");
}

#[test]
fn compile_error_exits_65() {
    let dir = tempdir().unwrap();
    let script = dir.path().join("bad.izi");
    fs::write(&script, "print 1 +;").unwrap();

    let output = Command::new(izi_bin()).arg(&script).output().unwrap();
    assert_eq!(output.status.code(), Some(65));
}

#[test]
fn runtime_error_exits_70() {
    let dir = tempdir().unwrap();
    let script = dir.path().join("runtime.izi");
    fs::write(&script, "y = 1;").unwrap();

    let output = Command::new(izi_bin()).arg(&script).output().unwrap();
    assert_eq!(output.status.code(), Some(70));
}

#[test]
fn missing_file_exits_74() {
    let output = Command::new(izi_bin())
        .arg("/nonexistent/path/to/nowhere.izi")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(74));
}

#[test]
fn two_positional_arguments_exits_64() {
    let dir = tempdir().unwrap();
    let a = dir.path().join("a.izi");
    let b = dir.path().join("b.izi");
    fs::write(&a, "print 1;").unwrap();
    fs::write(&b, "print 2;").unwrap();

    let output = Command::new(izi_bin()).arg(&a).arg(&b).output().unwrap();
    assert_eq!(output.status.code(), Some(64));
    assert_eq!(
        String::from_utf8_lossy(&output.stderr).trim(),
        "Usage: izi [path]"
    );
}

#[test]
fn unrecognized_flag_exits_64() {
    let output = Command::new(izi_bin()).arg("--bogus").output().unwrap();
    assert_eq!(output.status.code(), Some(64));
    assert_eq!(
        String::from_utf8_lossy(&output.stderr).trim(),
        "Usage: izi [path]"
    );
}

#[test]
fn disassemble_flag_prints_without_running() {
    let dir = tempdir().unwrap();
    let script = dir.path().join("disasm.izi");
    fs::write(&script, "print 1;").unwrap();

    let output = Command::new(izi_bin())
        .args(["--disassemble"])
        .arg(&script)
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("OP_CONSTANT"));
    assert!(stdout.contains("OP_PRINT"));
}

//! End-to-end tests driving the compiled binary on bytecode files.

use std::path::PathBuf;
use std::process::Command;

use basalt::fixtures;

fn temp_file(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "basalt_e2e_{}_{}_{:?}.byte",
        tag,
        std::process::id(),
        std::thread::current().id()
    ))
}

fn run_backend(backend: &str, image: &[u8], extra: &[&str]) -> (String, String, Option<i32>) {
    let file = temp_file(backend);
    std::fs::write(&file, image).unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_basalt"))
        .arg(backend)
        .args(extra)
        .arg(&file)
        .output()
        .expect("failed to execute basalt");

    std::fs::remove_file(&file).ok();

    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.code(),
    )
}

fn assert_returns(image: &[u8], value: i32) {
    for backend in ["jit", "interpreter"] {
        let (stdout, stderr, code) = run_backend(backend, image, &[]);
        assert_eq!(
            code,
            Some(value),
            "{} exit code mismatch, stderr:\n{}",
            backend,
            stderr
        );
        assert!(
            stdout.contains(&format!("returned {}", value)),
            "{} stdout was: {}",
            backend,
            stdout
        );
    }
}

#[test]
fn test_trivial_return() {
    assert_returns(&fixtures::trivial_return(42), 42);
}

#[test]
fn test_loop_sum() {
    assert_returns(&fixtures::loop_sum(), 45);
}

#[test]
fn test_array_length() {
    assert_returns(&fixtures::array_length(), 7);
}

#[test]
fn test_polymorphic_call() {
    assert_returns(&fixtures::polymorphic_call(), 3);
}

#[test]
fn test_register_pressure() {
    assert_returns(&fixtures::register_pressure(), 1);
}

#[test]
fn test_float_divide() {
    for backend in ["jit", "interpreter"] {
        let (stdout, stderr, code) = run_backend(backend, &fixtures::float_divide(), &[]);
        assert_eq!(code, Some(0), "stderr:\n{}", stderr);
        assert!(
            stdout.contains("1.500000"),
            "{} stdout was: {}",
            backend,
            stdout
        );
    }
}

#[test]
fn test_arithmetic_and_calls() {
    assert_returns(&fixtures::arithmetic(), 4);
    assert_returns(&fixtures::call_chain(), 12);
    assert_returns(&fixtures::array_fill_sum(), 10);
    assert_returns(&fixtures::object_fields(), 30);
    assert_returns(&fixtures::spill_pressure(), 171);
}

#[test]
fn test_load_error_exits_one() {
    let (_, stderr, code) = run_backend("jit", &[0x12, 0x34], &[]);
    assert_eq!(code, Some(1));
    assert!(stderr.contains("magic"), "stderr was: {}", stderr);
}

#[test]
fn test_truncated_file_exits_one() {
    let image = fixtures::trivial_return(1);
    let truncated = &image[..image.len() - 2];
    let (_, stderr, code) = run_backend("interpreter", truncated, &[]);
    assert_eq!(code, Some(1));
    assert!(!stderr.is_empty());
}

#[test]
fn test_usage_error_exits_two() {
    let output = Command::new(env!("CARGO_BIN_EXE_basalt"))
        .output()
        .expect("failed to execute basalt");
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_version() {
    let output = Command::new(env!("CARGO_BIN_EXE_basalt"))
        .arg("version")
        .output()
        .expect("failed to execute basalt");
    assert_eq!(output.status.code(), Some(0));
    assert!(String::from_utf8_lossy(&output.stdout).contains("basalt"));
}

#[test]
fn test_debug_dump_is_written() {
    let dir = std::env::temp_dir().join(format!("basalt_dump_{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();

    let file = dir.join("program.byte");
    std::fs::write(&file, fixtures::trivial_return(5)).unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_basalt"))
        .current_dir(&dir)
        .args(["jit", "-d"])
        .arg(&file)
        .output()
        .expect("failed to execute basalt");
    assert_eq!(output.status.code(), Some(5));

    let dump = dir.join("function_main.dump");
    let bytes = std::fs::read(&dump).expect("missing dump file");
    // compiled code always ends in the ud2 trap
    assert_eq!(&bytes[bytes.len() - 2..], &[0x0F, 0x0B]);

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_log_topics_to_stdout() {
    let (stdout, _, code) = run_backend(
        "jit",
        &fixtures::trivial_return(3),
        &["--log", "-", "--log-compile"],
    );
    assert_eq!(code, Some(3));
    assert!(
        stdout.contains("compiling function main"),
        "stdout was: {}",
        stdout
    );
}

#[test]
fn test_log_topics_to_file() {
    let log = temp_file("log");
    let log_path = log.to_str().unwrap().to_string();

    let (_, _, code) = run_backend(
        "jit",
        &fixtures::loop_sum(),
        &["--log", &log_path, "--log-lir"],
    );
    assert_eq!(code, Some(45));

    let contents = std::fs::read_to_string(&log).expect("missing log file");
    assert!(contents.contains("-------- block 0"), "log was: {}", contents);
    std::fs::remove_file(&log).ok();
}

#[test]
fn test_shebang_program_runs() {
    let mut image = b"#!/usr/bin/env basalt\n".to_vec();
    image.extend_from_slice(&fixtures::trivial_return(9));
    assert_returns(&image, 9);
}

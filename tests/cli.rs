//! Integration tests for the procfan CLI.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

/// Get a command for the procfan binary.
fn procfan() -> Command {
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("procfan").unwrap();
    cmd.env_remove("PROCFAN_WORKERS")
        .env_remove("PROCFAN_ON_ERROR")
        .env_remove("PROCFAN_LOG")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_help() {
    procfan()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("worker processes"))
        .stdout(predicate::str::contains("internal-worker").not());
}

#[test]
fn test_tasks_lists_builtins() {
    procfan()
        .args(["--no-color", "tasks"])
        .assert()
        .success()
        .stdout(predicate::str::contains("double"))
        .stdout(predicate::str::contains("identity"))
        .stdout(predicate::str::contains("sleep"));
}

#[test]
fn test_run_from_stdin() {
    procfan()
        .args(["run", "--task", "double", "--workers", "2"])
        .write_stdin("[0, 1, 2, 3, 4, \"inject_error\", 6]")
        .assert()
        .success()
        .stdout("[0,2,4,6,8,null,12]\n");
}

#[test]
fn test_run_from_file() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("tasks.json");
    std::fs::write(&input, "[1, 2, 3]").unwrap();

    procfan()
        .args(["run", "--task", "square", "--workers", "3", "--input"])
        .arg(&input)
        .assert()
        .success()
        .stdout("[1,4,9]\n");
}

#[test]
fn test_run_pretty_output() {
    procfan()
        .args(["run", "--task", "identity", "--pretty"])
        .write_stdin("[{\"a\": 1}]")
        .assert()
        .success()
        .stdout(predicate::str::contains("\n  {\n    \"a\": 1\n  }\n"));
}

#[test]
fn test_break_exits_nonzero() {
    procfan()
        .args([
            "--no-color",
            "run",
            "--task",
            "double",
            "--workers",
            "2",
            "--on-error",
            "break",
        ])
        .write_stdin("[0, 1, 2, 3, 4, \"inject_error\", 6]")
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("error: Task 5 failed"));
}

#[test]
fn test_on_error_from_env() {
    procfan()
        .env("PROCFAN_ON_ERROR", "break")
        .args(["--no-color", "run", "--task", "double"])
        .write_stdin("[\"x\"]")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Task 0 failed"));
}

#[test]
fn test_stats_go_to_stderr() {
    procfan()
        .args(["run", "--task", "double", "--workers", "2", "--stats"])
        .write_stdin("[1, 2]")
        .assert()
        .success()
        .stdout("[2,4]\n")
        .stderr(predicate::str::contains("\"computes_sent\": 2"))
        .stderr(predicate::str::contains("\"pool_size\": 2"));
}

#[test]
fn test_empty_input() {
    procfan()
        .args(["run", "--task", "double"])
        .write_stdin("[]")
        .assert()
        .success()
        .stdout("[]\n");
}

#[test]
fn test_unknown_task() {
    procfan()
        .args(["--no-color", "run", "--task", "nope"])
        .write_stdin("[1]")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown task 'nope'"));
}

#[test]
fn test_input_must_be_array() {
    procfan()
        .args(["--no-color", "run", "--task", "double"])
        .write_stdin("{\"not\": \"an array\"}")
        .assert()
        .failure()
        .stderr(predicate::str::contains("JSON array"));
}

#[test]
fn test_missing_input_file() {
    let dir = tempdir().unwrap();
    procfan()
        .args(["--no-color", "run", "--task", "double", "--input"])
        .arg(dir.path().join("missing.json"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read"));
}

#[test]
fn test_zero_workers_rejected() {
    procfan()
        .args(["--no-color", "run", "--task", "double", "--workers", "0"])
        .write_stdin("[1]")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid configuration"));
}

#[test]
fn test_zero_halt_timeout_rejected() {
    procfan()
        .args(["--no-color", "run", "--task", "double", "--halt-timeout", "0"])
        .write_stdin("[1]")
        .assert()
        .failure()
        .stderr(predicate::str::contains("halt timeout must be non-zero"));
}

#[test]
fn test_log_file_receives_run_summary() {
    let dir = tempdir().unwrap();
    let log = dir.path().join("procfan.log");

    procfan()
        .args(["--log-level", "info", "--log-rotation", "never", "--log-file"])
        .arg(&log)
        .args(["run", "--task", "double", "--workers", "1"])
        .write_stdin("[1]")
        .assert()
        .success()
        .stdout("[2]\n");

    let contents = std::fs::read_to_string(&log).unwrap();
    assert!(contents.contains("Run complete"), "log file: {}", contents);
}

#[test]
fn test_worker_mode_speaks_protocol() {
    let output = procfan()
        .args(["run", "--internal-worker", "--task", "double"])
        .write_stdin(
            "{\"command\":\"compute\",\"on_error\":\"continue\",\"task_nums\":[4],\"tasks\":[21]}\n\
             {\"command\":\"halt\"}\n",
        )
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let mut frames = Vec::new();
    let mut rest = output.as_slice();
    while !rest.is_empty() {
        let (len, tail) = rest.split_at(8);
        let len = u64::from_be_bytes(len.try_into().unwrap()) as usize;
        let (body, tail) = tail.split_at(len);
        frames.push(serde_json::from_slice::<serde_json::Value>(body).unwrap());
        rest = tail;
    }

    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0]["response"], "ready");
    assert_eq!(frames[1]["response"], "compute");
    assert_eq!(frames[1]["status"], serde_json::json!(["OK"]));
    assert_eq!(frames[1]["result_nums"], serde_json::json!([4]));
    assert_eq!(frames[1]["results"], serde_json::json!([42]));
}

#[test]
fn test_worker_mode_rejects_unknown_command() {
    procfan()
        .args(["run", "--internal-worker", "--task", "double"])
        .write_stdin("{\"command\":\"reboot\"}\n")
        .assert()
        .code(1);
}

//! Built-in task functions for the `procfan` binary.
//!
//! A worker re-invoked with `--task <name>` looks its task function up here.
//! Library users call [`crate::run_worker`] with their own function instead.

use anyhow::{Context, Result, anyhow, bail};
use serde_json::{Value, json};
use std::time::Duration;

/// Signature of every task function.
pub type TaskFn = fn(Value) -> Result<Value>;

/// Name and one-line description of each built-in task.
pub const BUILTIN_TASKS: &[(&str, &str)] = &[
    ("identity", "Return the input unchanged"),
    ("double", "Double an integer; fails on anything else"),
    ("square", "Square a number"),
    ("sleep", "Sleep for the given number of milliseconds, then return it"),
    ("exit", "Terminate the worker process with the given exit code"),
    ("panic", "Panic with the input as the message"),
];

/// Look up a built-in task by name.
pub fn lookup(name: &str) -> Option<TaskFn> {
    match name {
        "identity" => Some(identity),
        "double" => Some(double),
        "square" => Some(square),
        "sleep" => Some(sleep),
        "exit" => Some(exit),
        "panic" => Some(panic),
        _ => None,
    }
}

fn identity(value: Value) -> Result<Value> {
    Ok(value)
}

fn as_integer(value: &Value) -> Result<i64> {
    value
        .as_i64()
        .ok_or_else(|| anyhow!("expected an integer, got {}", value))
}

fn double(value: Value) -> Result<Value> {
    let n = as_integer(&value)?;
    let doubled = n
        .checked_mul(2)
        .with_context(|| format!("doubling {} overflows", n))?;
    Ok(json!(doubled))
}

fn square(value: Value) -> Result<Value> {
    if let Some(n) = value.as_i64() {
        let squared = n
            .checked_mul(n)
            .with_context(|| format!("squaring {} overflows", n))?;
        return Ok(json!(squared));
    }
    match value.as_f64() {
        Some(x) => Ok(json!(x * x)),
        None => bail!("expected a number, got {}", value),
    }
}

fn sleep(value: Value) -> Result<Value> {
    let millis = value
        .as_u64()
        .ok_or_else(|| anyhow!("expected a non-negative integer, got {}", value))?;
    std::thread::sleep(Duration::from_millis(millis));
    Ok(value)
}

fn exit(value: Value) -> Result<Value> {
    let code = as_integer(&value)?;
    let code = i32::try_from(code).with_context(|| format!("exit code {} out of range", code))?;
    std::process::exit(code)
}

fn panic(value: Value) -> Result<Value> {
    match value {
        Value::String(message) => panic!("{}", message),
        other => panic!("{}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_builtin_resolves() {
        for (name, description) in BUILTIN_TASKS {
            assert!(lookup(name).is_some(), "{} missing from lookup", name);
            assert!(!description.is_empty());
        }
        assert!(lookup("nope").is_none());
    }

    #[test]
    fn test_double() {
        assert_eq!(double(json!(21)).unwrap(), json!(42));
        assert_eq!(double(json!(-3)).unwrap(), json!(-6));
        let err = double(json!("inject_error")).unwrap_err();
        assert!(err.to_string().contains("inject_error"));
        assert!(double(json!(i64::MAX)).is_err());
    }

    #[test]
    fn test_square() {
        assert_eq!(square(json!(7)).unwrap(), json!(49));
        assert_eq!(square(json!(1.5)).unwrap(), json!(2.25));
        assert!(square(json!([1])).is_err());
    }

    #[test]
    fn test_identity_and_sleep() {
        let value = json!({"k": ["v", 1, null]});
        assert_eq!(identity(value.clone()).unwrap(), value);
        assert_eq!(sleep(json!(1)).unwrap(), json!(1));
        assert!(sleep(json!(-1)).is_err());
    }

    #[test]
    fn test_exit_rejects_bad_codes() {
        assert!(exit(json!("x")).is_err());
        assert!(exit(json!(i64::MAX)).is_err());
    }
}

//! Messages exchanged between the dispatcher and its workers.
//!
//! Commands travel down as newline-delimited JSON, replies travel up as
//! length-prefixed JSON (see [`super::codec`]).

use crate::error::{ProcfanError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// What a worker does when a task in a `Compute` batch fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Abort the whole run on the first task error.
    Break,
    /// Record the error and keep going.
    #[default]
    Continue,
}

impl FromStr for OnError {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "break" => Ok(Self::Break),
            "continue" => Ok(Self::Continue),
            _ => Err(format!(
                "Unknown on_error policy: '{}'. Valid options: break, continue",
                s
            )),
        }
    }
}

impl fmt::Display for OnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Break => write!(f, "break"),
            Self::Continue => write!(f, "continue"),
        }
    }
}

/// Command from dispatcher to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Run a batch of tasks.
    Compute {
        on_error: OnError,
        /// Original indices of the tasks, parallel to `tasks`.
        task_nums: Vec<usize>,
        tasks: Vec<Value>,
    },

    /// Stop reading commands and exit with status 0.
    Halt,
}

impl Command {
    /// Create a single-task compute command.
    pub fn compute_one(on_error: OnError, index: usize, task: Value) -> Self {
        Self::Compute {
            on_error,
            task_nums: vec![index],
            tasks: vec![task],
        }
    }
}

/// Status column of a compute reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "error")]
    Error,
}

/// Result of running the task function on one task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Ok(Value),
    Error(String),
}

impl Outcome {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// The value stored in the result table: the result, or null for an error.
    pub fn into_value(self) -> Value {
        match self {
            Self::Ok(value) => value,
            Self::Error(_) => Value::Null,
        }
    }
}

/// Reply from worker to dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "response", rename_all = "snake_case")]
pub enum Reply {
    /// Outcomes for the executed prefix of a compute batch, as parallel arrays.
    Compute {
        status: Vec<Status>,
        errors: Vec<Option<String>>,
        result_nums: Vec<usize>,
        results: Vec<Value>,
    },

    /// Sent once at startup. Advisory only; the dispatcher never waits for it.
    Ready,
}

impl Reply {
    /// Build a compute reply from `(index, outcome)` pairs.
    pub fn compute(entries: Vec<(usize, Outcome)>) -> Self {
        let mut status = Vec::with_capacity(entries.len());
        let mut errors = Vec::with_capacity(entries.len());
        let mut result_nums = Vec::with_capacity(entries.len());
        let mut results = Vec::with_capacity(entries.len());

        for (index, outcome) in entries {
            result_nums.push(index);
            match outcome {
                Outcome::Ok(value) => {
                    status.push(Status::Ok);
                    errors.push(None);
                    results.push(value);
                }
                Outcome::Error(message) => {
                    status.push(Status::Error);
                    errors.push(Some(message));
                    results.push(Value::Null);
                }
            }
        }

        Self::Compute {
            status,
            errors,
            result_nums,
            results,
        }
    }
}

/// Zip the parallel arrays of a compute reply back into `(index, outcome)` pairs.
///
/// `pid` is only used to label the error when the arrays disagree in length.
pub fn zip_outcomes(
    pid: i32,
    status: Vec<Status>,
    errors: Vec<Option<String>>,
    result_nums: Vec<usize>,
    results: Vec<Value>,
) -> Result<Vec<(usize, Outcome)>> {
    let len = result_nums.len();
    if status.len() != len || errors.len() != len || results.len() != len {
        return Err(ProcfanError::transport(
            pid,
            format!(
                "compute reply arrays differ in length (result_nums={}, status={}, errors={}, results={})",
                len,
                status.len(),
                errors.len(),
                results.len()
            ),
        ));
    }

    Ok(result_nums
        .into_iter()
        .zip(status)
        .zip(errors)
        .zip(results)
        .map(|(((index, status), error), value)| {
            let outcome = match status {
                Status::Ok => Outcome::Ok(value),
                Status::Error => {
                    Outcome::Error(error.unwrap_or_else(|| "unknown task error".to_string()))
                }
            };
            (index, outcome)
        })
        .collect())
}

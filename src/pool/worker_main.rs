//! Worker subprocess main loop.
//!
//! This runs when `procfan run --internal-worker` is invoked. It reads
//! commands from stdin, runs the task function on each task, and writes one
//! length-prefixed reply per compute command to stdout.

use super::ipc::{CommandReader, PipeFd, ReplyWriter};
use super::protocol::{Command, OnError, Outcome, Reply};
use crate::error::{ProcfanError, Result};
use nix::sys::signal::{SigHandler, SigSet, Signal};
use serde_json::Value;
use std::any::Any;
use std::io::{Read, Write};
use std::panic::{self, AssertUnwindSafe};

/// Run the task function on one value, turning errors and panics into an outcome.
fn run_task<F>(task_fn: &F, value: Value) -> Outcome
where
    F: Fn(Value) -> anyhow::Result<Value>,
{
    match panic::catch_unwind(AssertUnwindSafe(|| task_fn(value))) {
        Ok(Ok(result)) => Outcome::Ok(result),
        Ok(Err(e)) => Outcome::Error(format!("{:#}", e)),
        Err(payload) => Outcome::Error(format!("task panicked: {}", panic_message(&*payload))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Run one compute batch in order.
///
/// Under [`OnError::Break`] the batch stops at the first failing task, so the
/// returned outcomes may be a strict prefix of the request.
pub fn run_batch<F>(
    task_fn: &F,
    on_error: OnError,
    task_nums: Vec<usize>,
    tasks: Vec<Value>,
) -> Vec<(usize, Outcome)>
where
    F: Fn(Value) -> anyhow::Result<Value>,
{
    let mut outcomes = Vec::with_capacity(tasks.len());
    for (index, value) in task_nums.into_iter().zip(tasks) {
        let outcome = run_task(task_fn, value);
        let failed = outcome.is_error();
        if let Outcome::Error(message) = &outcome {
            tracing::debug!(task_index = index, error = %message, "Task failed");
        }
        outcomes.push((index, outcome));
        if failed && on_error == OnError::Break {
            break;
        }
    }
    outcomes
}

/// Worker main loop.
///
/// Sends the advisory ready frame, then serves commands until `Halt` or EOF.
/// Any malformed or unknown command is returned as an error.
pub fn worker_loop<R, W, F>(
    reader: &mut CommandReader<R>,
    writer: &mut ReplyWriter<W>,
    task_fn: &F,
) -> Result<()>
where
    R: Read,
    W: Write,
    F: Fn(Value) -> anyhow::Result<Value>,
{
    writer.send(&Reply::Ready)?;

    loop {
        let Some(command) = reader.next_command()? else {
            tracing::debug!("Command pipe closed, exiting");
            return Ok(());
        };

        match command {
            Command::Halt => {
                tracing::debug!("Received halt");
                return Ok(());
            }
            Command::Compute {
                on_error,
                task_nums,
                tasks,
            } => {
                if task_nums.len() != tasks.len() {
                    return Err(ProcfanError::transport(
                        std::process::id() as i32,
                        format!(
                            "compute command has {} indices for {} tasks",
                            task_nums.len(),
                            tasks.len()
                        ),
                    ));
                }
                let outcomes = run_batch(task_fn, on_error, task_nums, tasks);
                writer.send(&Reply::compute(outcomes))?;
            }
        }
    }
}

/// Block SIGINT (the dispatcher alone decides when workers stop) and ignore
/// SIGPIPE (pipe errors surface as `io::Error`).
fn setup_signals() -> Result<()> {
    let mut blocked = SigSet::empty();
    blocked.add(Signal::SIGINT);
    blocked.thread_block()?;

    unsafe {
        nix::sys::signal::signal(Signal::SIGPIPE, SigHandler::SigIgn)?;
    }
    Ok(())
}

/// Run the worker subprocess with the given task function.
///
/// Never returns: exits with status 0 after `Halt` or EOF on stdin, and with
/// status 1 on any transport error or unknown command.
pub fn run_worker<F>(task_fn: F) -> !
where
    F: Fn(Value) -> anyhow::Result<Value>,
{
    let _span = tracing::info_span!("worker", pid = std::process::id()).entered();

    if let Err(e) = setup_signals() {
        tracing::error!(error = %e, "Failed to configure worker signals");
        std::process::exit(1);
    }

    // Safety: descriptors 0 and 1 are the pipes set up by the dispatcher
    // and nothing else in this process reads or writes them.
    let stdin_fd = unsafe { PipeFd::from_raw(0) };
    let stdout_fd = unsafe { PipeFd::from_raw(1) };

    let mut reader = CommandReader::new(stdin_fd);
    let mut writer = ReplyWriter::new(stdout_fd);

    match worker_loop(&mut reader, &mut writer, &task_fn) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            tracing::error!(error = %e, "Worker failed");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::codec::{LengthPrefixedCodec, LineCodec};
    use anyhow::{anyhow, bail};
    use serde_json::json;
    use std::io::Cursor;

    fn double(value: Value) -> anyhow::Result<Value> {
        let n = value
            .as_i64()
            .ok_or_else(|| anyhow!("not an integer: {}", value))?;
        Ok(json!(n * 2))
    }

    fn encode_commands(commands: &[Command]) -> Vec<u8> {
        let codec = LineCodec;
        commands
            .iter()
            .flat_map(|c| codec.encode(c).unwrap())
            .collect()
    }

    fn decode_replies(mut bytes: &[u8]) -> Vec<Reply> {
        let codec = LengthPrefixedCodec::default();
        let mut replies = Vec::new();
        while let Some((reply, used)) = codec.try_decode(bytes).unwrap() {
            replies.push(reply);
            bytes = &bytes[used..];
        }
        assert!(bytes.is_empty(), "trailing bytes after last frame");
        replies
    }

    fn run_loop(input: Vec<u8>) -> (Result<()>, Vec<Reply>) {
        let mut reader = CommandReader::new(Cursor::new(input));
        let mut writer = ReplyWriter::new(Vec::new());
        let result = worker_loop(&mut reader, &mut writer, &double);
        (result, decode_replies(&writer.into_inner()))
    }

    #[test]
    fn test_ready_then_compute_then_halt() {
        let input = encode_commands(&[
            Command::compute_one(OnError::Continue, 0, json!(21)),
            Command::Halt,
            // Never read: the loop stops at halt.
            Command::compute_one(OnError::Continue, 1, json!(1)),
        ]);
        let (result, replies) = run_loop(input);
        assert!(result.is_ok());
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0], Reply::Ready);
        assert_eq!(
            replies[1],
            Reply::compute(vec![(0, Outcome::Ok(json!(42)))])
        );
    }

    #[test]
    fn test_eof_is_clean_halt() {
        let (result, replies) = run_loop(Vec::new());
        assert!(result.is_ok());
        assert_eq!(replies, vec![Reply::Ready]);
    }

    #[test]
    fn test_unknown_command_fails_fast() {
        let (result, replies) = run_loop(b"{\"command\":\"restart\"}\n".to_vec());
        assert!(result.is_err());
        assert_eq!(replies, vec![Reply::Ready]);
    }

    #[test]
    fn test_mismatched_compute_arrays_fail() {
        let input = encode_commands(&[Command::Compute {
            on_error: OnError::Continue,
            task_nums: vec![0, 1],
            tasks: vec![json!(1)],
        }]);
        let (result, _) = run_loop(input);
        assert!(result.is_err());
    }

    #[test]
    fn test_batch_continue_runs_everything() {
        let outcomes = run_batch(
            &double,
            OnError::Continue,
            vec![7, 8, 9],
            vec![json!(1), json!("inject_error"), json!(3)],
        );
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0], (7, Outcome::Ok(json!(2))));
        assert!(outcomes[1].1.is_error());
        assert_eq!(outcomes[2], (9, Outcome::Ok(json!(6))));
    }

    #[test]
    fn test_batch_break_returns_prefix() {
        let outcomes = run_batch(
            &double,
            OnError::Break,
            vec![0, 1, 2],
            vec![json!(1), json!("inject_error"), json!(3)],
        );
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0], (0, Outcome::Ok(json!(2))));
        match &outcomes[1] {
            (1, Outcome::Error(message)) => assert!(message.contains("inject_error")),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_error_chain_is_preserved() {
        let failing = |_: Value| -> anyhow::Result<Value> {
            Err(anyhow!("disk full")).map_err(|e| e.context("writing output"))
        };
        let outcomes = run_batch(&failing, OnError::Continue, vec![0], vec![json!(null)]);
        assert_eq!(
            outcomes[0].1,
            Outcome::Error("writing output: disk full".to_string())
        );
    }

    #[test]
    fn test_panic_becomes_error_outcome() {
        let panicking = |value: Value| -> anyhow::Result<Value> {
            if value.is_null() {
                panic!("null input");
            }
            bail!("unreachable in this test")
        };
        let outcomes = run_batch(&panicking, OnError::Continue, vec![0], vec![Value::Null]);
        match &outcomes[0].1 {
            Outcome::Error(message) => assert!(message.contains("null input")),
            other => panic!("unexpected outcome {:?}", other),
        }
    }
}

//! Worker subprocess spawning.
//!
//! Uses `std::process::Command` (posix_spawn where available). The child's
//! stdin becomes the command pipe and its stdout the reply pipe; stderr is
//! inherited so worker logs reach the same terminal as the dispatcher's.
//! Pipes created by `Command` are close-on-exec, so no worker inherits
//! another worker's descriptors.

use super::proc::WorkerProc;
use crate::error::{ProcfanError, Result};
use std::ffi::{OsStr, OsString};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

/// Argument that makes the `procfan` binary take the worker code path.
pub const WORKER_SENTINEL: &str = "--internal-worker";

/// How long to wait for each worker when unwinding a partially built pool.
const UNWIND_TIMEOUT: Duration = Duration::from_secs(5);

/// How to start one worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl WorkerCommand {
    /// Run `program` as the worker.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// Re-invoke the `procfan` binary at `program` as a worker running `task`.
    pub fn procfan(program: impl Into<PathBuf>, task: &str) -> Self {
        Self::new(program)
            .arg("run")
            .arg(WORKER_SENTINEL)
            .arg("--task")
            .arg(task)
    }

    /// Re-invoke the running executable as a worker running `task`.
    pub fn current_exe(task: &str) -> Result<Self> {
        let exe = std::env::current_exe()?;
        Ok(Self::procfan(exe, task))
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Set an environment variable for the worker.
    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.envs(self.envs.iter().map(|(k, v)| (k, v)));
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());
        cmd
    }
}

/// Spawn one worker subprocess.
pub fn spawn_worker(id: usize, command: &WorkerCommand) -> Result<WorkerProc> {
    let child = command
        .to_command()
        .spawn()
        .map_err(|source| ProcfanError::Spawn {
            worker_id: id,
            source,
        })?;

    let proc = WorkerProc::from_child(id, child)?;
    tracing::debug!(worker_id = id, pid = proc.pid(), "Spawned worker");
    Ok(proc)
}

/// Spawn `size` workers, or none at all.
///
/// If any spawn fails, the workers started so far have their command pipes
/// closed and are reaped before the error is returned.
pub fn spawn_pool(size: usize, command: &WorkerCommand) -> Result<Vec<WorkerProc>> {
    let mut workers = Vec::with_capacity(size);
    for id in 0..size {
        match spawn_worker(id, command) {
            Ok(proc) => workers.push(proc),
            Err(e) => {
                tracing::error!(
                    worker_id = id,
                    spawned = workers.len(),
                    error = %e,
                    "Worker spawn failed, unwinding pool"
                );
                for worker in &mut workers {
                    worker.close_writer();
                    if let Err(reap_err) = worker.reap(UNWIND_TIMEOUT) {
                        tracing::warn!(pid = worker.pid(), error = %reap_err, "Failed to reap worker");
                    }
                }
                return Err(e);
            }
        }
    }
    Ok(workers)
}

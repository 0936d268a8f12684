//! Dispatcher-side handle for one worker process.
//!
//! Owns the worker's pipe ends, its receive buffer and its in-flight state.

use super::codec::{LengthPrefixedCodec, LineCodec};
use super::ipc::{PipeFd, ReadStatus};
use super::protocol::{Command, OnError, Reply};
use super::signals::{TerminationReason, analyze_wait_status};
use crate::error::{ProcfanError, Result};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use serde::Serialize;
use serde_json::Value;
use std::io::Write;
use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};
use std::time::{Duration, Instant};

/// How long to wait after SIGTERM before escalating to SIGKILL.
const TERM_GRACE: Duration = Duration::from_millis(100);

/// Interval between non-blocking reap attempts.
const REAP_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Per-worker counters reported at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub worker_id: usize,
    pub pid: i32,
    /// Compute commands written to this worker.
    pub computes_sent: usize,
    /// Task outcomes received from this worker.
    pub tasks_completed: usize,
    /// Highest number of unacknowledged compute commands ever observed.
    pub max_in_flight: usize,
    /// Whether the advisory ready frame arrived.
    pub ready_seen: bool,
}

/// Handle to a worker subprocess and its pipes.
pub struct WorkerProc {
    id: usize,
    pid: Pid,
    /// Command pipe; `None` once closed.
    writer: Option<PipeFd>,
    /// Reply pipe (non-blocking); `None` once the process has been reaped.
    reader: Option<PipeFd>,
    recv_buf: Vec<u8>,
    /// Task indices of the unacknowledged compute, if any.
    outstanding: Option<Vec<usize>>,
    in_flight: usize,
    eof: bool,
    /// Set when poll reports an error condition on the command pipe.
    command_broken: bool,
    reaped: bool,
    stats: WorkerStats,
}

impl WorkerProc {
    /// Create a handle from a spawned child, taking its stdin and stdout.
    ///
    /// On failure the child is killed and waited for before the error is
    /// returned.
    pub fn from_child(id: usize, mut child: std::process::Child) -> Result<Self> {
        let pid = Pid::from_raw(child.id() as i32);

        let (writer, reader) = match Self::take_pipes(pid, &mut child) {
            Ok(pipes) => pipes,
            Err(e) => {
                tracing::debug!(pid = pid.as_raw(), error = %e, "Discarding unusable worker");
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        };

        Ok(Self {
            id,
            pid,
            writer: Some(writer),
            reader: Some(reader),
            recv_buf: Vec::new(),
            outstanding: None,
            in_flight: 0,
            eof: false,
            command_broken: false,
            reaped: false,
            stats: WorkerStats {
                worker_id: id,
                pid: pid.as_raw(),
                ..Default::default()
            },
        })
    }

    fn take_pipes(pid: Pid, child: &mut std::process::Child) -> Result<(PipeFd, PipeFd)> {
        let stdin = child.stdin.take().ok_or_else(|| {
            ProcfanError::transport(pid.as_raw(), "child stdin not captured")
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            ProcfanError::transport(pid.as_raw(), "child stdout not captured")
        })?;

        let writer = PipeFd::new(OwnedFd::from(stdin));
        let reader = PipeFd::new(OwnedFd::from(stdout));
        reader.set_nonblocking()?;
        Ok((writer, reader))
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// True when no compute is awaiting a reply.
    pub fn is_idle(&self) -> bool {
        self.outstanding.is_none()
    }

    /// True once a read has returned EOF.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    pub fn reader_fd(&self) -> Option<BorrowedFd<'_>> {
        self.reader.as_ref().map(|r| r.as_fd())
    }

    /// The command pipe, unless it is closed or known to be broken.
    pub fn writer_fd(&self) -> Option<BorrowedFd<'_>> {
        if self.command_broken {
            return None;
        }
        self.writer.as_ref().map(|w| w.as_fd())
    }

    /// Stop watching the command pipe after poll reported an error on it.
    ///
    /// Not fatal by itself: a pending reply may still arrive on the reply
    /// pipe, and a dead worker shows up there as EOF.
    pub fn mark_command_broken(&mut self) {
        self.command_broken = true;
    }

    /// Send a single-task compute command.
    ///
    /// Fails if the worker still owes a reply for its previous compute.
    pub fn send_compute(
        &mut self,
        codec: &LineCodec,
        on_error: OnError,
        index: usize,
        task: Value,
    ) -> Result<()> {
        if let Some(pending) = &self.outstanding {
            return Err(ProcfanError::transport(
                self.pid(),
                format!("compute sent while tasks {:?} are unacknowledged", pending),
            ));
        }

        let frame = codec.encode(&Command::compute_one(on_error, index, task))?;
        self.write_frame(&frame)?;

        self.outstanding = Some(vec![index]);
        self.in_flight += 1;
        self.stats.computes_sent += 1;
        self.stats.max_in_flight = self.stats.max_in_flight.max(self.in_flight);
        Ok(())
    }

    /// Send the halt command.
    pub fn send_halt(&mut self, codec: &LineCodec) -> Result<()> {
        let frame = codec.encode(&Command::Halt)?;
        self.write_frame(&frame)
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        let pid = self.pid();
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| ProcfanError::transport(pid, "command pipe already closed"))?;
        writer
            .write_all(frame)
            .map_err(|e| ProcfanError::transport(pid, format!("failed to send command: {}", e)))
    }

    /// Close the command pipe. The worker sees EOF on its next read.
    pub fn close_writer(&mut self) {
        self.writer = None;
    }

    /// One non-blocking read into the receive buffer.
    pub fn read_available(&mut self) -> Result<ReadStatus> {
        let pid = self.pid();
        let Some(reader) = self.reader.as_mut() else {
            return Ok(ReadStatus::Eof);
        };
        let status = reader
            .read_available(&mut self.recv_buf)
            .map_err(|e| ProcfanError::transport(pid, format!("read failed: {}", e)))?;
        if status == ReadStatus::Eof {
            self.eof = true;
        }
        Ok(status)
    }

    /// Decode the next complete reply from the receive buffer, if any.
    pub fn next_reply(&mut self, codec: &LengthPrefixedCodec) -> Result<Option<Reply>> {
        let decoded = codec.try_decode(&self.recv_buf).map_err(|e| match e {
            ProcfanError::Json(err) => {
                ProcfanError::transport(self.pid(), format!("malformed reply: {}", err))
            }
            other => other,
        })?;
        Ok(decoded.map(|(reply, consumed)| {
            self.recv_buf.drain(..consumed);
            reply
        }))
    }

    /// Bytes received but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.recv_buf.len()
    }

    /// Clear the outstanding compute and return the indices it covered.
    pub fn take_outstanding(&mut self) -> Option<Vec<usize>> {
        let pending = self.outstanding.take();
        if pending.is_some() {
            self.in_flight -= 1;
        }
        pending
    }

    pub fn record_completed(&mut self, count: usize) {
        self.stats.tasks_completed += count;
    }

    pub fn mark_ready(&mut self) {
        self.stats.ready_seen = true;
    }

    fn try_wait(&mut self) -> Result<Option<WaitStatus>> {
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG))? {
            WaitStatus::StillAlive => Ok(None),
            status => {
                self.reaped = true;
                Ok(Some(status))
            }
        }
    }

    /// Wait for the worker to exit and return why it did.
    ///
    /// Output still arriving on the reply pipe is drained and discarded so a
    /// worker blocked on a full pipe can finish. If the worker is still alive
    /// after `timeout` it is sent SIGTERM, then SIGKILL. The reply pipe is
    /// closed only after the process has been reaped.
    pub fn reap(&mut self, timeout: Duration) -> Result<TerminationReason> {
        if self.reaped {
            return Err(ProcfanError::transport(self.pid(), "process already reaped"));
        }

        let deadline = Instant::now() + timeout;
        let mut discard = Vec::new();
        let status = loop {
            if let Some(status) = self.try_wait()? {
                break status;
            }
            if let Some(reader) = self.reader.as_mut() {
                if let Err(e) = reader.read_available(&mut discard) {
                    tracing::trace!(
                        worker_id = self.id,
                        pid = self.pid.as_raw(),
                        error = %e,
                        "Reply pipe drain failed during reap"
                    );
                }
                discard.clear();
            }
            if Instant::now() >= deadline {
                break self.escalate()?;
            }
            std::thread::sleep(REAP_POLL_INTERVAL);
        };

        self.reader = None;
        Ok(analyze_wait_status(status))
    }

    /// SIGTERM, brief grace, then SIGKILL and a blocking wait.
    fn escalate(&mut self) -> Result<WaitStatus> {
        tracing::warn!(
            worker_id = self.id,
            pid = self.pid(),
            "Worker did not exit after halt, terminating"
        );
        let _ = signal::kill(self.pid, Signal::SIGTERM);
        std::thread::sleep(TERM_GRACE);
        if let Some(status) = self.try_wait()? {
            return Ok(status);
        }

        let _ = signal::kill(self.pid, Signal::SIGKILL);
        let status = waitpid(self.pid, None)?;
        self.reaped = true;
        Ok(status)
    }
}

impl Drop for WorkerProc {
    fn drop(&mut self) {
        if !self.reaped {
            let _ = signal::kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
            self.reaped = true;
        }
    }
}

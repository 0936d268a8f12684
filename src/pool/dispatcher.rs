//! Dispatcher: the master-side event loop.
//!
//! A run spawns the pool, hands one task to each worker, then multiplexes
//! over every reply pipe with `poll(2)`. Each reply is recorded by task
//! index and the worker that sent it immediately receives the next unclaimed
//! task, so fast workers stay busy without any static partitioning. At most
//! one compute command is ever outstanding per worker.
//!
//! Every run ends with the same shutdown: halt every worker, close the
//! command pipes, reap every process, and only then close the reply pipes.

use super::codec::{LengthPrefixedCodec, LineCodec, MAX_FRAME_LEN};
use super::ipc::ReadStatus;
use super::proc::{WorkerProc, WorkerStats};
use super::protocol::{OnError, Outcome, Reply, zip_outcomes};
use super::spawn::{WorkerCommand, spawn_pool};
use crate::error::{ProcfanError, Result};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, trace, warn};

/// Default upper bound on one multiplex wait.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default time a worker gets to exit after `Halt` before it is terminated.
pub const DEFAULT_HALT_TIMEOUT: Duration = Duration::from_secs(30);

/// Smallest accepted `max_frame_len`.
pub const MIN_FRAME_LEN_LIMIT: u64 = 4096;

/// Number of logical CPUs, or 1 if it cannot be determined.
pub fn default_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Configuration for one dispatch run.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Number of worker processes.
    pub pool_size: usize,
    /// Whether the first task error aborts the run.
    pub on_error: OnError,
    /// How to start each worker.
    pub worker: WorkerCommand,
    /// Upper bound on one multiplex wait; also how long an interrupt can go unnoticed.
    pub poll_interval: Duration,
    /// Time a worker gets to exit after `Halt` before SIGTERM/SIGKILL.
    pub halt_timeout: Duration,
    /// Largest reply frame accepted from a worker.
    pub max_frame_len: u64,
}

impl DispatchConfig {
    pub fn new(worker: WorkerCommand) -> Self {
        Self {
            pool_size: default_pool_size(),
            on_error: OnError::default(),
            worker,
            poll_interval: DEFAULT_POLL_INTERVAL,
            halt_timeout: DEFAULT_HALT_TIMEOUT,
            max_frame_len: MAX_FRAME_LEN,
        }
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_on_error(mut self, on_error: OnError) -> Self {
        self.on_error = on_error;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_halt_timeout(mut self, halt_timeout: Duration) -> Self {
        self.halt_timeout = halt_timeout;
        self
    }

    pub fn with_max_frame_len(mut self, max_frame_len: u64) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(ProcfanError::InvalidConfig(
                "pool size must be at least 1".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(ProcfanError::InvalidConfig(
                "poll interval must be non-zero".to_string(),
            ));
        }
        if self.halt_timeout.is_zero() {
            return Err(ProcfanError::InvalidConfig(
                "halt timeout must be non-zero".to_string(),
            ));
        }
        if self.max_frame_len < MIN_FRAME_LEN_LIMIT {
            return Err(ProcfanError::InvalidConfig(format!(
                "max frame length must be at least {} bytes, got {}",
                MIN_FRAME_LEN_LIMIT, self.max_frame_len
            )));
        }
        Ok(())
    }
}

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Unclaimed tasks remain.
    Filling,
    /// Every task has been sent; waiting for the last replies.
    Draining,
    /// A break-policy error or interrupt stopped the run.
    Aborting,
    ShuttingDown,
    Done,
}

/// Statistics about a completed run.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchStats {
    pub pool_size: usize,
    pub tasks: usize,
    /// Compute commands sent across all workers.
    pub computes_sent: usize,
    pub replies_received: usize,
    pub task_errors: usize,
    /// Advisory ready frames seen before shutdown.
    pub ready_frames: usize,
    pub elapsed_ms: u128,
    pub workers: Vec<WorkerStats>,
}

/// Results of a successful run, in task order, with statistics.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    /// One slot per task; `null` where the task failed.
    pub results: Vec<Value>,
    pub stats: DispatchStats,
}

/// Task index → outcome, filled in as replies arrive.
struct ResultTable {
    slots: Vec<Option<Outcome>>,
    filled: usize,
}

impl ResultTable {
    fn new(len: usize) -> Self {
        Self {
            slots: vec![None; len],
            filled: 0,
        }
    }

    fn insert(&mut self, pid: i32, index: usize, outcome: Outcome) -> Result<()> {
        let slot = self.slots.get_mut(index).ok_or_else(|| {
            ProcfanError::transport(pid, format!("reply for unknown task index {}", index))
        })?;
        if slot.is_some() {
            return Err(ProcfanError::transport(
                pid,
                format!("duplicate reply for task index {}", index),
            ));
        }
        *slot = Some(outcome);
        self.filled += 1;
        Ok(())
    }

    fn remaining(&self) -> usize {
        self.slots.len() - self.filled
    }

    fn is_complete(&self) -> bool {
        self.remaining() == 0
    }

    fn into_values(self) -> Vec<Value> {
        self.slots
            .into_iter()
            .map(|slot| slot.map_or(Value::Null, Outcome::into_value))
            .collect()
    }
}

/// Which pipe of a worker poll reported on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Reply,
    Command,
}

/// Fans tasks out to a pool of worker processes.
pub struct Dispatcher {
    config: DispatchConfig,
    interrupt: Option<Arc<AtomicBool>>,
}

impl Dispatcher {
    pub fn new(config: DispatchConfig) -> Self {
        Self {
            config,
            interrupt: None,
        }
    }

    /// Abort the run with [`ProcfanError::Interrupted`] once `flag` is set.
    pub fn with_interrupt_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Run every task and return the results in task order.
    ///
    /// All workers are halted and reaped before this returns, whether the run
    /// succeeded or not. Under [`OnError::Break`] the first task error is
    /// returned as [`ProcfanError::TaskFailed`] and no results are returned.
    #[instrument(level = "debug", skip(self, tasks), fields(tasks = tasks.len(), pool_size = self.config.pool_size))]
    pub fn run(&self, tasks: Vec<Value>) -> Result<DispatchReport> {
        self.config.validate()?;
        let start = Instant::now();

        info!(
            tasks = tasks.len(),
            workers = self.config.pool_size,
            on_error = %self.config.on_error,
            "Dispatching tasks"
        );

        let workers = spawn_pool(self.config.pool_size, &self.config.worker)?;
        let mut run = Run::new(&self.config, self.interrupt.clone(), workers, tasks);

        let outcome = run.event_loop();
        let shutdown = run.shutdown();
        let stats = run.stats(start.elapsed());

        match (outcome, shutdown) {
            (Err(e), shutdown) => {
                if let Err(shutdown_err) = shutdown {
                    warn!(error = %shutdown_err, "Shutdown also failed after run error");
                }
                error!(error = %e, elapsed_ms = stats.elapsed_ms, "Dispatch aborted");
                Err(e)
            }
            (Ok(()), Err(e)) => {
                error!(error = %e, "Dispatch failed during shutdown");
                Err(e)
            }
            (Ok(()), Ok(())) => {
                info!(
                    tasks = stats.tasks,
                    task_errors = stats.task_errors,
                    computes_sent = stats.computes_sent,
                    elapsed_ms = stats.elapsed_ms,
                    "Dispatch complete"
                );
                Ok(DispatchReport {
                    results: run.table.into_values(),
                    stats,
                })
            }
        }
    }
}

/// Run `tasks` on a pool described by `config` and return the results in order.
pub fn dispatch(tasks: Vec<Value>, config: &DispatchConfig) -> Result<Vec<Value>> {
    Dispatcher::new(config.clone())
        .run(tasks)
        .map(|report| report.results)
}

/// Mutable state of a single run. Owned and mutated only by the dispatcher.
struct Run<'a> {
    config: &'a DispatchConfig,
    interrupt: Option<Arc<AtomicBool>>,
    workers: Vec<WorkerProc>,
    /// Unclaimed tasks in index order.
    queue: VecDeque<(usize, Value)>,
    table: ResultTable,
    state: RunState,
    /// First error that aborted the run.
    latched: Option<ProcfanError>,
    line_codec: LineCodec,
    reply_codec: LengthPrefixedCodec,
    task_count: usize,
    computes_sent: usize,
    replies_received: usize,
    task_errors: usize,
    ready_frames: usize,
}

impl<'a> Run<'a> {
    fn new(
        config: &'a DispatchConfig,
        interrupt: Option<Arc<AtomicBool>>,
        workers: Vec<WorkerProc>,
        tasks: Vec<Value>,
    ) -> Self {
        let task_count = tasks.len();
        Self {
            config,
            interrupt,
            workers,
            queue: tasks.into_iter().enumerate().collect(),
            table: ResultTable::new(task_count),
            state: RunState::Filling,
            latched: None,
            line_codec: LineCodec,
            reply_codec: LengthPrefixedCodec::with_max_frame_len(config.max_frame_len),
            task_count,
            computes_sent: 0,
            replies_received: 0,
            task_errors: 0,
            ready_frames: 0,
        }
    }

    /// Drive the run to completion or abort. A latched abort error takes
    /// precedence over any error raised while the run was winding down.
    fn event_loop(&mut self) -> Result<()> {
        let result = self.drive();
        match self.latched.take() {
            Some(latched) => {
                if let Err(e) = result {
                    warn!(error = %e, "Error after run was already aborting");
                }
                Err(latched)
            }
            None => result,
        }
    }

    fn drive(&mut self) -> Result<()> {
        self.fill()?;

        while !self.table.is_complete() && self.state != RunState::Aborting {
            if self.interrupted() {
                warn!(
                    remaining = self.table.remaining(),
                    "Interrupt received, aborting run"
                );
                self.abort(ProcfanError::Interrupted);
                break;
            }

            for (worker, side) in self.wait()? {
                match side {
                    Side::Reply => self.service(worker)?,
                    Side::Command => {
                        debug!(
                            worker_id = worker,
                            pid = self.workers[worker].pid(),
                            "Command pipe reported an error condition"
                        );
                        self.workers[worker].mark_command_broken();
                    }
                }
            }
        }
        Ok(())
    }

    fn interrupted(&self) -> bool {
        self.interrupt
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// Latch `err` as the run's error unless one is already latched.
    fn abort(&mut self, err: ProcfanError) {
        if self.latched.is_none() {
            self.latched = Some(err);
        }
        self.state = RunState::Aborting;
    }

    /// Give every worker its first task.
    fn fill(&mut self) -> Result<()> {
        for worker in 0..self.workers.len() {
            if self.queue.is_empty() {
                break;
            }
            self.refill(worker)?;
        }
        if self.queue.is_empty() && self.state == RunState::Filling {
            self.state = RunState::Draining;
        }
        Ok(())
    }

    /// Send the next unclaimed task to `worker`, unless the run is aborting.
    fn refill(&mut self, worker: usize) -> Result<()> {
        if self.state == RunState::Aborting {
            return Ok(());
        }
        let Some((index, task)) = self.queue.pop_front() else {
            return Ok(());
        };

        let proc = &mut self.workers[worker];
        trace!(worker_id = worker, pid = proc.pid(), task_index = index, "Sending task");
        proc.send_compute(&self.line_codec, self.config.on_error, index, task)?;
        self.computes_sent += 1;

        if self.queue.is_empty() && self.state == RunState::Filling {
            debug!("All tasks claimed, draining");
            self.state = RunState::Draining;
        }
        Ok(())
    }

    /// Block until at least one pipe is ready or the poll interval elapses.
    fn wait(&self) -> Result<Vec<(usize, Side)>> {
        let mut owners = Vec::with_capacity(self.workers.len() * 2);
        let mut fds = Vec::with_capacity(self.workers.len() * 2);
        for (i, proc) in self.workers.iter().enumerate() {
            if !proc.is_eof()
                && let Some(fd) = proc.reader_fd()
            {
                fds.push(PollFd::new(fd, PollFlags::POLLIN));
                owners.push((i, Side::Reply));
            }
            if let Some(fd) = proc.writer_fd() {
                // No requested events: poll still reports POLLERR/POLLHUP.
                fds.push(PollFd::new(fd, PollFlags::empty()));
                owners.push((i, Side::Command));
            }
        }

        if !owners.iter().any(|(_, side)| *side == Side::Reply) {
            return Err(ProcfanError::PoolExhausted {
                remaining: self.table.remaining(),
            });
        }

        let millis = u16::try_from(self.config.poll_interval.as_millis()).unwrap_or(u16::MAX);
        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(0) | Err(Errno::EINTR) => return Ok(Vec::new()),
            Ok(_) => {}
            Err(e) => return Err(e.into()),
        }

        Ok(fds
            .iter()
            .zip(owners)
            .filter(|(fd, _)| fd.revents().is_some_and(|events| !events.is_empty()))
            .map(|(_, owner)| owner)
            .collect())
    }

    /// Read once from a ready worker and process every complete reply.
    fn service(&mut self, worker: usize) -> Result<()> {
        let status = self.workers[worker].read_available()?;

        while let Some(reply) = self.workers[worker].next_reply(&self.reply_codec)? {
            self.handle_reply(worker, reply)?;
        }

        if status == ReadStatus::Eof {
            let proc = &self.workers[worker];
            if !proc.is_idle() {
                return Err(ProcfanError::transport(
                    proc.pid(),
                    "reply pipe closed while a compute was outstanding",
                ));
            }
            if proc.buffered() > 0 {
                return Err(ProcfanError::transport(
                    proc.pid(),
                    format!("reply pipe closed inside a frame ({} bytes buffered)", proc.buffered()),
                ));
            }
            debug!(worker_id = worker, pid = proc.pid(), "Idle worker closed its reply pipe");
        }
        Ok(())
    }

    fn handle_reply(&mut self, worker: usize, reply: Reply) -> Result<()> {
        let proc = &mut self.workers[worker];
        let pid = proc.pid();

        let (status, errors, result_nums, results) = match reply {
            Reply::Ready => {
                trace!(worker_id = worker, pid, "Worker ready");
                proc.mark_ready();
                self.ready_frames += 1;
                return Ok(());
            }
            Reply::Compute {
                status,
                errors,
                result_nums,
                results,
            } => (status, errors, result_nums, results),
        };

        let Some(expected) = proc.take_outstanding() else {
            return Err(ProcfanError::transport(
                pid,
                "compute reply without an outstanding compute",
            ));
        };
        let outcomes = zip_outcomes(pid, status, errors, result_nums, results)?;

        let in_order = outcomes.len() <= expected.len()
            && outcomes.iter().zip(&expected).all(|((got, _), want)| got == want);
        if !in_order {
            return Err(ProcfanError::transport(
                pid,
                format!("reply does not match request {:?}", expected),
            ));
        }
        let truncated_by_break = self.config.on_error == OnError::Break
            && outcomes.last().is_some_and(|(_, outcome)| outcome.is_error());
        if outcomes.len() < expected.len() && !truncated_by_break {
            return Err(ProcfanError::transport(
                pid,
                format!(
                    "reply covers {} of {} requested tasks",
                    outcomes.len(),
                    expected.len()
                ),
            ));
        }

        proc.record_completed(outcomes.len());
        self.replies_received += 1;

        for (index, outcome) in outcomes {
            if let Outcome::Error(message) = &outcome {
                self.task_errors += 1;
                match self.config.on_error {
                    OnError::Break if self.latched.is_none() => {
                        warn!(worker_id = worker, pid, task_index = index, error = %message, "Task failed, aborting run");
                        self.abort(ProcfanError::TaskFailed {
                            index,
                            message: message.clone(),
                        });
                    }
                    OnError::Break => {
                        warn!(worker_id = worker, pid, task_index = index, error = %message, "Task failed after run was aborted");
                    }
                    OnError::Continue => {
                        warn!(worker_id = worker, pid, task_index = index, error = %message, "Task failed");
                    }
                }
            } else {
                trace!(worker_id = worker, pid, task_index = index, "Task completed");
            }
            self.table.insert(pid, index, outcome)?;
        }

        self.refill(worker)
    }

    /// Halt every worker, close command pipes, reap every process.
    ///
    /// Runs at most once. Returns the first abnormal exit, if any.
    fn shutdown(&mut self) -> Result<()> {
        if matches!(self.state, RunState::ShuttingDown | RunState::Done) {
            return Ok(());
        }
        self.state = RunState::ShuttingDown;
        debug!(workers = self.workers.len(), "Halting workers");

        for proc in &mut self.workers {
            if let Err(e) = proc.send_halt(&self.line_codec) {
                debug!(pid = proc.pid(), error = %e, "Could not send halt");
            }
            proc.close_writer();
        }

        let mut first_error = None;
        for proc in &mut self.workers {
            match proc.reap(self.config.halt_timeout) {
                Ok(reason) if reason.is_success() => {
                    trace!(worker_id = proc.id(), pid = proc.pid(), "Worker exited cleanly");
                }
                Ok(reason) => {
                    error!(worker_id = proc.id(), pid = proc.pid(), reason = %reason, "Worker exited abnormally");
                    first_error.get_or_insert(ProcfanError::WorkerExit {
                        pid: proc.pid(),
                        reason: reason.to_string(),
                    });
                }
                Err(e) => {
                    error!(worker_id = proc.id(), pid = proc.pid(), error = %e, "Failed to reap worker");
                    first_error.get_or_insert(e);
                }
            }
        }

        self.state = RunState::Done;
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn stats(&self, elapsed: Duration) -> DispatchStats {
        DispatchStats {
            pool_size: self.workers.len(),
            tasks: self.task_count,
            computes_sent: self.computes_sent,
            replies_received: self.replies_received,
            task_errors: self.task_errors,
            ready_frames: self.ready_frames,
            elapsed_ms: elapsed.as_millis(),
            workers: self.workers.iter().map(|w| w.stats().clone()).collect(),
        }
    }
}

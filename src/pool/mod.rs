//! Process-pool task dispatcher.
//!
//! Fans a list of independent JSON tasks out to a fixed-size pool of worker
//! processes, collects their results by task index, and halts and reaps every
//! worker before returning.
//!
//! # Architecture
//!
//! ```text
//!                     ┌─────────────────┐
//!                     │   Dispatcher    │
//!                     │  (poll loop)    │
//!                     └────────┬────────┘
//!          JSON lines ↓        │        ↑ u64 length + JSON
//!               ┌──────────────┼──────────────┐
//!               │              │              │
//!         ┌─────▼─────┐  ┌─────▼─────┐  ┌─────▼─────┐
//!         │ Worker 0  │  │ Worker 1  │  │ Worker N  │
//!         │ (process) │  │ (process) │  │ (process) │
//!         └───────────┘  └───────────┘  └───────────┘
//! ```
//!
//! # Guarantees
//!
//! - **Pull-based**: a worker gets its next task only after replying to the
//!   previous one, so at most `pool_size` tasks are ever in flight
//! - **Ordered results**: results are reassembled by task index regardless of
//!   completion order
//! - **Verified shutdown**: every worker is halted and reaped on every exit
//!   path, and a non-zero exit is an error

mod codec;
mod dispatcher;
mod ipc;
mod proc;
mod protocol;
mod signals;
mod spawn;
mod worker_main;

pub use codec::{LEN_PREFIX_SIZE, LengthPrefixedCodec, LineCodec, MAX_FRAME_LEN};
pub use dispatcher::{
    DEFAULT_HALT_TIMEOUT, DEFAULT_POLL_INTERVAL, DispatchConfig, DispatchReport, DispatchStats,
    Dispatcher, MIN_FRAME_LEN_LIMIT, RunState, default_pool_size, dispatch,
};
pub use ipc::{CommandReader, ReplyWriter};
pub use proc::WorkerStats;
pub use protocol::{Command, OnError, Outcome, Reply, Status};
pub use signals::TerminationReason;
pub use spawn::{WORKER_SENTINEL, WorkerCommand};
pub use worker_main::{run_worker, worker_loop};

//! procfan - fan JSON tasks out to a pool of worker processes.
//!
//! ```no_run
//! use procfan::{DispatchConfig, OnError, WorkerCommand, dispatch};
//! use serde_json::json;
//!
//! let config = DispatchConfig::new(WorkerCommand::current_exe("double")?)
//!     .with_pool_size(2)
//!     .with_on_error(OnError::Continue);
//! let results = dispatch(vec![json!(1), json!(2)], &config)?;
//! assert_eq!(results, vec![json!(2), json!(4)]);
//! # Ok::<(), procfan::ProcfanError>(())
//! ```

pub mod error;
pub mod logging;
pub mod pool;
pub mod tasks;

pub use error::{ProcfanError, Result};
pub use pool::{
    DispatchConfig, DispatchReport, DispatchStats, Dispatcher, OnError, WorkerCommand, dispatch,
    run_worker,
};

//! # downdraft
//!
//! Concurrency and scheduling substrate for media-automation systems:
//! a generic finite-state-machine runtime, a resumable multi-connection
//! HTTP download engine built on it, and a priority-based task and
//! pipeline orchestration layer for arbitrary asynchronous work.
//!
//! ## Quick start
//!
//! ```no_run
//! use downdraft::{DownloadRequest, DownloadTask, RetryPolicy, TaskManager};
//!
//! # async fn run() -> downdraft::Result<()> {
//! let manager = TaskManager::new(4, RetryPolicy::task_default());
//! let client = reqwest::Client::new();
//!
//! let request = DownloadRequest::new("https://example.com/big.iso", "/tmp/big.iso")
//!     .with_max_connections(4);
//! let id = manager.add(Box::new(DownloadTask::new(client, request)), 0);
//!
//! let completion = manager.await_task(&id).await?;
//! println!("finished after {} attempt(s)", completion.attempts);
//! # Ok(())
//! # }
//! ```
//!
//! ## Layers
//!
//! - [`fsm`]: string-tagged states, handler tables frozen at construction,
//!   serialized dispatch with an explicit action mailbox
//! - [`http`]: [`Downloader`] splits a resource into byte ranges and runs
//!   one [`DownloadConnection`](http::DownloadConnection) per range, with
//!   pause/resume, ETag-checked restarts, and per-connection retry
//! - [`task`]: the [`Task`] trait, [`TaskManager`] scheduling (priority,
//!   concurrency limit, automatic retry), and [`Pipeline`] workflows
//!
//! Nothing here installs a `tracing` subscriber or spawns a runtime; the
//! crate expects to live inside a host application's tokio runtime.

pub mod config;
pub mod error;
pub mod events;
pub mod fsm;
pub mod http;
pub mod progress;
pub mod retry;
pub mod task;

pub use config::{EngineConfig, HttpConfig};
pub use error::{EngineError, FailureReason, Result};
pub use events::EngineEvent;
pub use http::{
    ByteRange, DownloadOptions, DownloadRequest, DownloadResult, Downloader, ResolutionPolicy,
    ResolveTrigger, UrlSource,
};
pub use progress::ProgressSnapshot;
pub use retry::RetryPolicy;
pub use task::{
    DownloadTask, PauseKind, Pipeline, PipelineExecution, PipelineOutcome, PipelineStatus, Step,
    StepContext, StepOutcome, Task, TaskCompletion, TaskManager, TaskResult, TaskState,
};

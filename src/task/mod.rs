//! Task abstraction and orchestration
//!
//! A [`Task`] is a cancelable, pausable, restartable unit of asynchronous
//! work with a canonical lifecycle. [`TaskManager`] schedules tasks by
//! priority under a concurrency limit with automatic retries;
//! [`Pipeline`] chains task-producing steps into reusable workflows.
//!
//! [`DownloadTask`] is the built-in implementation wrapping a
//! [`Downloader`]; anything else that can start, pause, resume, and cancel
//! can implement the trait and be scheduled the same way.

pub mod manager;
pub mod pipeline;

pub use manager::{TaskCompletion, TaskManager, TaskSnapshot};
pub use pipeline::{
    Pipeline, PipelineBuilder, PipelineExecution, PipelineOutcome, PipelineStatus, Step,
    StepContext, StepOutcome,
};

use crate::error::{EngineError, Result};
use crate::http::downloader::{states as dl_states, DownloadOptions, Downloader};
use crate::http::{DownloadRequest, DownloadResult};
use crate::progress::ProgressSnapshot;
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Canonical lifecycle state every task maps its internals onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Idle,
    AwaitingRetry,
    Running,
    Pausing,
    Paused,
    Cancelling,
    Cancelled,
    Failed,
    Success,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Failed | Self::Success)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            Self::Idle => "idle",
            Self::AwaitingRetry => "awaiting_retry",
            Self::Running => "running",
            Self::Pausing => "pausing",
            Self::Paused => "paused",
            Self::Cancelling => "cancelling",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            Self::Success => "success",
        };
        f.write_str(tag)
    }
}

/// Who asked for the pause. Scheduler-initiated pauses may be undone by
/// the scheduler; user-initiated ones may not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseKind {
    Manual,
    Auto,
}

/// Outcome of one task attempt. Payloads are opaque to the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskResult {
    Success { value: serde_json::Value },
    Failed { message: String },
    Cancelled,
}

impl TaskResult {
    pub fn success(value: serde_json::Value) -> Self {
        Self::Success { value }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// A schedulable unit of asynchronous work.
///
/// Lifecycle methods are synchronous triggers; the work itself runs in the
/// background and settles through [`await_result`](Task::await_result).
/// `start` on a task whose previous attempt failed begins a fresh attempt.
#[async_trait]
pub trait Task: Send + Sync {
    fn id(&self) -> &str;

    fn task_type(&self) -> &'static str;

    fn status(&self) -> TaskState;

    /// Begin (or re-begin after a failure) the work
    fn start(&self) -> Result<()>;

    fn pause(&self, kind: PauseKind) -> Result<()>;

    fn resume(&self) -> Result<()>;

    fn cancel(&self) -> Result<()>;

    /// Wait for the current attempt to settle
    async fn await_result(&self) -> TaskResult;

    /// Release resources after a final failure or cancellation. Not called
    /// on success.
    async fn cleanup(&self) {}

    fn progress(&self) -> Option<ProgressSnapshot> {
        None
    }
}

/// Generate a task id with a type prefix
pub fn task_id(task_type: &str) -> String {
    format!("{}-{}", task_type, Uuid::new_v4())
}

/// A [`Task`] that downloads one resource to disk.
///
/// Each attempt runs a fresh [`Downloader`]; a task-level retry therefore
/// restarts the download from scratch, while pause/resume of a live
/// attempt keeps its partial progress.
pub struct DownloadTask {
    id: String,
    client: Client,
    request: DownloadRequest,
    options: DownloadOptions,
    downloader: Mutex<Option<Arc<Downloader>>>,
    cancelled_early: AtomicBool,
}

impl DownloadTask {
    pub fn new(client: Client, request: DownloadRequest) -> Self {
        Self::with_options(client, request, DownloadOptions::default())
    }

    pub fn with_options(client: Client, request: DownloadRequest, options: DownloadOptions) -> Self {
        Self {
            id: task_id("download"),
            client,
            request,
            options,
            downloader: Mutex::new(None),
            cancelled_early: AtomicBool::new(false),
        }
    }

    fn current(&self) -> Option<Arc<Downloader>> {
        self.downloader.lock().clone()
    }
}

#[async_trait]
impl Task for DownloadTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn task_type(&self) -> &'static str {
        "download"
    }

    fn status(&self) -> TaskState {
        if self.cancelled_early.load(Ordering::Relaxed) {
            return TaskState::Cancelled;
        }
        match self.current() {
            None => TaskState::Idle,
            Some(d) => map_download_state(d.state()),
        }
    }

    fn start(&self) -> Result<()> {
        if self.cancelled_early.load(Ordering::Relaxed) {
            return Err(EngineError::InvalidAction {
                state: "cancelled",
                action: "start",
            });
        }
        let mut slot = self.downloader.lock();
        match slot.as_ref() {
            Some(d) if !dl_states::is_terminal(d.state()) => d.start(),
            _ => {
                // Fresh attempt: prior terminal downloaders are discarded
                let d = Downloader::with_options(
                    self.client.clone(),
                    self.request.clone(),
                    self.options.clone(),
                );
                d.start()?;
                *slot = Some(d);
                Ok(())
            }
        }
    }

    fn pause(&self, kind: PauseKind) -> Result<()> {
        tracing::debug!(id = %self.id, ?kind, "pausing download task");
        match self.current() {
            Some(d) => d.pause(),
            None => Ok(()),
        }
    }

    fn resume(&self) -> Result<()> {
        match self.current() {
            Some(d) => d.resume(),
            None => Ok(()),
        }
    }

    fn cancel(&self) -> Result<()> {
        match self.current() {
            Some(d) => d.cancel(),
            None => {
                self.cancelled_early.store(true, Ordering::Relaxed);
                Ok(())
            }
        }
    }

    async fn await_result(&self) -> TaskResult {
        let downloader = self.current();
        match downloader {
            Some(d) => match d.await_result().await {
                DownloadResult::Success { path } => {
                    TaskResult::success(serde_json::json!({ "path": path }))
                }
                DownloadResult::Cancelled => TaskResult::Cancelled,
                DownloadResult::Failed { reason, message } => {
                    TaskResult::failed(format!("{}: {}", reason, message))
                }
            },
            None if self.cancelled_early.load(Ordering::Relaxed) => TaskResult::Cancelled,
            None => TaskResult::failed("task was never started"),
        }
    }

    async fn cleanup(&self) {
        if let Some(d) = self.current() {
            d.cleanup().await;
        }
    }

    fn progress(&self) -> Option<ProgressSnapshot> {
        self.current().map(|d| d.progress())
    }
}

fn map_download_state(tag: &'static str) -> TaskState {
    match tag {
        dl_states::IDLE => TaskState::Idle,
        dl_states::PAUSING => TaskState::Pausing,
        dl_states::PAUSED => TaskState::Paused,
        dl_states::CANCELLING => TaskState::Cancelling,
        dl_states::CANCELLED => TaskState::Cancelled,
        dl_states::AWAITING_RETRY => TaskState::AwaitingRetry,
        dl_states::SUCCESS => TaskState::Success,
        dl_states::FAILED => TaskState::Failed,
        // preparing, starting, downloading, completing
        _ => TaskState::Running,
    }
}

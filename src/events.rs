//! Engine event stream
//!
//! Managers and pipelines publish [`EngineEvent`]s over a
//! `tokio::sync::broadcast` channel. Events are serializable so frontends
//! can forward them over IPC or websockets unchanged. Slow subscribers
//! lose old events rather than applying backpressure.

use crate::progress::ProgressSnapshot;
use crate::task::{TaskResult, TaskState};
use serde::Serialize;

/// Capacity of manager/pipeline event channels
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    TaskAdded {
        id: String,
        task_type: String,
        priority: i32,
    },
    TaskStateChanged {
        id: String,
        state: TaskState,
    },
    TaskProgress {
        id: String,
        progress: ProgressSnapshot,
    },
    /// A failed attempt was absorbed by the retry policy
    TaskRetrying {
        id: String,
        attempt: u32,
        delay_ms: u64,
    },
    /// The single completion notification for a managed task
    TaskCompleted {
        id: String,
        result: TaskResult,
        attempts: u32,
    },
    TaskRemoved {
        id: String,
    },
    PipelineStepStarted {
        pipeline: String,
        step: String,
    },
    PipelineStepFinished {
        pipeline: String,
        step: String,
        result: Option<TaskResult>,
    },
    PipelineCompleted {
        pipeline: String,
        success: bool,
    },
}

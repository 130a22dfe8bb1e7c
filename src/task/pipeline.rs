//! Multi-step task workflows
//!
//! A [`Pipeline`] is an ordered list of steps, each of which may create a
//! task from the shared context and the results so far. Steps run
//! sequentially, each to completion on its designated [`TaskManager`],
//! so different steps can draw from different concurrency pools (e.g. a
//! download pool and a post-processing pool).
//!
//! A step creator returning `None` skips the step. A failed or cancelled
//! step aborts the pipeline unless the step opts into
//! `continue_on_fail`/`continue_on_cancel`, in which case a `None` result
//! is recorded and the chain proceeds. Definitions are reusable:
//! [`start`](Pipeline::start) yields an independent execution each time.

use crate::events::{EngineEvent, EVENT_CHANNEL_CAPACITY};
use crate::task::manager::TaskManager;
use crate::task::{task_id, Task, TaskResult};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

/// What a step creator sees: the shared context plus everything earlier
/// steps produced.
pub struct StepContext<'a, C> {
    pub context: &'a C,
    /// Result of the most recent non-skipped step, if it produced one
    pub previous: Option<&'a TaskResult>,
    /// Outcomes of all earlier steps, in order
    pub results: &'a [StepOutcome],
}

type Creator<C> = Arc<dyn Fn(StepContext<'_, C>) -> Option<Box<dyn Task>> + Send + Sync>;
type Reducer<C> = Arc<dyn Fn(&C, &[StepOutcome]) -> serde_json::Value + Send + Sync>;
type StatusHook<C> = Arc<dyn Fn(&C, &PipelineStatus, &[StepOutcome]) -> String + Send + Sync>;

/// One step of a pipeline definition.
pub struct Step<C> {
    name: String,
    manager: Arc<TaskManager>,
    creator: Creator<C>,
    priority: i32,
    continue_on_fail: bool,
    continue_on_cancel: bool,
}

impl<C> Step<C> {
    pub fn new<F>(name: impl Into<String>, manager: Arc<TaskManager>, creator: F) -> Self
    where
        F: Fn(StepContext<'_, C>) -> Option<Box<dyn Task>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            manager,
            creator: Arc::new(creator),
            priority: 0,
            continue_on_fail: false,
            continue_on_cancel: false,
        }
    }

    /// Priority the step's task is queued with
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// A failed step records `None` and the chain proceeds
    pub fn continue_on_fail(mut self) -> Self {
        self.continue_on_fail = true;
        self
    }

    /// A cancelled step records `None` and the chain proceeds
    pub fn continue_on_cancel(mut self) -> Self {
        self.continue_on_cancel = true;
        self
    }
}

impl<C> Clone for Step<C> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            manager: Arc::clone(&self.manager),
            creator: Arc::clone(&self.creator),
            priority: self.priority,
            continue_on_fail: self.continue_on_fail,
            continue_on_cancel: self.continue_on_cancel,
        }
    }
}

/// Recorded result of one step. `result` is `None` when the step was
/// skipped, or when it was absorbed by a continue-on policy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepOutcome {
    pub step: String,
    pub result: Option<TaskResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PipelineStatus {
    Completed,
    Failed { step: String },
    Cancelled { step: String },
}

impl PipelineStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Final outcome of one pipeline execution.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    pub status: PipelineStatus,
    /// Reduced domain result; present only when the pipeline completed
    pub value: Option<serde_json::Value>,
    pub steps: Vec<StepOutcome>,
    /// Rendered status message, when the definition provides a hook
    pub message: Option<String>,
}

/// A reusable workflow definition.
pub struct Pipeline<C> {
    name: String,
    steps: Vec<Step<C>>,
    reducer: Option<Reducer<C>>,
    status_message: Option<StatusHook<C>>,
    events: broadcast::Sender<EngineEvent>,
}

impl<C> Pipeline<C> {
    pub fn builder(name: impl Into<String>) -> PipelineBuilder<C> {
        PipelineBuilder {
            name: name.into(),
            steps: Vec::new(),
            reducer: None,
            status_message: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}

pub struct PipelineBuilder<C> {
    name: String,
    steps: Vec<Step<C>>,
    reducer: Option<Reducer<C>>,
    status_message: Option<StatusHook<C>>,
}

impl<C> PipelineBuilder<C> {
    pub fn step(mut self, step: Step<C>) -> Self {
        self.steps.push(step);
        self
    }

    /// Fold the captured step results into the pipeline's domain result
    pub fn reduce_results<F>(mut self, reducer: F) -> Self
    where
        F: Fn(&C, &[StepOutcome]) -> serde_json::Value + Send + Sync + 'static,
    {
        self.reducer = Some(Arc::new(reducer));
        self
    }

    /// Render a human-readable status line for the final outcome
    pub fn status_message<F>(mut self, hook: F) -> Self
    where
        F: Fn(&C, &PipelineStatus, &[StepOutcome]) -> String + Send + Sync + 'static,
    {
        self.status_message = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> Pipeline<C> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Pipeline {
            name: self.name,
            steps: self.steps,
            reducer: self.reducer,
            status_message: self.status_message,
            events,
        }
    }
}

/// Handle to one running (or finished) pipeline execution.
pub struct PipelineExecution {
    id: String,
    outcome_rx: watch::Receiver<Option<PipelineOutcome>>,
    token: CancellationToken,
}

impl PipelineExecution {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Cancel the execution; the currently running step's task is
    /// cancelled through its manager.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub async fn await_outcome(&self) -> PipelineOutcome {
        let mut rx = self.outcome_rx.clone();
        loop {
            if let Some(outcome) = rx.borrow().clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return PipelineOutcome {
                    status: PipelineStatus::Cancelled { step: String::new() },
                    value: None,
                    steps: Vec::new(),
                    message: None,
                };
            }
        }
    }

    pub fn outcome(&self) -> Option<PipelineOutcome> {
        self.outcome_rx.borrow().clone()
    }
}

impl<C: Send + Sync + 'static> Pipeline<C> {
    /// Start an independent execution over `context`.
    pub fn start(&self, context: C) -> PipelineExecution {
        let id = task_id("pipeline");
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let token = CancellationToken::new();

        let steps = self.steps.clone();
        let reducer = self.reducer.clone();
        let status_message = self.status_message.clone();
        let events = self.events.clone();
        let exec_id = id.clone();
        let exec_token = token.clone();
        tracing::info!(pipeline = %self.name, execution = %id, steps = steps.len(), "pipeline started");

        tokio::spawn(async move {
            let outcome = run_pipeline(
                context,
                steps,
                reducer,
                status_message,
                &events,
                &exec_id,
                exec_token,
            )
            .await;
            let _ = events.send(EngineEvent::PipelineCompleted {
                pipeline: exec_id,
                success: outcome.status.is_success(),
            });
            let _ = outcome_tx.send(Some(outcome));
        });

        PipelineExecution {
            id,
            outcome_rx,
            token,
        }
    }
}

async fn run_pipeline<C>(
    context: C,
    steps: Vec<Step<C>>,
    reducer: Option<Reducer<C>>,
    status_message: Option<StatusHook<C>>,
    events: &broadcast::Sender<EngineEvent>,
    exec_id: &str,
    token: CancellationToken,
) -> PipelineOutcome {
    let mut outcomes: Vec<StepOutcome> = Vec::new();
    let mut previous: Option<TaskResult> = None;
    let mut status = PipelineStatus::Completed;

    for step in &steps {
        if token.is_cancelled() {
            status = PipelineStatus::Cancelled {
                step: step.name.clone(),
            };
            break;
        }
        let _ = events.send(EngineEvent::PipelineStepStarted {
            pipeline: exec_id.to_string(),
            step: step.name.clone(),
        });

        let task = (step.creator)(StepContext {
            context: &context,
            previous: previous.as_ref(),
            results: &outcomes,
        });
        let Some(task) = task else {
            tracing::debug!(step = %step.name, "step skipped");
            outcomes.push(StepOutcome {
                step: step.name.clone(),
                result: None,
            });
            let _ = events.send(EngineEvent::PipelineStepFinished {
                pipeline: exec_id.to_string(),
                step: step.name.clone(),
                result: None,
            });
            previous = None;
            continue;
        };

        let task_id = step.manager.add(task, step.priority);
        let completion = tokio::select! {
            biased;
            _ = token.cancelled() => {
                let _ = step.manager.cancel_task(&task_id);
                step.manager.await_task(&task_id).await
            }
            completion = step.manager.await_task(&task_id) => completion,
        };
        let result = match completion {
            Ok(completion) => completion.result,
            Err(err) => TaskResult::failed(format!("manager dropped the task: {}", err)),
        };

        let _ = events.send(EngineEvent::PipelineStepFinished {
            pipeline: exec_id.to_string(),
            step: step.name.clone(),
            result: Some(result.clone()),
        });

        match &result {
            TaskResult::Success { .. } => {
                outcomes.push(StepOutcome {
                    step: step.name.clone(),
                    result: Some(result.clone()),
                });
                previous = Some(result);
            }
            TaskResult::Failed { .. } if step.continue_on_fail => {
                tracing::debug!(step = %step.name, "step failed, continuing");
                outcomes.push(StepOutcome {
                    step: step.name.clone(),
                    result: Some(result),
                });
                previous = None;
            }
            TaskResult::Cancelled if step.continue_on_cancel => {
                outcomes.push(StepOutcome {
                    step: step.name.clone(),
                    result: Some(result),
                });
                previous = None;
            }
            TaskResult::Failed { .. } => {
                outcomes.push(StepOutcome {
                    step: step.name.clone(),
                    result: Some(result),
                });
                status = PipelineStatus::Failed {
                    step: step.name.clone(),
                };
                break;
            }
            TaskResult::Cancelled => {
                outcomes.push(StepOutcome {
                    step: step.name.clone(),
                    result: Some(result),
                });
                status = PipelineStatus::Cancelled {
                    step: step.name.clone(),
                };
                break;
            }
        }
    }

    let value = match (&status, &reducer) {
        (PipelineStatus::Completed, Some(reduce)) => Some(reduce(&context, &outcomes)),
        _ => None,
    };
    let message = status_message
        .as_ref()
        .map(|hook| hook(&context, &status, &outcomes));
    if let Some(message) = &message {
        tracing::info!(execution = exec_id, %message, "pipeline finished");
    }

    PipelineOutcome {
        status,
        value,
        steps: outcomes,
        message,
    }
}

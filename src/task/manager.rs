//! Priority-based task scheduling
//!
//! A [`TaskManager`] owns a set of tasks and decides which of them run:
//! highest priority first, insertion order breaking ties, never more than
//! the concurrency limit at once (except by [`force_start`]). Failed
//! attempts are retried automatically under the manager's shared
//! [`RetryPolicy`]; a task completes exactly once, and its `cleanup` hook
//! runs on final failure or cancellation.
//!
//! [`force_start`]: TaskManager::force_start

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EVENT_CHANNEL_CAPACITY};
use crate::retry::RetryPolicy;
use crate::task::{PauseKind, Task, TaskResult, TaskState};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

/// Final outcome of a managed task, including how many attempts it took.
#[derive(Debug, Clone)]
pub struct TaskCompletion {
    pub id: String,
    pub result: TaskResult,
    pub attempts: u32,
}

/// Point-in-time view of one managed task
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub id: String,
    pub task_type: String,
    pub state: TaskState,
    pub priority: i32,
    pub position: u64,
    pub attempts: u32,
}

/// Where a task sits in the manager's scheduling lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for a slot
    Pending,
    /// Occupying a slot
    Running,
    /// Backoff timer pending after a failed attempt
    AwaitingRetry,
    /// Held out of scheduling; auto-paused tasks may be reclaimed
    Paused,
    /// Completed; result available
    Finished,
}

struct ManagedTask {
    task: Arc<dyn Task>,
    priority: i32,
    position: u64,
    /// Failed attempts so far; also the epoch for stale-timer detection
    attempts: u32,
    failures: Vec<String>,
    phase: Phase,
    pause_kind: Option<PauseKind>,
    /// An attempt has been started and its watcher has not yet reported
    attempt_in_flight: bool,
    completion_tx: watch::Sender<Option<TaskCompletion>>,
    completion_rx: watch::Receiver<Option<TaskCompletion>>,
}

struct ManagerInner {
    tasks: HashMap<String, ManagedTask>,
    next_position: u64,
}

/// Schedules tasks by priority under a concurrency limit.
pub struct TaskManager {
    inner: Mutex<ManagerInner>,
    events: broadcast::Sender<EngineEvent>,
    limit: usize,
    retry: RetryPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartMode {
    /// Begin a fresh attempt and watch it
    Start,
    /// Wake a paused attempt; its watcher is still alive
    Resume,
}

impl TaskManager {
    pub fn new(max_concurrent: usize, retry: RetryPolicy) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            inner: Mutex::new(ManagerInner {
                tasks: HashMap::new(),
                next_position: 0,
            }),
            events,
            limit: max_concurrent.max(1),
            retry,
        })
    }

    pub fn from_config(config: &EngineConfig) -> Arc<Self> {
        Self::new(config.max_concurrent_tasks, config.task_retry)
    }

    /// Subscribe to manager events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Add a task and schedule it. Returns the task's id.
    pub fn add(self: &Arc<Self>, task: Box<dyn Task>, priority: i32) -> String {
        let task: Arc<dyn Task> = Arc::from(task);
        let id = task.id().to_string();
        let (completion_tx, completion_rx) = watch::channel(None);
        {
            let mut inner = self.inner.lock();
            let position = inner.next_position;
            inner.next_position += 1;
            inner.tasks.insert(
                id.clone(),
                ManagedTask {
                    task: Arc::clone(&task),
                    priority,
                    position,
                    attempts: 0,
                    failures: Vec::new(),
                    phase: Phase::Pending,
                    pause_kind: None,
                    attempt_in_flight: false,
                    completion_tx,
                    completion_rx,
                },
            );
        }
        self.emit(EngineEvent::TaskAdded {
            id: id.clone(),
            task_type: task.task_type().to_string(),
            priority,
        });
        self.schedule();
        id
    }

    /// Wait for a task's single completion notification.
    pub async fn await_task(&self, id: &str) -> Result<TaskCompletion> {
        let mut rx = {
            let inner = self.inner.lock();
            inner
                .tasks
                .get(id)
                .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?
                .completion_rx
                .clone()
        };
        loop {
            if let Some(completion) = rx.borrow().clone() {
                return Ok(completion);
            }
            if rx.changed().await.is_err() {
                return Err(EngineError::Shutdown);
            }
        }
    }

    /// Pause a task. Auto-paused tasks may be restarted by the scheduler
    /// when capacity frees up; manually paused ones wait for
    /// [`resume_task`](Self::resume_task).
    pub fn pause_task(self: &Arc<Self>, id: &str, kind: PauseKind) -> Result<()> {
        let action = {
            let mut inner = self.inner.lock();
            let entry = inner
                .tasks
                .get_mut(id)
                .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;
            match entry.phase {
                Phase::Finished => None,
                Phase::Running => {
                    entry.phase = Phase::Paused;
                    entry.pause_kind = Some(kind);
                    Some(Arc::clone(&entry.task))
                }
                Phase::Pending | Phase::AwaitingRetry | Phase::Paused => {
                    entry.phase = Phase::Paused;
                    entry.pause_kind = Some(kind);
                    None
                }
            }
        };
        if let Some(task) = action {
            task.pause(kind)?;
            self.emit(EngineEvent::TaskStateChanged {
                id: id.to_string(),
                state: task.status(),
            });
        }
        self.schedule();
        Ok(())
    }

    /// Return a paused task to the queue.
    pub fn resume_task(self: &Arc<Self>, id: &str) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            let entry = inner
                .tasks
                .get_mut(id)
                .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;
            if entry.phase == Phase::Paused {
                entry.phase = Phase::Pending;
                entry.pause_kind = None;
            }
        }
        self.schedule();
        Ok(())
    }

    /// Cancel a task. The completion notification fires with `Cancelled`.
    pub fn cancel_task(self: &Arc<Self>, id: &str) -> Result<()> {
        let (task, finalize_now) = {
            let mut inner = self.inner.lock();
            let entry = inner
                .tasks
                .get_mut(id)
                .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;
            if entry.phase == Phase::Finished {
                return Ok(());
            }
            // With an attempt in flight, its watcher delivers the
            // cancellation; otherwise nothing will, so finalize here
            (Arc::clone(&entry.task), !entry.attempt_in_flight)
        };
        let _ = task.cancel();
        if finalize_now {
            self.finalize(id, TaskResult::Cancelled, true);
        }
        Ok(())
    }

    /// Start a task immediately, ignoring the concurrency limit.
    pub fn force_start(self: &Arc<Self>, id: &str) -> Result<()> {
        let launch = {
            let mut inner = self.inner.lock();
            let entry = inner
                .tasks
                .get_mut(id)
                .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;
            match entry.phase {
                Phase::Running | Phase::Finished => None,
                _ => {
                    entry.phase = Phase::Running;
                    entry.pause_kind = None;
                    let mode = if entry.attempt_in_flight {
                        StartMode::Resume
                    } else {
                        entry.attempt_in_flight = true;
                        StartMode::Start
                    };
                    Some((Arc::clone(&entry.task), mode))
                }
            }
        };
        if let Some((task, mode)) = launch {
            tracing::info!(id, "force starting task");
            self.launch(id.to_string(), task, mode);
        }
        Ok(())
    }

    /// Change a task's priority. Affects future scheduling decisions only.
    pub fn set_priority(self: &Arc<Self>, id: &str, priority: i32) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            let entry = inner
                .tasks
                .get_mut(id)
                .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;
            entry.priority = priority;
        }
        self.schedule();
        Ok(())
    }

    /// Move a task to `index` within the position ordering.
    pub fn set_position(self: &Arc<Self>, id: &str, index: usize) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if !inner.tasks.contains_key(id) {
                return Err(EngineError::TaskNotFound(id.to_string()));
            }
            let mut order: Vec<(String, u64)> = inner
                .tasks
                .iter()
                .filter(|(_, t)| t.phase != Phase::Finished)
                .map(|(tid, t)| (tid.clone(), t.position))
                .collect();
            order.sort_by_key(|(_, position)| *position);
            let mut order: Vec<String> = order.into_iter().map(|(tid, _)| tid).collect();
            order.retain(|tid| tid != id);
            let index = index.min(order.len());
            order.insert(index, id.to_string());
            for (i, tid) in order.iter().enumerate() {
                if let Some(entry) = inner.tasks.get_mut(tid) {
                    entry.position = i as u64;
                }
            }
            inner.next_position = order.len() as u64;
        }
        self.schedule();
        Ok(())
    }

    /// Shift a task by `delta` places within the position ordering.
    pub fn shift(self: &Arc<Self>, id: &str, delta: i64) -> Result<()> {
        let index = {
            let inner = self.inner.lock();
            let mut order: Vec<(&String, u64)> = inner
                .tasks
                .iter()
                .filter(|(_, t)| t.phase != Phase::Finished)
                .map(|(tid, t)| (tid, t.position))
                .collect();
            order.sort_by_key(|(_, position)| *position);
            let current = order
                .iter()
                .position(|(tid, _)| tid.as_str() == id)
                .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;
            (current as i64 + delta).max(0) as usize
        };
        self.set_position(id, index)
    }

    /// The task's effective state, as the scheduler sees it
    pub fn task_state(&self, id: &str) -> Option<TaskState> {
        let inner = self.inner.lock();
        inner.tasks.get(id).map(effective_state)
    }

    /// Snapshot of all managed tasks, in position order
    pub fn snapshot(&self) -> Vec<TaskSnapshot> {
        let inner = self.inner.lock();
        let mut snapshots: Vec<TaskSnapshot> = inner
            .tasks
            .iter()
            .map(|(id, entry)| TaskSnapshot {
                id: id.clone(),
                task_type: entry.task.task_type().to_string(),
                state: effective_state(entry),
                priority: entry.priority,
                position: entry.position,
                attempts: entry.attempts,
            })
            .collect();
        snapshots.sort_by_key(|s| s.position);
        snapshots
    }

    /// Number of tasks currently holding a slot
    pub fn running_count(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .tasks
            .values()
            .filter(|t| t.phase == Phase::Running)
            .count()
    }

    /// Drop a finished task from the manager.
    pub fn remove(&self, id: &str) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            let entry = inner
                .tasks
                .get(id)
                .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;
            if entry.phase != Phase::Finished {
                return Err(EngineError::invalid_input(
                    "id",
                    "task is still active; cancel it first",
                ));
            }
            inner.tasks.remove(id);
        }
        self.emit(EngineEvent::TaskRemoved { id: id.to_string() });
        Ok(())
    }

    /// Fill free slots with the best pending (or reclaimable auto-paused)
    /// tasks: priority descending, position ascending.
    fn schedule(self: &Arc<Self>) {
        let mut launches: Vec<(String, Arc<dyn Task>, StartMode)> = Vec::new();
        {
            let mut inner = self.inner.lock();
            loop {
                let running = inner
                    .tasks
                    .values()
                    .filter(|t| t.phase == Phase::Running)
                    .count();
                if running >= self.limit {
                    break;
                }
                let Some(id) = pick_next(&inner) else { break };
                let Some(entry) = inner.tasks.get_mut(&id) else { break };
                entry.phase = Phase::Running;
                entry.pause_kind = None;
                let mode = if entry.attempt_in_flight {
                    StartMode::Resume
                } else {
                    entry.attempt_in_flight = true;
                    StartMode::Start
                };
                launches.push((id, Arc::clone(&entry.task), mode));
            }
        }
        for (id, task, mode) in launches {
            self.launch(id, task, mode);
        }
    }

    fn launch(self: &Arc<Self>, id: String, task: Arc<dyn Task>, mode: StartMode) {
        match mode {
            StartMode::Start => {
                if let Err(err) = task.start() {
                    tracing::error!(id, %err, "task failed to start");
                    {
                        let mut inner = self.inner.lock();
                        if let Some(entry) = inner.tasks.get_mut(&id) {
                            entry.attempt_in_flight = false;
                        }
                    }
                    self.finalize(&id, TaskResult::failed(err.to_string()), true);
                    return;
                }
                self.spawn_watch(id.clone(), task.clone());
            }
            StartMode::Resume => {
                let _ = task.resume();
            }
        }
        self.emit(EngineEvent::TaskStateChanged {
            id,
            state: task.status(),
        });
    }

    /// Watch one attempt to completion, emitting periodic progress.
    fn spawn_watch(self: &Arc<Self>, id: String, task: Arc<dyn Task>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let result = task.await_result();
            tokio::pin!(result);
            let mut ticker = tokio::time::interval(Duration::from_millis(500));
            loop {
                tokio::select! {
                    result = &mut result => {
                        if let Some(manager) = weak.upgrade() {
                            manager.on_attempt_done(&id, result);
                        }
                        break;
                    }
                    _ = ticker.tick() => {
                        let Some(manager) = weak.upgrade() else { break };
                        if task.status() == TaskState::Running {
                            if let Some(progress) = task.progress() {
                                manager.emit(EngineEvent::TaskProgress {
                                    id: id.clone(),
                                    progress,
                                });
                            }
                        }
                    }
                }
            }
        });
    }

    fn on_attempt_done(self: &Arc<Self>, id: &str, result: TaskResult) {
        enum Next {
            Final(TaskResult, bool),
            Retry(Duration, u32),
        }

        let next = {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.tasks.get_mut(id) else { return };
            entry.attempt_in_flight = false;
            if entry.phase == Phase::Finished {
                return;
            }
            match result {
                TaskResult::Success { .. } => Next::Final(result, false),
                TaskResult::Cancelled => Next::Final(result, true),
                TaskResult::Failed { ref message } => {
                    entry.failures.push(message.clone());
                    let retry_index = entry.attempts;
                    entry.attempts += 1;
                    if self.retry.allows_retry(retry_index) {
                        entry.phase = Phase::AwaitingRetry;
                        Next::Retry(self.retry.delay_for_attempt(retry_index), entry.attempts)
                    } else {
                        Next::Final(result, true)
                    }
                }
            }
        };

        match next {
            Next::Final(result, cleanup) => self.finalize(id, result, cleanup),
            Next::Retry(delay, epoch) => {
                tracing::debug!(
                    id,
                    attempt = epoch,
                    delay_ms = delay.as_millis() as u64,
                    "task attempt failed, retry scheduled"
                );
                self.emit(EngineEvent::TaskRetrying {
                    id: id.to_string(),
                    attempt: epoch,
                    delay_ms: delay.as_millis() as u64,
                });
                self.emit(EngineEvent::TaskStateChanged {
                    id: id.to_string(),
                    state: TaskState::AwaitingRetry,
                });
                let weak = Arc::downgrade(self);
                let id = id.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(manager) = weak.upgrade() {
                        manager.retry_due(&id, epoch);
                    }
                });
                self.schedule();
            }
        }
    }

    fn retry_due(self: &Arc<Self>, id: &str, epoch: u32) {
        {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.tasks.get_mut(id) else { return };
            // A pause or cancel in the meantime invalidates the timer
            if entry.phase != Phase::AwaitingRetry || entry.attempts != epoch {
                return;
            }
            entry.phase = Phase::Pending;
        }
        self.schedule();
    }

    /// Record the single completion, run cleanup when warranted, backfill.
    fn finalize(self: &Arc<Self>, id: &str, result: TaskResult, cleanup: bool) {
        let completed = {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.tasks.get_mut(id) else { return };
            if entry.phase == Phase::Finished {
                return;
            }
            entry.phase = Phase::Finished;
            let attempts = match result {
                // The last failure is already counted
                TaskResult::Failed { .. } => entry.attempts,
                _ => entry.attempts + 1,
            };
            let completion = TaskCompletion {
                id: id.to_string(),
                result: result.clone(),
                attempts,
            };
            entry.completion_tx.send_if_modified(|slot| {
                if slot.is_none() {
                    *slot = Some(completion.clone());
                    true
                } else {
                    false
                }
            });
            let task = if cleanup { Some(Arc::clone(&entry.task)) } else { None };
            (completion, task)
        };
        let (completion, cleanup_task) = completed;

        tracing::info!(
            id,
            attempts = completion.attempts,
            outcome = ?completion.result,
            "task completed"
        );
        self.emit(EngineEvent::TaskStateChanged {
            id: id.to_string(),
            state: match completion.result {
                TaskResult::Success { .. } => TaskState::Success,
                TaskResult::Failed { .. } => TaskState::Failed,
                TaskResult::Cancelled => TaskState::Cancelled,
            },
        });
        self.emit(EngineEvent::TaskCompleted {
            id: completion.id.clone(),
            result: completion.result.clone(),
            attempts: completion.attempts,
        });
        if let Some(task) = cleanup_task {
            tokio::spawn(async move { task.cleanup().await });
        }
        self.schedule();
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }
}

/// The best startable task: priority descending, then position ascending.
/// Pending tasks and auto-paused tasks are startable; manual pauses are not.
fn pick_next(inner: &ManagerInner) -> Option<String> {
    inner
        .tasks
        .iter()
        .filter(|(_, t)| {
            t.phase == Phase::Pending
                || (t.phase == Phase::Paused && t.pause_kind == Some(PauseKind::Auto))
        })
        .min_by_key(|(_, t)| (std::cmp::Reverse(t.priority), t.position))
        .map(|(id, _)| id.clone())
}

fn effective_state(entry: &ManagedTask) -> TaskState {
    match entry.phase {
        Phase::Pending => TaskState::Idle,
        Phase::AwaitingRetry => TaskState::AwaitingRetry,
        Phase::Paused => TaskState::Paused,
        Phase::Running => entry.task.status(),
        Phase::Finished => match entry.completion_rx.borrow().as_ref() {
            Some(c) => match c.result {
                TaskResult::Success { .. } => TaskState::Success,
                TaskResult::Failed { .. } => TaskState::Failed,
                TaskResult::Cancelled => TaskState::Cancelled,
            },
            None => entry.task.status(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Notify;

    /// Scripted task: each `start` pops the next scripted result and
    /// delivers it after `delay`; `complete` delivers one on demand.
    struct StubTask {
        id: String,
        state: Mutex<TaskState>,
        starts: AtomicU32,
        scripted: Mutex<VecDeque<TaskResult>>,
        delivered: Mutex<VecDeque<TaskResult>>,
        notify: Arc<Notify>,
        delay: Duration,
    }

    impl StubTask {
        fn manual(id: &str) -> Arc<Self> {
            Self::scripted(id, vec![], Duration::from_millis(0))
        }

        fn scripted(id: &str, results: Vec<TaskResult>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                state: Mutex::new(TaskState::Idle),
                starts: AtomicU32::new(0),
                scripted: Mutex::new(results.into()),
                delivered: Mutex::new(VecDeque::new()),
                notify: Arc::new(Notify::new()),
                delay,
            })
        }

        fn complete(&self, result: TaskResult) {
            self.delivered.lock().push_back(result);
            self.notify.notify_one();
        }

        fn start_count(&self) -> u32 {
            self.starts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Task for Arc<StubTask> {
        fn id(&self) -> &str {
            &self.id
        }

        fn task_type(&self) -> &'static str {
            "stub"
        }

        fn status(&self) -> TaskState {
            *self.state.lock()
        }

        fn start(&self) -> crate::error::Result<()> {
            *self.state.lock() = TaskState::Running;
            self.starts.fetch_add(1, Ordering::SeqCst);
            if let Some(result) = self.scripted.lock().pop_front() {
                let this = Arc::clone(self);
                let delay = self.delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    this.complete(result);
                });
            }
            Ok(())
        }

        fn pause(&self, _kind: PauseKind) -> crate::error::Result<()> {
            *self.state.lock() = TaskState::Paused;
            Ok(())
        }

        fn resume(&self) -> crate::error::Result<()> {
            *self.state.lock() = TaskState::Running;
            Ok(())
        }

        fn cancel(&self) -> crate::error::Result<()> {
            self.complete(TaskResult::Cancelled);
            Ok(())
        }

        async fn await_result(&self) -> TaskResult {
            loop {
                if let Some(result) = self.delivered.lock().pop_front() {
                    *self.state.lock() = match result {
                        TaskResult::Success { .. } => TaskState::Success,
                        TaskResult::Failed { .. } => TaskState::Failed,
                        TaskResult::Cancelled => TaskState::Cancelled,
                    };
                    return result;
                }
                self.notify.notified().await;
            }
        }
    }

    async fn wait_for(mut check: impl FnMut() -> bool, what: &str) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    fn ok() -> TaskResult {
        TaskResult::success(serde_json::json!(null))
    }

    #[tokio::test]
    async fn test_concurrency_limit_and_backfill() {
        let manager = TaskManager::new(2, RetryPolicy::none());
        let tasks: Vec<Arc<StubTask>> =
            (0..5).map(|i| StubTask::manual(&format!("t{}", i))).collect();
        for task in &tasks {
            manager.add(Box::new(Arc::clone(task)), 0);
        }
        assert_eq!(manager.running_count(), 2);
        assert_eq!(tasks[0].start_count(), 1);
        assert_eq!(tasks[1].start_count(), 1);
        assert_eq!(tasks[2].start_count(), 0);

        tasks[0].complete(ok());
        wait_for(|| tasks[2].start_count() == 1, "backfill after completion").await;
        assert_eq!(manager.running_count(), 2);

        tasks[1].complete(ok());
        tasks[2].complete(ok());
        wait_for(|| tasks[4].start_count() == 1, "remaining tasks scheduled").await;
    }

    #[tokio::test]
    async fn test_priority_beats_position() {
        let manager = TaskManager::new(1, RetryPolicy::none());
        let first = StubTask::manual("first");
        let low = StubTask::manual("low");
        let high = StubTask::manual("high");
        manager.add(Box::new(Arc::clone(&first)), 0);
        manager.add(Box::new(Arc::clone(&low)), 0);
        manager.add(Box::new(Arc::clone(&high)), 5);

        first.complete(ok());
        wait_for(|| high.start_count() == 1, "high priority scheduled").await;
        assert_eq!(low.start_count(), 0);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let manager = TaskManager::new(1, RetryPolicy::new(3, 10, 2.0, 50));
        let task = StubTask::scripted(
            "flaky",
            vec![
                TaskResult::failed("one"),
                TaskResult::failed("two"),
                ok(),
            ],
            Duration::from_millis(5),
        );
        let id = manager.add(Box::new(Arc::clone(&task)), 0);

        let completion = manager.await_task(&id).await.unwrap();
        assert!(completion.result.is_success());
        assert_eq!(completion.attempts, 3);
        assert_eq!(task.start_count(), 3);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_fails_once() {
        let manager = TaskManager::new(1, RetryPolicy::new(1, 10, 2.0, 50));
        let task = StubTask::scripted(
            "doomed",
            vec![TaskResult::failed("a"), TaskResult::failed("b")],
            Duration::from_millis(5),
        );
        let id = manager.add(Box::new(Arc::clone(&task)), 0);

        let completion = manager.await_task(&id).await.unwrap();
        assert!(matches!(completion.result, TaskResult::Failed { .. }));
        assert_eq!(completion.attempts, 2);
        assert_eq!(manager.task_state(&id), Some(TaskState::Failed));
    }

    #[tokio::test]
    async fn test_force_start_bypasses_limit() {
        let manager = TaskManager::new(1, RetryPolicy::none());
        let a = StubTask::manual("a");
        let b = StubTask::manual("b");
        manager.add(Box::new(Arc::clone(&a)), 0);
        let id_b = manager.add(Box::new(Arc::clone(&b)), 0);
        assert_eq!(manager.running_count(), 1);

        manager.force_start(&id_b).unwrap();
        assert_eq!(manager.running_count(), 2);
        assert_eq!(b.start_count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_pending_task() {
        let manager = TaskManager::new(1, RetryPolicy::none());
        let a = StubTask::manual("a");
        let b = StubTask::manual("b");
        manager.add(Box::new(Arc::clone(&a)), 0);
        let id_b = manager.add(Box::new(Arc::clone(&b)), 0);

        manager.cancel_task(&id_b).unwrap();
        let completion = manager.await_task(&id_b).await.unwrap();
        assert_eq!(completion.result, TaskResult::Cancelled);
        assert_eq!(b.start_count(), 0);
        assert_eq!(manager.running_count(), 1);
    }

    #[tokio::test]
    async fn test_auto_pause_reclaimed_manual_not() {
        let manager = TaskManager::new(1, RetryPolicy::none());
        let a = StubTask::manual("a");
        let id_a = manager.add(Box::new(Arc::clone(&a)), 0);
        assert_eq!(a.start_count(), 1);

        manager.pause_task(&id_a, PauseKind::Manual).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Manually paused: free capacity must not resume it
        assert_eq!(manager.task_state(&id_a), Some(TaskState::Paused));

        manager.pause_task(&id_a, PauseKind::Auto).unwrap();
        wait_for(
            || manager.task_state(&id_a) == Some(TaskState::Running),
            "auto-paused task reclaimed",
        )
        .await;
    }

    #[tokio::test]
    async fn test_position_reordering() {
        let manager = TaskManager::new(1, RetryPolicy::none());
        let running = StubTask::manual("running");
        let second = StubTask::manual("second");
        let third = StubTask::manual("third");
        manager.add(Box::new(Arc::clone(&running)), 0);
        manager.add(Box::new(Arc::clone(&second)), 0);
        let id_third = manager.add(Box::new(Arc::clone(&third)), 0);

        // Move the last task to the front of the queue
        manager.set_position(&id_third, 0).unwrap();
        running.complete(ok());
        wait_for(|| third.start_count() == 1, "repositioned task scheduled").await;
        assert_eq!(second.start_count(), 0);
    }

    #[tokio::test]
    async fn test_completion_event_emitted_once() {
        let manager = TaskManager::new(1, RetryPolicy::none());
        let mut events = manager.subscribe();
        let task = StubTask::scripted("once", vec![ok()], Duration::from_millis(5));
        let id = manager.add(Box::new(Arc::clone(&task)), 0);
        manager.await_task(&id).await.unwrap();

        let mut completed = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, EngineEvent::TaskCompleted { .. }) {
                completed += 1;
            }
        }
        assert_eq!(completed, 1);
    }
}

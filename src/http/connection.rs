//! Download connection state machine
//!
//! A [`DownloadConnection`] performs one logical HTTP transfer, optionally
//! restricted to a byte sub-range of the resource, streaming the body into
//! the destination file at the range's offset. The lifecycle is a state
//! machine:
//!
//! ```text
//! idle -> starting -> downloading -> completing -> success
//!                |             \-> pausing -> paused -> (resume) -> starting
//!                |             \-> cancelling -> cancelled
//!                \-> awaiting_retry -> (timer) -> starting
//!                \-> failed
//! ```
//!
//! All lifecycle transitions go through the machine's serialized dispatch;
//! byte counters and the speed window live in a shared struct updated by
//! the streaming task directly. The in-flight body read is cancelled
//! cooperatively: pause and cancel trip a token, and the state settles only
//! after the reader has acknowledged by halting.

use crate::error::{EngineError, FailureReason, Result};
use crate::fsm::{
    action_channel, ActionSender, ActionTag, HandlerArgs, Machine, MachineBuilder, StateChange,
    StateTag,
};
use crate::http::probe::{parse_content_range, range_header};
use crate::http::{ByteRange, ResolutionPolicy, ResolveTrigger, UrlSource};
use crate::progress::{ProgressSnapshot, SpeedWindow};
use crate::retry::RetryPolicy;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

/// Connection state tags
pub mod states {
    pub const IDLE: &str = "idle";
    pub const STARTING: &str = "starting";
    pub const DOWNLOADING: &str = "downloading";
    pub const PAUSING: &str = "pausing";
    pub const PAUSED: &str = "paused";
    pub const CANCELLING: &str = "cancelling";
    pub const CANCELLED: &str = "cancelled";
    pub const COMPLETING: &str = "completing";
    pub const SUCCESS: &str = "success";
    pub const AWAITING_RETRY: &str = "awaiting_retry";
    pub const FAILED: &str = "failed";

    /// Whether a connection state is terminal
    pub fn is_terminal(state: &str) -> bool {
        matches!(state, SUCCESS | CANCELLED | FAILED)
    }
}

const ACT_START: ActionTag = "start";
const ACT_FETCH_OK: ActionTag = "fetch_ok";
const ACT_FETCH_FAILED: ActionTag = "fetch_failed";
const ACT_STREAM_FINISHED: ActionTag = "stream_finished";
const ACT_STREAM_FAILED: ActionTag = "stream_failed";
const ACT_HALTED: ActionTag = "halted";
const ACT_FINALIZED: ActionTag = "finalized";
const ACT_PAUSE: ActionTag = "pause";
const ACT_RESUME: ActionTag = "resume";
const ACT_CANCEL: ActionTag = "cancel";
const ACT_RETRY_TIMER: ActionTag = "retry_timer";

/// Terminal outcome of a connection, produced exactly once
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionResult {
    Success,
    Cancelled,
    Failed {
        reason: FailureReason,
        message: String,
        /// The entity on the server no longer matches the bytes on disk;
        /// only a full restart by the owner can recover
        resource_changed: bool,
    },
}

/// Everything needed to construct a connection
#[derive(Debug, Clone)]
pub struct ConnectionSpec {
    pub url: UrlSource,
    pub resolution: ResolutionPolicy,
    /// Byte sub-range of the resource, `None` for the whole resource
    pub range: Option<ByteRange>,
    pub destination: PathBuf,
    pub headers: Vec<(String, String)>,
    pub user_agent: String,
    pub retry: RetryPolicy,
    /// ETag captured by the owner at download start, sent as `If-Match`
    /// when resuming with partial progress
    pub etag: Option<String>,
    /// Range support already detected by the owner's probe, if any
    pub range_support: Option<bool>,
}

/// Signals carried by mailbox actions
#[derive(Debug)]
enum ConnSignal {
    Failure {
        reason: FailureReason,
        message: String,
        /// Retrying cannot help: the resource changed upstream
        resource_changed: bool,
    },
    RetryTick {
        attempt: u32,
    },
}

impl ConnSignal {
    fn failure(reason: FailureReason, message: impl Into<String>) -> Option<Self> {
        Some(Self::Failure {
            reason,
            message: message.into(),
            resource_changed: false,
        })
    }

    fn resource_changed_failure(reason: FailureReason, message: impl Into<String>) -> Option<Self> {
        Some(Self::Failure {
            reason,
            message: message.into(),
            resource_changed: true,
        })
    }
}

/// Counters and caches shared between the machine and the streaming task
struct ConnShared {
    /// Cumulative bytes written for the current content version
    downloaded: AtomicU64,
    /// Total resource/range size once learned from the response
    total: Mutex<Option<u64>>,
    /// Detected range support; `None` until the first response is seen
    supports_range: Mutex<Option<bool>>,
    /// Cached resolver output
    resolved_url: Mutex<Option<String>>,
    speed: Mutex<SpeedWindow>,
}

/// Machine context, owned exclusively by the machine
struct ConnContext {
    client: Client,
    spec: ConnectionSpec,
    shared: Arc<ConnShared>,
    sender: ActionSender<ConnSignal>,
    result_tx: watch::Sender<Option<ConnectionResult>>,
    attempt_token: Option<CancellationToken>,
    /// Failed attempts so far (resets never; the budget is per connection)
    attempts: u32,
    started: bool,
}

/// One HTTP transfer of a byte range (or whole resource) into a file.
pub struct DownloadConnection {
    machine: Arc<Machine<ConnContext, ConnSignal>>,
    shared: Arc<ConnShared>,
    result_rx: watch::Receiver<Option<ConnectionResult>>,
    range: Option<ByteRange>,
}

impl DownloadConnection {
    /// Create a connection. It stays `idle` until [`start`](Self::start).
    pub fn new(client: Client, spec: ConnectionSpec) -> Arc<Self> {
        let shared = Arc::new(ConnShared {
            downloaded: AtomicU64::new(0),
            total: Mutex::new(spec.range.and_then(|r| r.len())),
            supports_range: Mutex::new(spec.range_support),
            resolved_url: Mutex::new(None),
            speed: Mutex::new(SpeedWindow::default()),
        });
        let (sender, inbox) = action_channel::<ConnSignal>();
        let (result_tx, result_rx) = watch::channel(None);
        let range = spec.range;

        let context = ConnContext {
            client,
            spec,
            shared: Arc::clone(&shared),
            sender,
            result_tx,
            attempt_token: None,
            attempts: 0,
            started: false,
        };

        let machine = Arc::new(build_machine(context));
        machine.serve(inbox);

        Arc::new(Self {
            machine,
            shared,
            result_rx,
            range,
        })
    }

    /// Begin the transfer
    pub fn start(&self) -> Result<()> {
        self.machine.dispatch(ACT_START, None).map(|_| ())
    }

    /// Request a cooperative pause, preserving progress
    pub fn pause(&self) -> Result<()> {
        self.machine.dispatch(ACT_PAUSE, None).map(|_| ())
    }

    /// Resume a paused connection (or retry early from `awaiting_retry`)
    pub fn resume(&self) -> Result<()> {
        self.machine.dispatch(ACT_RESUME, None).map(|_| ())
    }

    /// Request a cooperative cancel
    pub fn cancel(&self) -> Result<()> {
        self.machine.dispatch(ACT_CANCEL, None).map(|_| ())
    }

    /// Current lifecycle state
    pub fn state(&self) -> StateTag {
        self.machine.state()
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.machine.subscribe()
    }

    /// Bytes written so far
    pub fn bytes_downloaded(&self) -> u64 {
        self.shared.downloaded.load(Ordering::Relaxed)
    }

    /// Detected or hinted range support, if known
    pub fn supports_range(&self) -> Option<bool> {
        *self.shared.supports_range.lock()
    }

    /// Point-in-time progress
    pub fn progress(&self) -> ProgressSnapshot {
        let expected = self
            .range
            .and_then(|r| r.len())
            .or(*self.shared.total.lock());
        let speed = if self.state() == states::DOWNLOADING {
            self.shared.speed.lock().bytes_per_second()
        } else {
            0
        };
        ProgressSnapshot {
            bytes_downloaded: self.shared.downloaded.load(Ordering::Relaxed),
            bytes_to_download: expected,
            bytes_per_second: speed,
        }
    }

    /// Wait for the terminal result. The result is produced exactly once
    /// and republished to every caller.
    pub async fn await_result(&self) -> ConnectionResult {
        let mut rx = self.result_rx.clone();
        loop {
            if let Some(result) = rx.borrow().clone() {
                return result;
            }
            if rx.changed().await.is_err() {
                return ConnectionResult::Failed {
                    reason: FailureReason::Unknown,
                    message: "connection dropped without a result".into(),
                    resource_changed: false,
                };
            }
        }
    }

    /// The terminal result, if already produced
    pub fn result(&self) -> Option<ConnectionResult> {
        self.result_rx.borrow().clone()
    }
}

fn build_machine(context: ConnContext) -> Machine<ConnContext, ConnSignal> {
    use states::*;

    MachineBuilder::new(IDLE)
        .on(IDLE, ACT_START, |args| {
            begin_attempt(args.context, ResolveTrigger::Initial);
            Ok(STARTING)
        })
        .on(IDLE, ACT_CANCEL, |args| {
            publish(args.context, ConnectionResult::Cancelled);
            Ok(CANCELLED)
        })
        // starting: waiting for the response headers
        .edge(STARTING, ACT_FETCH_OK, DOWNLOADING)
        .on(STARTING, ACT_FETCH_FAILED, handle_failure)
        .on(STARTING, ACT_PAUSE, request_halt_for(PAUSING))
        .on(STARTING, ACT_CANCEL, request_halt_for(CANCELLING))
        // downloading: body streaming in progress
        .on(DOWNLOADING, ACT_STREAM_FINISHED, handle_stream_finished)
        .on(DOWNLOADING, ACT_STREAM_FAILED, handle_failure)
        .on(DOWNLOADING, ACT_PAUSE, request_halt_for(PAUSING))
        .on(DOWNLOADING, ACT_CANCEL, request_halt_for(CANCELLING))
        // pausing: waiting for the reader to acknowledge the cancel token
        .edge(PAUSING, ACT_HALTED, PAUSED)
        .edge(PAUSING, ACT_FETCH_OK, PAUSING)
        .edge(PAUSING, ACT_FETCH_FAILED, PAUSED)
        .edge(PAUSING, ACT_STREAM_FAILED, PAUSED)
        .on(PAUSING, ACT_STREAM_FINISHED, handle_stream_finished)
        .edge(PAUSING, ACT_CANCEL, CANCELLING)
        // paused: progress preserved for a future resume
        .on(PAUSED, ACT_RESUME, |args| {
            begin_attempt(args.context, ResolveTrigger::Resume);
            Ok(STARTING)
        })
        .on(PAUSED, ACT_CANCEL, |args| {
            publish(args.context, ConnectionResult::Cancelled);
            Ok(CANCELLED)
        })
        // cancelling: waiting for the reader, then cancelled whatever it reports
        .on(CANCELLING, ACT_HALTED, finish_cancelled)
        .on(CANCELLING, ACT_FETCH_FAILED, finish_cancelled)
        .on(CANCELLING, ACT_STREAM_FAILED, finish_cancelled)
        .on(CANCELLING, ACT_STREAM_FINISHED, finish_cancelled)
        .edge(CANCELLING, ACT_FETCH_OK, CANCELLING)
        // awaiting_retry: backoff timer pending
        .on(AWAITING_RETRY, ACT_RETRY_TIMER, |args| {
            // A stale timer from an earlier backoff period is ignored
            if let Some(ConnSignal::RetryTick { attempt }) = args.payload {
                if attempt != args.context.attempts {
                    return Ok(AWAITING_RETRY);
                }
            }
            begin_attempt(args.context, ResolveTrigger::Retry);
            Ok(STARTING)
        })
        .on(AWAITING_RETRY, ACT_RESUME, |args| {
            begin_attempt(args.context, ResolveTrigger::Resume);
            Ok(STARTING)
        })
        .edge(AWAITING_RETRY, ACT_PAUSE, PAUSED)
        .on(AWAITING_RETRY, ACT_CANCEL, |args| {
            publish(args.context, ConnectionResult::Cancelled);
            Ok(CANCELLED)
        })
        // completing: bytes verified, result published, finalize
        .edge(COMPLETING, ACT_FINALIZED, SUCCESS)
        .terminal(SUCCESS)
        .terminal(CANCELLED)
        .terminal(FAILED)
        // Late timers after a pause or manual resume land here harmlessly
        .fallback(ACT_RETRY_TIMER, |args| Ok(args.state))
        .build(context)
}

/// Handler: trip the attempt token and settle in `next` until the reader halts
fn request_halt_for(
    next: StateTag,
) -> impl FnMut(HandlerArgs<'_, ConnContext, ConnSignal>) -> Result<StateTag> + Send + 'static {
    move |args| {
        if let Some(token) = &args.context.attempt_token {
            token.cancel();
        }
        Ok(next)
    }
}

fn finish_cancelled(args: HandlerArgs<'_, ConnContext, ConnSignal>) -> Result<StateTag> {
    publish(args.context, ConnectionResult::Cancelled);
    Ok(states::CANCELLED)
}

/// Handler for fetch/stream failures: consult the retry budget.
fn handle_failure(args: HandlerArgs<'_, ConnContext, ConnSignal>) -> Result<StateTag> {
    let (reason, message, resource_changed) = match args.payload {
        Some(ConnSignal::Failure {
            reason,
            message,
            resource_changed,
        }) => (reason, message, resource_changed),
        _ => (FailureReason::Unknown, "unclassified failure".to_string(), false),
    };
    if resource_changed {
        tracing::error!(%reason, %message, "connection failed permanently");
        publish(
            args.context,
            ConnectionResult::Failed {
                reason,
                message,
                resource_changed: true,
            },
        );
        return Ok(states::FAILED);
    }
    fail_or_retry(args.context, reason, message)
}

fn fail_or_retry(
    ctx: &mut ConnContext,
    reason: FailureReason,
    message: String,
) -> Result<StateTag> {
    let retry_index = ctx.attempts;
    ctx.attempts += 1;

    if ctx.spec.retry.allows_retry(retry_index) {
        let delay = ctx.spec.retry.delay_for_attempt(retry_index);
        tracing::debug!(
            %reason,
            attempt = ctx.attempts,
            delay_ms = delay.as_millis() as u64,
            "connection failed, retry scheduled"
        );
        let sender = ctx.sender.clone();
        let attempt = ctx.attempts;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            sender.send(ACT_RETRY_TIMER, Some(ConnSignal::RetryTick { attempt }));
        });
        Ok(states::AWAITING_RETRY)
    } else {
        tracing::error!(%reason, %message, "connection failed, retry budget exhausted");
        publish(
            ctx,
            ConnectionResult::Failed {
                reason,
                message,
                resource_changed: false,
            },
        );
        Ok(states::FAILED)
    }
}

/// Handler for a finished stream: verify the byte count, then finalize.
fn handle_stream_finished(args: HandlerArgs<'_, ConnContext, ConnSignal>) -> Result<StateTag> {
    let got = args.context.shared.downloaded.load(Ordering::Relaxed);
    let expected = args
        .context
        .spec
        .range
        .and_then(|r| r.len())
        .or(*args.context.shared.total.lock());

    if let Some(expected) = expected {
        if got != expected {
            return fail_or_retry(
                args.context,
                FailureReason::StreamError,
                format!("short transfer: {} of {} bytes", got, expected),
            );
        }
    }

    publish(args.context, ConnectionResult::Success);
    args.followups.push(ACT_FINALIZED, None);
    Ok(states::COMPLETING)
}

/// Set the terminal result exactly once
fn publish(ctx: &mut ConnContext, result: ConnectionResult) {
    ctx.result_tx.send_if_modified(|slot| {
        if slot.is_none() {
            *slot = Some(result);
            true
        } else {
            false
        }
    });
}

/// Spawn the fetch/stream attempt for the current state of the context
fn begin_attempt(ctx: &mut ConnContext, trigger: ResolveTrigger) {
    let trigger = if ctx.started {
        trigger
    } else {
        ctx.started = true;
        ResolveTrigger::Initial
    };
    let token = CancellationToken::new();
    ctx.attempt_token = Some(token.clone());
    ctx.shared.speed.lock().reset();

    tokio::spawn(run_attempt(
        ctx.client.clone(),
        ctx.spec.clone(),
        Arc::clone(&ctx.shared),
        ctx.sender.clone(),
        token,
        trigger,
    ));
}

/// One fetch attempt: resolve, open, request, stream.
///
/// Reports back into the machine through the mailbox only; never touches
/// machine state directly.
async fn run_attempt(
    client: Client,
    spec: ConnectionSpec,
    shared: Arc<ConnShared>,
    sender: ActionSender<ConnSignal>,
    token: CancellationToken,
    trigger: ResolveTrigger,
) {
    let url = match resolve_url(&spec, &shared, trigger).await {
        Ok(url) => url,
        Err(err) => {
            sender.send(
                ACT_FETCH_FAILED,
                ConnSignal::failure(FailureReason::UrlResolveFailed, err.to_string()),
            );
            return;
        }
    };

    // A server that cannot resume forces a restart from offset zero
    let mut done = shared.downloaded.load(Ordering::Relaxed);
    if done > 0 && *shared.supports_range.lock() == Some(false) {
        tracing::debug!("no range support, discarding partial progress");
        shared.downloaded.store(0, Ordering::Relaxed);
        done = 0;
    }

    let base = spec.range.map(|r| r.start).unwrap_or(0);
    let mut file = match OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(&spec.destination)
        .await
    {
        Ok(file) => file,
        Err(err) => {
            sender.send(
                ACT_FETCH_FAILED,
                ConnSignal::failure(FailureReason::FileNotWritable, err.to_string()),
            );
            return;
        }
    };
    if let Err(err) = file.seek(SeekFrom::Start(base + done)).await {
        sender.send(
            ACT_FETCH_FAILED,
            ConnSignal::failure(FailureReason::FileNotWritable, err.to_string()),
        );
        return;
    }

    // Build the request; ranged whenever this connection covers a sub-range
    // or carries resume progress
    let mut request = client.get(&url).header("User-Agent", &spec.user_agent);
    for (name, value) in &spec.headers {
        request = request.header(name.as_str(), value.as_str());
    }
    let requested_start = base + done;
    let wants_range = spec.range.is_some() || done > 0;
    if wants_range {
        request = request.header(
            "Range",
            range_header(requested_start, spec.range.and_then(|r| r.end)),
        );
        if done > 0 {
            if let Some(etag) = &spec.etag {
                request = request.header("If-Match", etag.clone());
            }
        }
    }

    let response = tokio::select! {
        biased;
        _ = token.cancelled() => {
            sender.send(ACT_HALTED, None);
            return;
        }
        response = request.send() => match response {
            Ok(response) => response,
            Err(err) => {
                sender.send(
                    ACT_FETCH_FAILED,
                    ConnSignal::failure(FailureReason::InitialFetchFailed, err.to_string()),
                );
                return;
            }
        },
    };

    let status = response.status();
    match status {
        StatusCode::PARTIAL_CONTENT => {
            *shared.supports_range.lock() = Some(true);
            let content_range = response
                .headers()
                .get("content-range")
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range);
            match content_range {
                Some((start, _, total)) => {
                    if start != requested_start {
                        sender.send(
                            ACT_FETCH_FAILED,
                            ConnSignal::failure(
                                FailureReason::BadFetchResponse,
                                format!(
                                    "Content-Range mismatch: requested {}, got {}",
                                    requested_start, start
                                ),
                            ),
                        );
                        return;
                    }
                    if spec.range.is_none() {
                        if let Some(total) = total {
                            *shared.total.lock() = Some(total);
                        }
                    }
                }
                None => {
                    sender.send(
                        ACT_FETCH_FAILED,
                        ConnSignal::failure(
                            FailureReason::BadFetchResponse,
                            "206 without a parsable Content-Range",
                        ),
                    );
                    return;
                }
            }
        }
        StatusCode::OK => {
            let accepts = crate::http::probe::accepts_byte_ranges(response.headers());
            *shared.supports_range.lock() = Some(accepts);
            if spec.range.is_some() {
                // A split connection cannot accept a full-body response:
                // its siblings own the rest of the file
                sender.send(
                    ACT_FETCH_FAILED,
                    ConnSignal::failure(
                        FailureReason::BadFetchResponse,
                        "server ignored Range request on a split connection",
                    ),
                );
                return;
            }
            if done > 0 {
                // Server ignored the resume; start over from offset zero
                tracing::debug!("resume not honored, restarting from offset 0");
                shared.downloaded.store(0, Ordering::Relaxed);
                if let Err(err) = file.seek(SeekFrom::Start(0)).await {
                    sender.send(
                        ACT_FETCH_FAILED,
                        ConnSignal::failure(FailureReason::FileNotWritable, err.to_string()),
                    );
                    return;
                }
            }
            let length = response
                .headers()
                .get("content-length")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok());
            if let Some(length) = length {
                *shared.total.lock() = Some(length);
            }
        }
        // The entity on the server no longer matches what is on disk;
        // only a full restart by the owner can recover
        StatusCode::PRECONDITION_FAILED | StatusCode::RANGE_NOT_SATISFIABLE => {
            sender.send(
                ACT_FETCH_FAILED,
                ConnSignal::resource_changed_failure(
                    FailureReason::BadFetchResponse,
                    format!("resource changed ({})", status.as_u16()),
                ),
            );
            return;
        }
        _ => {
            sender.send(
                ACT_FETCH_FAILED,
                ConnSignal::failure(
                    FailureReason::BadFetchResponse,
                    format!("unexpected status: {}", status),
                ),
            );
            return;
        }
    }

    sender.send(ACT_FETCH_OK, None);

    // Stream the body into the file at the connection's offset
    let expected = spec.range.and_then(|r| r.len()).or(*shared.total.lock());
    let mut stream = response.bytes_stream();
    loop {
        let chunk = tokio::select! {
            biased;
            _ = token.cancelled() => {
                let _ = file.flush().await;
                sender.send(ACT_HALTED, None);
                return;
            }
            chunk = stream.next() => chunk,
        };
        let Some(chunk) = chunk else { break };
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                let _ = file.flush().await;
                sender.send(
                    ACT_STREAM_FAILED,
                    ConnSignal::failure(FailureReason::StreamError, err.to_string()),
                );
                return;
            }
        };

        // Never write past the assigned range into a sibling's region
        if let Some(expected) = expected {
            let done = shared.downloaded.load(Ordering::Relaxed);
            if done + chunk.len() as u64 > expected {
                let _ = file.flush().await;
                sender.send(
                    ACT_STREAM_FAILED,
                    ConnSignal::failure(
                        FailureReason::BadFetchResponse,
                        format!(
                            "server sent more than the expected {} bytes",
                            expected
                        ),
                    ),
                );
                return;
            }
        }

        if let Err(err) = file.write_all(&chunk).await {
            sender.send(
                ACT_STREAM_FAILED,
                ConnSignal::failure(FailureReason::FileNotWritable, err.to_string()),
            );
            return;
        }

        let total = shared
            .downloaded
            .fetch_add(chunk.len() as u64, Ordering::Relaxed)
            + chunk.len() as u64;
        shared.speed.lock().sample(total);
    }

    if let Err(err) = file.flush().await {
        sender.send(
            ACT_STREAM_FAILED,
            ConnSignal::failure(FailureReason::FileNotWritable, err.to_string()),
        );
        return;
    }
    let _ = file.sync_all().await;

    sender.send(ACT_STREAM_FINISHED, None);
}

async fn resolve_url(
    spec: &ConnectionSpec,
    shared: &ConnShared,
    trigger: ResolveTrigger,
) -> Result<String> {
    match &spec.url {
        UrlSource::Literal(url) => Ok(url.clone()),
        UrlSource::Resolver(resolver) => {
            let cached = shared.resolved_url.lock().clone();
            match cached {
                Some(url) if !spec.resolution.applies_to(trigger) => Ok(url),
                _ => {
                    let url = resolver(trigger)
                        .await
                        .map_err(|e| EngineError::connection(
                            FailureReason::UrlResolveFailed,
                            e.to_string(),
                        ))?;
                    *shared.resolved_url.lock() = Some(url.clone());
                    Ok(url)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn spec(dest: PathBuf, url: &str) -> ConnectionSpec {
        ConnectionSpec {
            url: url.into(),
            resolution: ResolutionPolicy::default(),
            range: None,
            destination: dest,
            headers: Vec::new(),
            user_agent: "downdraft-test".into(),
            retry: RetryPolicy::none(),
            etag: None,
            range_support: None,
        }
    }

    #[tokio::test]
    async fn test_idle_cancel_publishes_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let conn = DownloadConnection::new(
            Client::new(),
            spec(dir.path().join("f.bin"), "http://localhost:1/x"),
        );
        conn.cancel().unwrap();
        assert_eq!(conn.await_result().await, ConnectionResult::Cancelled);
        assert_eq!(conn.state(), states::CANCELLED);
    }

    #[tokio::test]
    async fn test_terminal_dispatches_are_noops() {
        let dir = tempfile::tempdir().unwrap();
        let conn = DownloadConnection::new(
            Client::new(),
            spec(dir.path().join("f.bin"), "http://localhost:1/x"),
        );
        conn.cancel().unwrap();
        // Repeated operations against a terminal connection never error
        conn.pause().unwrap();
        conn.resume().unwrap();
        conn.cancel().unwrap();
        assert_eq!(conn.state(), states::CANCELLED);
    }

    #[tokio::test]
    async fn test_unreachable_host_fails_without_retries() {
        let dir = tempfile::tempdir().unwrap();
        // Port 1 refuses connections; the policy allows no retries
        let conn = DownloadConnection::new(
            Client::new(),
            spec(dir.path().join("f.bin"), "http://127.0.0.1:1/x"),
        );
        conn.start().unwrap();
        match conn.await_result().await {
            ConnectionResult::Failed { reason, .. } => {
                assert_eq!(reason, FailureReason::InitialFetchFailed);
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(conn.state(), states::FAILED);
    }

    #[tokio::test]
    async fn test_precondition_failure_is_marked_resource_changed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(412))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let conn = DownloadConnection::new(
            Client::new(),
            spec(dir.path().join("f.bin"), &format!("{}/x", server.uri())),
        );
        conn.start().unwrap();
        match conn.await_result().await {
            ConnectionResult::Failed {
                resource_changed, ..
            } => assert!(resource_changed),
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(conn.state(), states::FAILED);
    }

    #[tokio::test]
    async fn test_overrun_never_writes_past_the_range() {
        let server = MockServer::start().await;
        // The server claims the requested slice but streams twice as much
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", "bytes 0-4/10")
                    .set_body_bytes(vec![7u8; 10]),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("f.bin");
        let mut spec = spec(dest.clone(), &format!("{}/x", server.uri()));
        spec.range = Some(ByteRange::new(0, Some(4)));
        let conn = DownloadConnection::new(Client::new(), spec);
        conn.start().unwrap();
        match conn.await_result().await {
            ConnectionResult::Failed {
                resource_changed, ..
            } => assert!(!resource_changed),
            other => panic!("expected failure, got {:?}", other),
        }
        // Nothing past the assigned range ever reached the file
        assert!(std::fs::metadata(&dest).unwrap().len() <= 5);
    }

    #[test]
    fn test_state_terminality() {
        assert!(states::is_terminal(states::SUCCESS));
        assert!(states::is_terminal(states::FAILED));
        assert!(states::is_terminal(states::CANCELLED));
        assert!(!states::is_terminal(states::DOWNLOADING));
        assert!(!states::is_terminal(states::AWAITING_RETRY));
    }
}

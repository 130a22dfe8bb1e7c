//! Multi-connection download orchestration
//!
//! A [`Downloader`] drives one logical download end to end: it probes the
//! resource, splits it into byte ranges when the server supports them,
//! runs one [`DownloadConnection`] per range against a `.part` staging
//! file, and promotes the staging file to the destination once every
//! connection succeeds.
//!
//! The downloader is itself a state machine, but most of its transitions
//! are inferred: whenever a connection changes state, the downloader
//! recomputes its own state from the multiset of connection states. Direct
//! actions (pause, resume, cancel) fan out to the connections and then
//! settle on the same inference.

use crate::error::{FailureReason, Result};
use crate::fsm::{
    action_channel, ActionSender, ActionTag, HandlerArgs, Machine, MachineBuilder, StateChange,
    StateTag,
};
use crate::http::connection::{
    states as conn_states, ConnectionResult, ConnectionSpec, DownloadConnection,
};
use crate::http::probe::{probe_resource, ResourceInfo};
use crate::http::{ByteRange, DownloadRequest, ResolveTrigger, UrlSource};
use crate::progress::ProgressSnapshot;
use reqwest::Client;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

/// Downloader state tags. A superset of the connection states: `preparing`
/// covers the probe/split phase before any connection exists.
pub mod states {
    pub use crate::http::connection::states::{
        is_terminal, AWAITING_RETRY, CANCELLED, CANCELLING, COMPLETING, DOWNLOADING, FAILED, IDLE,
        PAUSED, PAUSING, STARTING, SUCCESS,
    };

    pub const PREPARING: &str = "preparing";
}

const ACT_START: ActionTag = "start";
const ACT_PREPARED: ActionTag = "prepared";
const ACT_PREPARE_FAILED: ActionTag = "prepare_failed";
const ACT_CONN_UPDATE: ActionTag = "conn_update";
const ACT_PAUSE: ActionTag = "pause";
const ACT_RESUME: ActionTag = "resume";
const ACT_CANCEL: ActionTag = "cancel";
const ACT_VERIFIED: ActionTag = "verified";
const ACT_RESTART: ActionTag = "restart";
const ACT_FINALIZED: ActionTag = "finalized";
const ACT_FINALIZE_FAILED: ActionTag = "finalize_failed";

/// Extension appended to the destination while bytes are in flight
const STAGING_SUFFIX: &str = "part";

/// Terminal outcome of a download
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadResult {
    Success { path: PathBuf },
    Cancelled,
    Failed { reason: FailureReason, message: String },
}

/// Tunables the downloader takes from engine configuration
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Resources smaller than this are never split
    pub min_split_size: u64,
    pub user_agent: String,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            min_split_size: 1024 * 1024,
            user_agent: format!("downdraft/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Signals carried by downloader mailbox actions
#[derive(Debug)]
enum DlSignal {
    Prepared {
        info: ResourceInfo,
        ranges: Option<Vec<ByteRange>>,
    },
    PrepareFailed {
        reason: FailureReason,
        message: String,
    },
}

struct DlContext {
    client: Client,
    request: DownloadRequest,
    options: DownloadOptions,
    staging: PathBuf,
    sender: ActionSender<DlSignal>,
    result_tx: watch::Sender<Option<DownloadResult>>,
    connections: Vec<Arc<DownloadConnection>>,
    /// Whether the connections have been started at least once
    started_conns: bool,
    /// Guards against spawning the finalize rename twice
    finalizing: bool,
    total: Option<u64>,
    etag: Option<String>,
    /// Full restarts performed after upstream content changes
    restarts: u32,
    prepare_token: CancellationToken,
}

/// Upper bound on full restarts caused by the resource changing under us
const MAX_RESTARTS: u32 = 3;

/// One logical download: probe, split, stream, promote.
pub struct Downloader {
    machine: Arc<Machine<DlContext, DlSignal>>,
    result_rx: watch::Receiver<Option<DownloadResult>>,
    staging: PathBuf,
    destination: PathBuf,
}

impl Downloader {
    pub fn new(client: Client, request: DownloadRequest) -> Arc<Self> {
        Self::with_options(client, request, DownloadOptions::default())
    }

    pub fn with_options(
        client: Client,
        request: DownloadRequest,
        options: DownloadOptions,
    ) -> Arc<Self> {
        let destination = request.destination.clone();
        let staging = staging_path(&destination);
        let (sender, inbox) = action_channel::<DlSignal>();
        let (result_tx, result_rx) = watch::channel(None);

        let context = DlContext {
            client,
            request,
            options,
            staging: staging.clone(),
            sender,
            result_tx,
            connections: Vec::new(),
            started_conns: false,
            finalizing: false,
            total: None,
            etag: None,
            restarts: 0,
            prepare_token: CancellationToken::new(),
        };

        let machine = Arc::new(build_machine(context));
        machine.serve(inbox);

        Arc::new(Self {
            machine,
            result_rx,
            staging,
            destination,
        })
    }

    /// Begin the download. Valid only once, from `idle`.
    pub fn start(&self) -> Result<()> {
        self.machine.dispatch(ACT_START, None).map(|_| ())
    }

    /// Pause every connection, preserving progress
    pub fn pause(&self) -> Result<()> {
        self.machine.dispatch(ACT_PAUSE, None).map(|_| ())
    }

    /// Resume a paused download. When partial progress exists and the probe
    /// captured an `ETag`, the resource is re-probed first; a changed tag
    /// discards all progress and restarts from scratch.
    pub fn resume(&self) -> Result<()> {
        self.machine.dispatch(ACT_RESUME, None).map(|_| ())
    }

    /// Cancel the download and discard the staging file
    pub fn cancel(&self) -> Result<()> {
        self.machine.dispatch(ACT_CANCEL, None).map(|_| ())
    }

    pub fn state(&self) -> StateTag {
        self.machine.state()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.machine.subscribe()
    }

    pub fn destination(&self) -> &PathBuf {
        &self.destination
    }

    /// Aggregated progress across all connections
    pub fn progress(&self) -> ProgressSnapshot {
        self.machine.with_context(|ctx| {
            let mut merged = ProgressSnapshot::default();
            for conn in &ctx.connections {
                merged = merged.merge(conn.progress());
            }
            if let Some(total) = ctx.total {
                merged.bytes_to_download = Some(total);
            }
            merged
        })
    }

    /// Wait for the terminal result. Produced exactly once.
    pub async fn await_result(&self) -> DownloadResult {
        let mut rx = self.result_rx.clone();
        loop {
            if let Some(result) = rx.borrow().clone() {
                return result;
            }
            if rx.changed().await.is_err() {
                return DownloadResult::Failed {
                    reason: FailureReason::Unknown,
                    message: "downloader dropped without a result".into(),
                };
            }
        }
    }

    /// The terminal result, if already produced
    pub fn result(&self) -> Option<DownloadResult> {
        self.result_rx.borrow().clone()
    }

    /// Remove the staging file, if any. Called by owners when a download
    /// is abandoned for good.
    pub async fn cleanup(&self) {
        if let Err(err) = tokio::fs::remove_file(&self.staging).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(path = %self.staging.display(), %err, "staging cleanup failed");
            }
        }
    }
}

fn staging_path(destination: &PathBuf) -> PathBuf {
    let mut staging = destination.clone();
    match staging.extension() {
        Some(ext) => {
            let mut ext = ext.to_os_string();
            ext.push(".");
            ext.push(STAGING_SUFFIX);
            staging.set_extension(ext);
        }
        None => {
            staging.set_extension(STAGING_SUFFIX);
        }
    }
    staging
}

/// Split `length` bytes into `n` contiguous ranges of `ceil(length / n)`
/// bytes each, the last one open-ended. Trailing ranges that would start
/// past the end are dropped.
pub(crate) fn split_ranges(length: u64, n: usize) -> Vec<ByteRange> {
    let n = n.max(1) as u64;
    let chunk = length.div_ceil(n);
    let mut ranges = Vec::new();
    for i in 0..n {
        let start = i * chunk;
        if start >= length {
            break;
        }
        ranges.push(ByteRange::new(start, Some((start + chunk - 1).min(length - 1))));
    }
    if let Some(last) = ranges.last_mut() {
        last.end = None;
    }
    ranges
}

/// Infer the downloader state from its connections' states.
///
/// Active states dominate settled ones: a single cancelling or pausing
/// connection colors the whole download, and any connection still moving
/// bytes keeps the download `downloading`. Once every connection is
/// terminal the outcome is `success` only if all succeeded, `failed` if
/// any failed, `cancelled` otherwise.
pub(crate) fn infer_overall(states: &[StateTag]) -> StateTag {
    use conn_states::*;

    if states.is_empty() {
        return IDLE;
    }
    if states.iter().all(|s| is_terminal(s)) {
        if states.iter().all(|s| *s == SUCCESS) {
            return SUCCESS;
        }
        if states.iter().any(|s| *s == FAILED) {
            return FAILED;
        }
        return CANCELLED;
    }
    for probe in [CANCELLING, PAUSING, DOWNLOADING, STARTING, COMPLETING] {
        if states.iter().any(|s| *s == probe) {
            return probe;
        }
    }
    if states.iter().any(|s| *s == AWAITING_RETRY) {
        return AWAITING_RETRY;
    }
    if states.iter().any(|s| *s == PAUSED) {
        return PAUSED;
    }
    IDLE
}

fn build_machine(context: DlContext) -> Machine<DlContext, DlSignal> {
    use states::*;

    MachineBuilder::new(IDLE)
        .on(IDLE, ACT_START, |args| {
            spawn_prepare(args.context);
            Ok(PREPARING)
        })
        .fallback(ACT_PREPARED, handle_prepared)
        .fallback(ACT_PREPARE_FAILED, |args| {
            let (reason, message) = match args.payload {
                Some(DlSignal::PrepareFailed { reason, message }) => (reason, message),
                _ => (FailureReason::Unknown, "probe failed".to_string()),
            };
            tracing::error!(%reason, %message, "download preparation failed");
            publish(args.context, DownloadResult::Failed { reason, message });
            Ok(FAILED)
        })
        .fallback(ACT_CONN_UPDATE, |args| settle(args.context, args.state))
        .fallback(ACT_PAUSE, handle_pause)
        .fallback(ACT_RESUME, handle_resume)
        .fallback(ACT_CANCEL, handle_cancel)
        .fallback(ACT_VERIFIED, |args| {
            if args.state != STARTING {
                return Ok(args.state);
            }
            for conn in &args.context.connections {
                let _ = conn.resume();
            }
            settle(args.context, args.state)
        })
        .fallback(ACT_RESTART, handle_restart)
        .fallback(ACT_FINALIZED, |args| {
            let path = args.context.request.destination.clone();
            publish(args.context, DownloadResult::Success { path });
            Ok(SUCCESS)
        })
        .fallback(ACT_FINALIZE_FAILED, |args| {
            let message = "failed to move staging file into place".to_string();
            publish(
                args.context,
                DownloadResult::Failed {
                    reason: FailureReason::FileNotWritable,
                    message: message.clone(),
                },
            );
            tracing::error!(%message, "download finalization failed");
            Ok(FAILED)
        })
        .terminal(SUCCESS)
        .terminal(FAILED)
        .terminal(CANCELLED)
        .build(context)
}

/// Recompute the inferred state; when every connection has settled, drive
/// the terminal outcome (rename on success, cleanup otherwise).
fn settle(ctx: &mut DlContext, current: StateTag) -> Result<StateTag> {
    if ctx.connections.is_empty() {
        return Ok(current);
    }
    let conn_tags: Vec<StateTag> = ctx.connections.iter().map(|c| c.state()).collect();

    // One exhausted connection dooms the whole download; stop the rest
    // instead of letting them finish into a file that can never complete
    if conn_tags.iter().any(|s| *s == conn_states::FAILED)
        && !conn_tags.iter().all(|s| conn_states::is_terminal(s))
    {
        for conn in &ctx.connections {
            let _ = conn.cancel();
        }
        return Ok(states::CANCELLING);
    }

    let inferred = infer_overall(&conn_tags);

    match inferred {
        states::SUCCESS => {
            if !ctx.finalizing {
                ctx.finalizing = true;
                spawn_finalize(ctx);
            }
            Ok(states::COMPLETING)
        }
        states::FAILED => {
            let (reason, message, resource_changed) = first_failure(&ctx.connections);
            // 412/416 mean the bytes on disk belong to a stale version of
            // the resource; start over instead of failing
            if resource_changed && ctx.restarts < MAX_RESTARTS {
                return Ok(restart_download(ctx));
            }
            publish(ctx, DownloadResult::Failed { reason, message });
            for conn in &ctx.connections {
                let _ = conn.cancel();
            }
            Ok(states::FAILED)
        }
        states::CANCELLED => {
            publish(ctx, DownloadResult::Cancelled);
            spawn_remove(ctx.staging.clone());
            Ok(states::CANCELLED)
        }
        other => Ok(other),
    }
}

fn first_failure(connections: &[Arc<DownloadConnection>]) -> (FailureReason, String, bool) {
    for conn in connections {
        if let Some(ConnectionResult::Failed {
            reason,
            message,
            resource_changed,
        }) = conn.result()
        {
            return (reason, message, resource_changed);
        }
    }
    (FailureReason::Unknown, "connection failed".to_string(), false)
}

fn handle_prepared(args: HandlerArgs<'_, DlContext, DlSignal>) -> Result<StateTag> {
    let (info, ranges) = match args.payload {
        Some(DlSignal::Prepared { info, ranges }) => (info, ranges),
        _ => return Ok(args.state),
    };
    let ctx = args.context;
    ctx.total = info.content_length;
    ctx.etag = info.etag.clone();

    let supports = info.supports_range;
    let specs: Vec<ConnectionSpec> = match ranges {
        Some(ranges) => ranges
            .into_iter()
            .map(|range| connection_spec(ctx, Some(range), Some(true)))
            .collect(),
        None => vec![connection_spec(ctx, None, Some(supports))],
    };
    tracing::info!(
        connections = specs.len(),
        total = ?ctx.total,
        "download plan ready"
    );

    for spec in specs {
        let conn = DownloadConnection::new(ctx.client.clone(), spec);
        attach(&conn, ctx.sender.clone());
        ctx.connections.push(conn);
    }

    // A pause that arrived during the probe wins: hold the connections
    // in idle until the download is resumed
    if args.state == states::PAUSED {
        return Ok(states::PAUSED);
    }

    ctx.started_conns = true;
    for conn in &ctx.connections {
        let _ = conn.start();
    }
    settle(ctx, args.state)
}

fn handle_pause(args: HandlerArgs<'_, DlContext, DlSignal>) -> Result<StateTag> {
    if states::is_terminal(args.state) || args.state == states::CANCELLING {
        return Ok(args.state);
    }
    if args.context.connections.is_empty() || !args.context.started_conns {
        return Ok(states::PAUSED);
    }
    for conn in &args.context.connections {
        let _ = conn.pause();
    }
    settle(args.context, args.state)
}

fn handle_resume(args: HandlerArgs<'_, DlContext, DlSignal>) -> Result<StateTag> {
    if args.state != states::PAUSED {
        return Ok(args.state);
    }
    let ctx = args.context;

    if ctx.connections.is_empty() {
        // Probe still in flight; the prepared handler takes it from here
        return Ok(states::PREPARING);
    }
    if !ctx.started_conns {
        ctx.started_conns = true;
        for conn in &ctx.connections {
            let _ = conn.start();
        }
        return settle(ctx, args.state);
    }

    let downloaded: u64 = ctx.connections.iter().map(|c| c.bytes_downloaded()).sum();
    if downloaded > 0 && ctx.etag.is_some() {
        spawn_verify(ctx);
        return Ok(states::STARTING);
    }

    for conn in &ctx.connections {
        let _ = conn.resume();
    }
    settle(ctx, args.state)
}

fn handle_cancel(args: HandlerArgs<'_, DlContext, DlSignal>) -> Result<StateTag> {
    if states::is_terminal(args.state) {
        return Ok(args.state);
    }
    let ctx = args.context;
    ctx.prepare_token.cancel();

    if ctx.connections.is_empty() || !ctx.started_conns {
        publish(ctx, DownloadResult::Cancelled);
        spawn_remove(ctx.staging.clone());
        return Ok(states::CANCELLED);
    }
    for conn in &ctx.connections {
        let _ = conn.cancel();
    }
    settle(ctx, args.state)
}

fn handle_restart(args: HandlerArgs<'_, DlContext, DlSignal>) -> Result<StateTag> {
    if args.state != states::STARTING {
        return Ok(args.state);
    }
    Ok(restart_download(args.context))
}

/// The entity tag no longer matches: every byte on disk belongs to a
/// stale version of the resource. Drop everything and start over.
fn restart_download(ctx: &mut DlContext) -> StateTag {
    tracing::info!("resource changed since last fetch, restarting from scratch");
    ctx.restarts += 1;

    for conn in &ctx.connections {
        let _ = conn.cancel();
    }
    ctx.connections.clear();
    ctx.started_conns = false;
    ctx.finalizing = false;
    ctx.total = None;
    ctx.etag = None;
    ctx.prepare_token = CancellationToken::new();

    let staging = ctx.staging.clone();
    let sender = ctx.sender.clone();
    let client = ctx.client.clone();
    let request = ctx.request.clone();
    let options = ctx.options.clone();
    let token = ctx.prepare_token.clone();
    tokio::spawn(async move {
        let _ = tokio::fs::remove_file(&staging).await;
        run_prepare(client, request, options, staging, sender, token).await;
    });
    states::PREPARING
}

/// Set the terminal result exactly once
fn publish(ctx: &mut DlContext, result: DownloadResult) {
    ctx.result_tx.send_if_modified(|slot| {
        if slot.is_none() {
            *slot = Some(result);
            true
        } else {
            false
        }
    });
}

fn connection_spec(
    ctx: &DlContext,
    range: Option<ByteRange>,
    range_support: Option<bool>,
) -> ConnectionSpec {
    ConnectionSpec {
        url: ctx.request.url.clone(),
        resolution: ctx.request.resolution_policy,
        range,
        destination: ctx.staging.clone(),
        headers: ctx.request.headers.clone(),
        user_agent: ctx
            .request
            .user_agent
            .clone()
            .unwrap_or_else(|| ctx.options.user_agent.clone()),
        retry: ctx.request.connection_retry_policy,
        etag: ctx.etag.clone(),
        range_support,
    }
}

/// Forward a connection's state changes into the downloader mailbox
fn attach(conn: &Arc<DownloadConnection>, sender: ActionSender<DlSignal>) {
    let mut rx = conn.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(change) => {
                    sender.send(ACT_CONN_UPDATE, None);
                    if conn_states::is_terminal(change.to) {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    sender.send(ACT_CONN_UPDATE, None);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn spawn_prepare(ctx: &mut DlContext) {
    tokio::spawn(run_prepare(
        ctx.client.clone(),
        ctx.request.clone(),
        ctx.options.clone(),
        ctx.staging.clone(),
        ctx.sender.clone(),
        ctx.prepare_token.clone(),
    ));
}

/// Probe the resource and compute the connection plan.
async fn run_prepare(
    client: Client,
    request: DownloadRequest,
    options: DownloadOptions,
    staging: PathBuf,
    sender: ActionSender<DlSignal>,
    token: CancellationToken,
) {
    let user_agent = request
        .user_agent
        .clone()
        .unwrap_or_else(|| options.user_agent.clone());

    let url = match resolve_request_url(&request.url, ResolveTrigger::Initial).await {
        Ok(url) => url,
        Err(err) => {
            sender.send(
                ACT_PREPARE_FAILED,
                Some(DlSignal::PrepareFailed {
                    reason: FailureReason::UrlResolveFailed,
                    message: err.to_string(),
                }),
            );
            return;
        }
    };

    let info = tokio::select! {
        biased;
        _ = token.cancelled() => return,
        info = probe_resource(&client, &url, &user_agent, &request.headers) => match info {
            Ok(info) => info,
            Err(err) => {
                let reason = match &err {
                    crate::error::EngineError::Network { status: Some(_), .. } => {
                        FailureReason::BadFetchResponse
                    }
                    _ => FailureReason::InitialFetchFailed,
                };
                sender.send(
                    ACT_PREPARE_FAILED,
                    Some(DlSignal::PrepareFailed {
                        reason,
                        message: err.to_string(),
                    }),
                );
                return;
            }
        },
    };

    let ranges = match info.content_length {
        Some(length)
            if info.supports_range && length >= options.min_split_size && request.max_connections > 1 =>
        {
            Some(split_ranges(length, request.max_connections))
        }
        _ => None,
    };

    // Create the staging file up front, pre-sized when the length is known,
    // so every connection can seek to its own offset
    match tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .open(&staging)
        .await
    {
        Ok(file) => {
            if let Some(length) = info.content_length {
                if let Err(err) = file.set_len(length).await {
                    sender.send(
                        ACT_PREPARE_FAILED,
                        Some(DlSignal::PrepareFailed {
                            reason: FailureReason::FileNotWritable,
                            message: format!("failed to pre-allocate staging file: {}", err),
                        }),
                    );
                    return;
                }
            }
        }
        Err(err) => {
            sender.send(
                ACT_PREPARE_FAILED,
                Some(DlSignal::PrepareFailed {
                    reason: FailureReason::FileNotWritable,
                    message: format!("failed to create staging file: {}", err),
                }),
            );
            return;
        }
    }

    sender.send(ACT_PREPARED, Some(DlSignal::Prepared { info, ranges }));
}

/// Re-probe on resume and compare entity tags.
fn spawn_verify(ctx: &mut DlContext) {
    let client = ctx.client.clone();
    let url_source = ctx.request.url.clone();
    let headers = ctx.request.headers.clone();
    let user_agent = ctx
        .request
        .user_agent
        .clone()
        .unwrap_or_else(|| ctx.options.user_agent.clone());
    let expected = ctx.etag.clone();
    let sender = ctx.sender.clone();

    tokio::spawn(async move {
        let url = match resolve_request_url(&url_source, ResolveTrigger::Resume).await {
            Ok(url) => url,
            // The connections re-resolve on their own; let them report it
            Err(_) => {
                sender.send(ACT_VERIFIED, None);
                return;
            }
        };
        match probe_resource(&client, &url, &user_agent, &headers).await {
            Ok(info) => {
                let changed = matches!(
                    (&expected, &info.etag),
                    (Some(old), Some(new)) if old != new
                );
                if changed {
                    sender.send(ACT_RESTART, None);
                } else {
                    sender.send(ACT_VERIFIED, None);
                }
            }
            // A failed probe is not proof of a changed resource
            Err(_) => sender.send(ACT_VERIFIED, None),
        }
    });
}

/// Promote the staging file to the destination.
fn spawn_finalize(ctx: &mut DlContext) {
    let staging = ctx.staging.clone();
    let destination = ctx.request.destination.clone();
    let sender = ctx.sender.clone();
    tokio::spawn(async move {
        match tokio::fs::rename(&staging, &destination).await {
            Ok(()) => sender.send(ACT_FINALIZED, None),
            Err(err) => {
                tracing::error!(
                    from = %staging.display(),
                    to = %destination.display(),
                    %err,
                    "rename failed"
                );
                sender.send(ACT_FINALIZE_FAILED, None);
            }
        }
    });
}

fn spawn_remove(path: PathBuf) {
    tokio::spawn(async move {
        let _ = tokio::fs::remove_file(&path).await;
    });
}

async fn resolve_request_url(source: &UrlSource, trigger: ResolveTrigger) -> Result<String> {
    let url = match source {
        UrlSource::Literal(url) => url.clone(),
        UrlSource::Resolver(resolver) => resolver(trigger).await?,
    };
    // Catch malformed resolver output here instead of deep in the fetch
    url::Url::parse(&url)?;
    Ok(url)
}

//! Shared helpers for the integration tests: a mock HTTP server responder
//! that honors byte-range semantics, and polling utilities.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::path;
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

static INIT_LOGGING: std::sync::Once = std::sync::Once::new();

/// Route engine logs through `RUST_LOG` when a test run wants them
pub fn init_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// Deterministic test payload
pub fn pattern_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Poll `check` until it holds or the timeout expires
pub async fn wait_for<F>(mut check: F, what: &str)
where
    F: FnMut() -> bool,
{
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Serves a fixed body with byte-range support: HEAD advertises the size
/// and `Accept-Ranges`, ranged GETs get a `206` slice with `Content-Range`,
/// plain GETs the whole body. Records the `Range` header of every GET.
pub struct RangedResponder {
    body: Vec<u8>,
    etag: Option<String>,
    delay: Option<Duration>,
    ranges_seen: Arc<Mutex<Vec<Option<String>>>>,
}

impl RangedResponder {
    pub fn new(body: Vec<u8>, etag: Option<&str>) -> Self {
        Self {
            body,
            etag: etag.map(|s| s.to_string()),
            delay: None,
            ranges_seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Delay every GET response, so a test can pause a transfer in flight
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Handle to the recorded `Range` request headers, in arrival order
    pub fn ranges_seen(&self) -> Arc<Mutex<Vec<Option<String>>>> {
        Arc::clone(&self.ranges_seen)
    }

    fn decorate(&self, mut template: ResponseTemplate) -> ResponseTemplate {
        if let Some(etag) = &self.etag {
            template = template.insert_header("ETag", etag.as_str());
        }
        template.insert_header("Accept-Ranges", "bytes")
    }
}

impl Respond for RangedResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        // The body sets Content-Length; the server strips it for HEAD
        if request.method.as_str() == "HEAD" {
            return self.decorate(ResponseTemplate::new(200).set_body_bytes(self.body.clone()));
        }

        let range = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        self.ranges_seen.lock().push(range.clone());

        let total = self.body.len() as u64;
        let mut template = match range.as_deref().and_then(parse_range) {
            Some((start, _)) if start >= total => ResponseTemplate::new(416),
            Some((start, end)) => {
                let end = end.unwrap_or(total - 1).min(total - 1);
                let slice = self.body[start as usize..=end as usize].to_vec();
                self.decorate(
                    ResponseTemplate::new(206)
                        .insert_header(
                            "Content-Range",
                            format!("bytes {}-{}/{}", start, end, total).as_str(),
                        )
                        .set_body_bytes(slice),
                )
            }
            None => self.decorate(ResponseTemplate::new(200).set_body_bytes(self.body.clone())),
        };
        if let Some(delay) = self.delay {
            template = template.set_delay(delay);
        }
        template
    }
}

/// Parse `bytes=<start>-<end?>` from a request header
fn parse_range(header: &str) -> Option<(u64, Option<u64>)> {
    let rest = header.strip_prefix("bytes=")?;
    let (start, end) = rest.split_once('-')?;
    let start = start.parse::<u64>().ok()?;
    let end = if end.is_empty() {
        None
    } else {
        Some(end.parse::<u64>().ok()?)
    };
    Some((start, end))
}

/// Mount `responder` at `url_path` for every method. Returns the handle to
/// the recorded `Range` headers.
pub async fn mount_resource(
    server: &MockServer,
    url_path: &str,
    responder: RangedResponder,
) -> Arc<Mutex<Vec<Option<String>>>> {
    let ranges = responder.ranges_seen();
    Mock::given(path(url_path))
        .respond_with(responder)
        .mount(server)
        .await;
    ranges
}

/// Serve `body` at `url_path` with range support
pub async fn serve_ranged_file(
    server: &MockServer,
    url_path: &str,
    body: Vec<u8>,
    etag: Option<&str>,
) -> Arc<Mutex<Vec<Option<String>>>> {
    mount_resource(server, url_path, RangedResponder::new(body, etag)).await
}

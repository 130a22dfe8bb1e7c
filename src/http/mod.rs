//! HTTP download engine
//!
//! This module implements the resumable, range-aware download engine:
//! - [`DownloadConnection`]: one HTTP transfer of a byte range (or a whole
//!   resource) into a destination file, modeled as a state machine
//! - [`Downloader`]: orchestrates N connections against one destination
//!   file for a single logical download
//! - [`probe`]: server capability probing and `Range`/`Content-Range`
//!   wire-format helpers

pub mod connection;
pub mod downloader;
pub mod probe;

pub use connection::{ConnectionResult, ConnectionSpec, DownloadConnection};
pub use downloader::{DownloadOptions, DownloadResult, Downloader};
pub use probe::{probe_resource, ResourceInfo};

use crate::error::Result;
use crate::retry::RetryPolicy;
use futures::future::BoxFuture;
use std::path::PathBuf;
use std::sync::Arc;

/// A contiguous byte range of a remote resource.
///
/// `end` is inclusive; `None` leaves the range open to the end of the
/// resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn new(start: u64, end: Option<u64>) -> Self {
        Self { start, end }
    }

    /// Number of bytes covered, if the range is closed
    pub fn len(&self) -> Option<u64> {
        self.end.map(|end| end - self.start + 1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }
}

/// Why a URL resolution is being performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveTrigger {
    /// First fetch of the connection
    Initial,
    /// Automatic retry after a failure
    Retry,
    /// Resume after a pause (or a full restart)
    Resume,
}

/// Which triggers force the resolver to run again instead of reusing the
/// cached URL. Initial resolution always runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolutionPolicy {
    pub resolve_on_retry: bool,
    pub resolve_on_resume: bool,
}

impl Default for ResolutionPolicy {
    fn default() -> Self {
        // Fresh URLs by default: signed URLs tend to expire
        Self {
            resolve_on_retry: true,
            resolve_on_resume: true,
        }
    }
}

impl ResolutionPolicy {
    pub fn applies_to(&self, trigger: ResolveTrigger) -> bool {
        match trigger {
            ResolveTrigger::Initial => true,
            ResolveTrigger::Retry => self.resolve_on_retry,
            ResolveTrigger::Resume => self.resolve_on_resume,
        }
    }
}

/// Async URL resolver, e.g. for signed URLs that must be minted per fetch.
pub type UrlResolver =
    Arc<dyn Fn(ResolveTrigger) -> BoxFuture<'static, Result<String>> + Send + Sync>;

/// Source of the URL for a download: a literal, or a resolver invoked
/// according to the [`ResolutionPolicy`].
#[derive(Clone)]
pub enum UrlSource {
    Literal(String),
    Resolver(UrlResolver),
}

impl UrlSource {
    /// Wrap an async closure as a resolver source
    pub fn resolver<F, Fut>(f: F) -> Self
    where
        F: Fn(ResolveTrigger) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String>> + Send + 'static,
    {
        Self::Resolver(Arc::new(move |trigger| Box::pin(f(trigger))))
    }
}

impl std::fmt::Debug for UrlSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Literal(url) => f.debug_tuple("Literal").field(url).finish(),
            Self::Resolver(_) => f.write_str("Resolver(..)"),
        }
    }
}

impl From<String> for UrlSource {
    fn from(url: String) -> Self {
        Self::Literal(url)
    }
}

impl From<&str> for UrlSource {
    fn from(url: &str) -> Self {
        Self::Literal(url.to_string())
    }
}

/// One logical download request.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    /// Where the bytes come from
    pub url: UrlSource,
    /// Destination file path
    pub destination: PathBuf,
    /// Extra request headers applied to every fetch
    pub headers: Vec<(String, String)>,
    /// User agent override (engine default if `None`)
    pub user_agent: Option<String>,
    /// Upper bound on parallel connections
    pub max_connections: usize,
    /// Outer tier: whole-download retries, applied by the task manager
    pub retry_policy: RetryPolicy,
    /// Inner tier: per-connection byte-range retries
    pub connection_retry_policy: RetryPolicy,
    /// When to re-run the URL resolver
    pub resolution_policy: ResolutionPolicy,
}

impl DownloadRequest {
    pub fn new(url: impl Into<UrlSource>, destination: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            destination: destination.into(),
            headers: Vec::new(),
            user_agent: None,
            max_connections: 4,
            retry_policy: RetryPolicy::task_default(),
            connection_retry_policy: RetryPolicy::connection_default(),
            resolution_policy: ResolutionPolicy::default(),
        }
    }

    pub fn with_max_connections(mut self, n: usize) -> Self {
        self.max_connections = n.max(1);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_connection_retry(mut self, policy: RetryPolicy) -> Self {
        self.connection_retry_policy = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_range_len() {
        assert_eq!(ByteRange::new(0, Some(999)).len(), Some(1000));
        assert_eq!(ByteRange::new(1000, None).len(), None);
        assert_eq!(ByteRange::new(10, Some(10)).len(), Some(1));
    }

    #[test]
    fn test_resolution_policy() {
        let policy = ResolutionPolicy {
            resolve_on_retry: false,
            resolve_on_resume: true,
        };
        assert!(policy.applies_to(ResolveTrigger::Initial));
        assert!(!policy.applies_to(ResolveTrigger::Retry));
        assert!(policy.applies_to(ResolveTrigger::Resume));
    }

    #[test]
    fn test_request_builder() {
        let req = DownloadRequest::new("https://example.com/file.bin", "/tmp/file.bin")
            .with_max_connections(0)
            .with_header("Referer", "https://example.com");
        // Connection count is clamped to at least one
        assert_eq!(req.max_connections, 1);
        assert_eq!(req.headers.len(), 1);
    }
}

//! Resource probing and partial-content wire formats
//!
//! Before a download starts, the resource is probed for `Content-Length`,
//! `ETag` and range support. Servers that reject HEAD with `405` get a
//! tiny ranged GET (`Range: bytes=0-1`) instead, which exposes the same
//! headers via `Content-Range`.

use crate::error::{EngineError, Result};
use reqwest::{Client, StatusCode};

/// What the probe learned about the remote resource
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceInfo {
    /// Total size in bytes, if advertised
    pub content_length: Option<u64>,
    /// Whether the server accepts byte-range requests
    pub supports_range: bool,
    /// Entity tag captured for resume-consistency checks
    pub etag: Option<String>,
}

/// Probe a resource with a HEAD request, falling back to a ranged GET when
/// the server rejects metadata-only probing.
pub async fn probe_resource(
    client: &Client,
    url: &str,
    user_agent: &str,
    headers: &[(String, String)],
) -> Result<ResourceInfo> {
    let mut request = client.head(url).header("User-Agent", user_agent);
    for (name, value) in headers {
        request = request.header(name.as_str(), value.as_str());
    }

    let response = request.send().await.map_err(|e| {
        EngineError::network(None, format!("HEAD request failed: {}", e), true)
    })?;

    let status = response.status();
    if status == StatusCode::METHOD_NOT_ALLOWED {
        tracing::debug!(url, "HEAD rejected with 405, probing with ranged GET");
        return probe_with_ranged_get(client, url, user_agent, headers).await;
    }
    if !status.is_success() {
        return Err(EngineError::network(
            Some(status.as_u16()),
            format!("HEAD request returned: {}", status),
            false,
        ));
    }

    let headers = response.headers();
    Ok(ResourceInfo {
        content_length: header_u64(headers, "content-length"),
        supports_range: accepts_byte_ranges(headers),
        etag: header_string(headers, "etag"),
    })
}

/// Fallback probe: request the first two bytes and read the total size out
/// of `Content-Range`.
async fn probe_with_ranged_get(
    client: &Client,
    url: &str,
    user_agent: &str,
    headers: &[(String, String)],
) -> Result<ResourceInfo> {
    let mut request = client
        .get(url)
        .header("User-Agent", user_agent)
        .header("Range", "bytes=0-1");
    for (name, value) in headers {
        request = request.header(name.as_str(), value.as_str());
    }

    let response = request.send().await.map_err(|e| {
        EngineError::network(None, format!("Probe request failed: {}", e), true)
    })?;

    let status = response.status();
    if status == StatusCode::PARTIAL_CONTENT {
        let headers = response.headers();
        let total = header_string(headers, "content-range")
            .as_deref()
            .and_then(parse_content_range)
            .and_then(|(_, _, total)| total);
        return Ok(ResourceInfo {
            content_length: total,
            supports_range: true,
            etag: header_string(headers, "etag"),
        });
    }
    if status.is_success() {
        // Server ignored the range: no resume, but the size may be known
        let headers = response.headers();
        return Ok(ResourceInfo {
            content_length: header_u64(headers, "content-length"),
            supports_range: false,
            etag: header_string(headers, "etag"),
        });
    }

    Err(EngineError::network(
        Some(status.as_u16()),
        format!("Probe request returned: {}", status),
        false,
    ))
}

/// Format a `Range` request header value
pub fn range_header(start: u64, end: Option<u64>) -> String {
    match end {
        Some(end) => format!("bytes={}-{}", start, end),
        None => format!("bytes={}-", start),
    }
}

/// Parse a `Content-Range` header.
///
/// Format: `bytes start-end/total` or `bytes start-end/*`. Returns
/// `(start, end, total)`.
pub fn parse_content_range(header: &str) -> Option<(u64, u64, Option<u64>)> {
    let rest = header.strip_prefix("bytes ")?;
    let (range, total) = rest.split_once('/')?;
    let (start, end) = range.split_once('-')?;

    let start = start.parse::<u64>().ok()?;
    let end = end.parse::<u64>().ok()?;
    let total = if total == "*" {
        None
    } else {
        Some(total.parse::<u64>().ok()?)
    };

    Some((start, end, total))
}

/// Whether an `Accept-Ranges` header advertises byte-range support
pub fn accepts_byte_ranges(headers: &reqwest::header::HeaderMap) -> bool {
    headers
        .get("accept-ranges")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("bytes"))
        .unwrap_or(false)
}

fn header_u64(headers: &reqwest::header::HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
}

fn header_string(headers: &reqwest::header::HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_header() {
        assert_eq!(range_header(0, None), "bytes=0-");
        assert_eq!(range_header(100, None), "bytes=100-");
        assert_eq!(range_header(0, Some(99)), "bytes=0-99");
        assert_eq!(range_header(1000, Some(1999)), "bytes=1000-1999");
    }

    #[test]
    fn test_parse_content_range() {
        assert_eq!(parse_content_range("bytes 0-99/100"), Some((0, 99, Some(100))));
        assert_eq!(
            parse_content_range("bytes 100-199/1000"),
            Some((100, 199, Some(1000)))
        );
        assert_eq!(parse_content_range("bytes 0-99/*"), Some((0, 99, None)));
        assert_eq!(parse_content_range("invalid"), None);
        assert_eq!(parse_content_range("bytes nonsense"), None);
        assert_eq!(parse_content_range("bytes 0-99"), None);
    }

    #[test]
    fn test_accepts_byte_ranges() {
        let mut headers = reqwest::header::HeaderMap::new();
        assert!(!accepts_byte_ranges(&headers));
        headers.insert("accept-ranges", "none".parse().unwrap());
        assert!(!accepts_byte_ranges(&headers));
        headers.insert("accept-ranges", "bytes".parse().unwrap());
        assert!(accepts_byte_ranges(&headers));
    }
}

//! Response header parsing.

use std::time::{Duration, SystemTime};

use reqwest::header::{
    CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, ETAG, HeaderMap, LOCATION,
    RETRY_AFTER, TRANSFER_ENCODING,
};
use tracing::debug;

/// Header values the worker acts on, extracted once per response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseMeta {
    pub etag: Option<String>,
    /// Normalized MIME type (lowercase, parameters stripped).
    pub mime_type: Option<String>,
    pub content_disposition: Option<String>,
    pub content_location: Option<String>,
    pub content_length: Option<u64>,
    pub content_range: Option<ContentRange>,
    /// `Transfer-Encoding: chunked` was present.
    pub chunked: bool,
    pub location: Option<String>,
    pub retry_after: Option<String>,
}

impl ResponseMeta {
    /// Extracts the relevant headers from `headers`.
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let text = |name| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        Self {
            etag: text(ETAG),
            mime_type: text(CONTENT_TYPE).and_then(|ct| normalize_mime_type(&ct)),
            content_disposition: text(CONTENT_DISPOSITION),
            content_location: headers
                .get("content-location")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            content_length: text(CONTENT_LENGTH).and_then(|v| v.parse().ok()),
            content_range: text(CONTENT_RANGE).and_then(|v| parse_content_range(&v)),
            chunked: text(TRANSFER_ENCODING)
                .is_some_and(|te| te.to_ascii_lowercase().contains("chunked")),
            location: text(LOCATION),
            retry_after: text(RETRY_AFTER),
        }
    }

    /// Total resource size: the Content-Range denominator, else Content-Length.
    ///
    /// For a ranged response without a usable denominator the total is
    /// `resume_offset + Content-Length`.
    #[must_use]
    pub fn total_length(&self, resume_offset: u64) -> Option<u64> {
        if let Some(range) = &self.content_range {
            if let Some(total) = range.total {
                return Some(total);
            }
            return self
                .content_length
                .map(|len| range.start.saturating_add(len));
        }
        self.content_length.map(|len| resume_offset.saturating_add(len))
    }

    /// True when the response says how its body ends.
    #[must_use]
    pub fn has_size_signal(&self) -> bool {
        self.chunked || self.content_length.is_some() || self.content_range.is_some()
    }
}

/// Parsed `Content-Range: bytes <start>-<end>/<total|*>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub total: Option<u64>,
}

/// Parses a `Content-Range` header value.
#[must_use]
pub fn parse_content_range(value: &str) -> Option<ContentRange> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = rest.split_once('/')?;
    let (start, end) = range.trim().split_once('-')?;
    let start = start.trim().parse().ok()?;
    let end = end.trim().parse().ok()?;
    if end < start {
        return None;
    }
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    Some(ContentRange { start, end, total })
}

/// Strips parameters and lowercases a `Content-Type` value.
#[must_use]
pub fn normalize_mime_type(content_type: &str) -> Option<String> {
    let mime = content_type.split(';').next()?.trim().to_ascii_lowercase();
    if mime.is_empty() || !mime.contains('/') {
        None
    } else {
        Some(mime)
    }
}

/// Parses a `Retry-After` value (delta-seconds or HTTP-date) into a delay from `now`.
///
/// Negative values, past dates and unparsable text yield `None`.
#[must_use]
pub fn parse_retry_after(header_value: &str, now: SystemTime) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        }
        return Some(Duration::from_secs(seconds.unsigned_abs()));
    }

    match httpdate::parse_http_date(header_value) {
        Ok(datetime) => datetime.duration_since(now).ok(),
        Err(_) => {
            debug!(header_value, "unparsable Retry-After value");
            None
        }
    }
}

/// Extracts the filename from a `Content-Disposition` value.
///
/// Handles both `filename*=UTF-8''encoded` (preferred) and `filename=`,
/// quoted or not. Parameter names are case-insensitive.
#[must_use]
pub fn parse_content_disposition(header: &str) -> Option<String> {
    let lower = header.to_ascii_lowercase();

    if let Some(pos) = lower.find("filename*=") {
        let value = header[pos + 10..].trim();
        if let Some(quote_pos) = value.find("''") {
            let encoded = &value[quote_pos + 2..];
            let end = encoded.find(';').unwrap_or(encoded.len());
            let encoded_name = encoded[..end].trim().trim_matches('"');
            if let Ok(decoded) = urlencoding::decode(encoded_name)
                && !decoded.is_empty()
            {
                return Some(decoded.into_owned());
            }
        }
    }

    let mut search_from = 0;
    while let Some(rel) = lower[search_from..].find("filename=") {
        let pos = search_from + rel;
        search_from = pos + 9;
        // skip the `filename=` inside `filename*=`
        if pos > 0 && lower.as_bytes()[pos - 1] == b'*' {
            continue;
        }
        let value = header[pos + 9..].trim();
        if let Some(stripped) = value.strip_prefix('"') {
            if let Some(end) = stripped.find('"') {
                let name = &stripped[..end];
                if !name.is_empty() {
                    return Some(name.to_string());
                }
            }
        } else {
            let end = value.find(';').unwrap_or(value.len());
            let filename = value[..end].trim();
            if !filename.is_empty() {
                return Some(filename.to_string());
            }
        }
    }

    None
}

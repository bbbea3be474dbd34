//! Destination path resolution.
//!
//! Given a storage root and naming hints gathered from the request and the
//! first response, derives a filename, fixes its extension against the
//! negotiated MIME type and reserves a path that did not exist before.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};

use rand::Rng;
use thiserror::Error;
use tracing::{debug, instrument};
use url::Url;

use super::constants::DEFAULT_FILENAME;
use super::headers::parse_content_disposition;
use super::mime::{extension_matches_mime, fallback_extension};
use crate::record::DownloadStatus;

/// Sequence magnitude at which collision resolution gives up.
const MAX_SEQUENCE_MAGNITUDE: u64 = 1_000_000_000;

/// Attempts per sequence magnitude.
const ATTEMPTS_PER_MAGNITUDE: u32 = 9;

/// Errors from destination resolution.
#[derive(Debug, Error)]
pub enum DestinationError {
    /// Caller-given destination already exists.
    #[error("destination already exists: {path}")]
    AlreadyExists {
        /// The existing path.
        path: PathBuf,
    },

    /// Explicit destination is not a `file://` URI.
    #[error("destination '{hint}' is not a file:// URI")]
    NotFileUri {
        /// The rejected hint.
        hint: String,
    },

    /// Every sequence number tried was taken.
    #[error("no free filename for {base}{extension} under {root}")]
    Exhausted {
        root: PathBuf,
        base: String,
        extension: String,
    },

    /// Reserving the path failed.
    #[error("IO error reserving {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl DestinationError {
    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Record status this error terminates a download with.
    #[must_use]
    pub fn status(&self) -> DownloadStatus {
        match self {
            Self::AlreadyExists { .. } => DownloadStatus::FileAlreadyExists,
            Self::Io { source, .. } if super::error::is_storage_full(source) => {
                DownloadStatus::InsufficientSpace
            }
            Self::NotFileUri { .. } | Self::Exhausted { .. } | Self::Io { .. } => {
                DownloadStatus::FileError
            }
        }
    }
}

/// Inputs for filename derivation, in precedence order.
#[derive(Debug, Clone, Copy, Default)]
pub struct NamingHints<'a> {
    /// Caller filename hint.
    pub hint: Option<&'a str>,
    /// Raw `Content-Disposition` value.
    pub content_disposition: Option<&'a str>,
    /// Raw `Content-Location` value.
    pub content_location: Option<&'a str>,
    /// URI the response was fetched from.
    pub request_uri: Option<&'a str>,
    /// Negotiated MIME type.
    pub mime_type: Option<&'a str>,
}

/// Derives the sanitized filename (with corrected extension) for `hints`.
#[must_use]
pub fn choose_filename(hints: &NamingHints<'_>) -> String {
    let raw = raw_filename(hints);
    let name = sanitize_filename(&raw);
    let (base, extension) = split_extension(&name);
    let extension = choose_extension(extension, hints.mime_type);
    format!("{base}{extension}")
}

/// Resolves and reserves a unique path under `root`.
///
/// The returned path exists (as an empty file) when this returns, so two
/// resolutions never hand out the same path.
///
/// # Errors
///
/// Returns [`DestinationError::Exhausted`] when no sequence number is free,
/// or [`DestinationError::Io`] if the path cannot be created.
#[instrument(skip(hints), fields(root = %root.display()))]
pub fn resolve_destination(root: &Path, hints: &NamingHints<'_>) -> Result<PathBuf, DestinationError> {
    let name = choose_filename(hints);
    let (base, extension) = split_extension(&name);

    let plain = root.join(&name);
    if try_reserve(&plain)? {
        debug!(path = %plain.display(), "reserved destination");
        return Ok(plain);
    }

    let mut rng = rand::thread_rng();
    let mut sequence: u64 = 1;
    let mut magnitude: u64 = 1;
    while magnitude < MAX_SEQUENCE_MAGNITUDE {
        for _ in 0..ATTEMPTS_PER_MAGNITUDE {
            let candidate = root.join(format!("{base}-{sequence}{extension}"));
            if try_reserve(&candidate)? {
                debug!(path = %candidate.display(), sequence, "reserved destination");
                return Ok(candidate);
            }
            sequence += rng.gen_range(1..=magnitude);
        }
        magnitude *= 10;
    }

    Err(DestinationError::Exhausted {
        root: root.to_path_buf(),
        base: base.to_string(),
        extension: extension.to_string(),
    })
}

/// Parses an explicit `file://` destination hint into a path.
///
/// # Errors
///
/// Returns [`DestinationError::NotFileUri`] for anything but a `file://` URI.
pub fn explicit_path(hint: Option<&str>) -> Result<PathBuf, DestinationError> {
    let not_file = || DestinationError::NotFileUri {
        hint: hint.unwrap_or_default().to_string(),
    };
    let url = Url::parse(hint.ok_or_else(not_file)?).map_err(|_| not_file())?;
    if url.scheme() != "file" {
        return Err(not_file());
    }
    url.to_file_path().map_err(|()| not_file())
}

/// Reserves the caller-given `file://` destination.
///
/// # Errors
///
/// Returns [`DestinationError::AlreadyExists`] if the path exists,
/// [`DestinationError::NotFileUri`] for non-file hints, or
/// [`DestinationError::Io`] if the path cannot be created.
#[instrument]
pub fn resolve_explicit(hint: Option<&str>) -> Result<PathBuf, DestinationError> {
    let path = explicit_path(hint)?;
    if try_reserve(&path)? {
        Ok(path)
    } else {
        Err(DestinationError::AlreadyExists { path })
    }
}

/// Creates `path` exclusively; `Ok(false)` if it already exists.
fn try_reserve(path: &Path) -> Result<bool, DestinationError> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(DestinationError::io(path, e)),
    }
}

/// First usable name candidate, before sanitization.
fn raw_filename(hints: &NamingHints<'_>) -> String {
    if let Some(name) = hints.hint.and_then(last_segment) {
        return name;
    }

    if let Some(name) = hints
        .content_disposition
        .and_then(parse_content_disposition)
        .as_deref()
        .and_then(last_segment)
    {
        return name;
    }

    if let Some(location) = hints.content_location
        && !location.contains('?')
        && let Some(name) = decode(location).as_deref().and_then(last_segment)
    {
        return name;
    }

    if let Some(uri) = hints.request_uri
        && let Ok(url) = Url::parse(uri)
        && url.query().is_none()
        && let Some(name) = decode(url.path()).as_deref().and_then(last_segment)
    {
        return name;
    }

    DEFAULT_FILENAME.to_string()
}

/// Text after the last `/`; `None` for empty or directory-like values.
fn last_segment(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() || value.ends_with('/') {
        return None;
    }
    let segment = value.rsplit('/').next().unwrap_or(value);
    if segment.is_empty() {
        None
    } else {
        Some(segment.to_string())
    }
}

fn decode(value: &str) -> Option<String> {
    urlencoding::decode(value).ok().map(std::borrow::Cow::into_owned)
}

/// Replaces filesystem- and URL-unsafe characters with `_`.
///
/// Names made only of dots are neutralised.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '"' | '*' | '/' | ':' | '<' | '>' | '?' | '\\' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if sanitized.is_empty() {
        return DEFAULT_FILENAME.to_string();
    }
    if sanitized.chars().all(|c| c == '.') {
        return sanitized.replace('.', "_");
    }
    sanitized
}

/// Splits at the rightmost dot; a leading dot is part of the base.
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(pos) if pos > 0 => (&name[..pos], &name[pos..]),
        _ => (name, ""),
    }
}

fn choose_extension(existing: &str, mime: Option<&str>) -> String {
    match (existing.is_empty(), mime) {
        (false, None) => existing.to_string(),
        (false, Some(mime)) if extension_matches_mime(existing, mime) => existing.to_string(),
        _ => fallback_extension(mime),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn hints<'a>() -> NamingHints<'a> {
        NamingHints::default()
    }

    #[test]
    fn test_hint_takes_precedence() {
        let h = NamingHints {
            hint: Some("notes.txt"),
            content_disposition: Some(r#"attachment; filename="server.txt""#),
            request_uri: Some("https://example.com/url.txt"),
            ..hints()
        };
        assert_eq!(choose_filename(&h), "notes.txt");
    }

    #[test]
    fn test_hint_ending_in_slash_falls_through() {
        let h = NamingHints {
            hint: Some("some/dir/"),
            content_disposition: Some(r#"attachment; filename="server.pdf""#),
            mime_type: Some("application/pdf"),
            ..hints()
        };
        assert_eq!(choose_filename(&h), "server.pdf");
    }

    #[test]
    fn test_hint_keeps_only_last_segment() {
        let h = NamingHints {
            hint: Some("../../etc/passwd"),
            ..hints()
        };
        assert_eq!(choose_filename(&h), "passwd.bin");
    }

    #[test]
    fn test_content_location_with_query_is_skipped() {
        let h = NamingHints {
            content_location: Some("/files/loc.zip?token=1"),
            request_uri: Some("https://example.com/get/final%20name.zip"),
            mime_type: Some("application/zip"),
            ..hints()
        };
        assert_eq!(choose_filename(&h), "final name.zip");
    }

    #[test]
    fn test_request_uri_with_query_falls_back_to_default() {
        let h = NamingHints {
            request_uri: Some("https://example.com/download?id=5"),
            mime_type: Some("text/html"),
            ..hints()
        };
        assert_eq!(choose_filename(&h), "downloadfile.html");
    }

    #[test]
    fn test_extension_replaced_when_mime_disagrees() {
        let h = NamingHints {
            hint: Some("page.php"),
            mime_type: Some("text/html"),
            ..hints()
        };
        assert_eq!(choose_filename(&h), "page.html");

        let h = NamingHints {
            hint: Some("data.weird"),
            mime_type: Some("text/x-log"),
            ..hints()
        };
        assert_eq!(choose_filename(&h), "data.txt");
    }

    #[test]
    fn test_extension_kept_without_mime() {
        let h = NamingHints {
            hint: Some("archive.tar.xz"),
            ..hints()
        };
        assert_eq!(choose_filename(&h), "archive.tar.xz");
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("a:b*c?.txt"), "a_b_c_.txt");
        assert_eq!(sanitize_filename(".."), "__");
        assert_eq!(sanitize_filename("tab\there"), "tab_here");
    }

    #[test]
    fn test_resolve_reserves_plain_name_first() {
        let dir = TempDir::new().unwrap();
        let h = NamingHints {
            hint: Some("file.bin"),
            ..hints()
        };
        let path = resolve_destination(dir.path(), &h).unwrap();
        assert_eq!(path, dir.path().join("file.bin"));
        assert!(path.exists());
    }

    #[test]
    fn test_resolve_never_returns_same_path_twice() {
        let dir = TempDir::new().unwrap();
        let h = NamingHints {
            hint: Some("same.bin"),
            ..hints()
        };
        let mut seen = HashSet::new();
        for _ in 0..30 {
            let path = resolve_destination(dir.path(), &h).unwrap();
            assert!(seen.insert(path.clone()), "duplicate path {}", path.display());
            let name = path.file_name().unwrap().to_string_lossy().to_string();
            assert!(name == "same.bin" || (name.starts_with("same-") && name.ends_with(".bin")));
        }
    }

    #[test]
    fn test_first_collision_uses_sequence_one() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("x.bin"), b"taken").unwrap();
        let h = NamingHints {
            hint: Some("x.bin"),
            ..hints()
        };
        let path = resolve_destination(dir.path(), &h).unwrap();
        assert_eq!(path, dir.path().join("x-1.bin"));
    }

    #[test]
    fn test_explicit_destination() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("exact.bin");
        let uri = Url::from_file_path(&target).unwrap().to_string();

        let path = resolve_explicit(Some(&uri)).unwrap();
        assert_eq!(path, target);

        let err = resolve_explicit(Some(&uri)).unwrap_err();
        assert_eq!(err.status(), DownloadStatus::FileAlreadyExists);
    }

    #[test]
    fn test_explicit_destination_requires_file_uri() {
        let err = resolve_explicit(Some("https://example.com/a")).unwrap_err();
        assert_eq!(err.status(), DownloadStatus::FileError);
        assert!(matches!(
            resolve_explicit(None).unwrap_err(),
            DestinationError::NotFileUri { .. }
        ));
    }
}

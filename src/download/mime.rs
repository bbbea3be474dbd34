//! MIME type and filename extension mapping.

/// `(mime type, canonical extension, other extensions)`.
const MIME_TABLE: &[(&str, &str, &[&str])] = &[
    ("text/html", "html", &["htm"]),
    ("text/plain", "txt", &["text", "log"]),
    ("text/css", "css", &[]),
    ("text/csv", "csv", &[]),
    ("text/xml", "xml", &[]),
    ("text/javascript", "js", &["mjs"]),
    ("application/javascript", "js", &["mjs"]),
    ("application/json", "json", &[]),
    ("application/xml", "xml", &[]),
    ("application/pdf", "pdf", &[]),
    ("application/zip", "zip", &[]),
    ("application/gzip", "gz", &["tgz"]),
    ("application/x-tar", "tar", &[]),
    ("application/x-7z-compressed", "7z", &[]),
    ("application/vnd.android.package-archive", "apk", &[]),
    ("application/epub+zip", "epub", &[]),
    ("application/msword", "doc", &[]),
    (
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "docx",
        &[],
    ),
    ("application/octet-stream", "bin", &["dat"]),
    ("image/jpeg", "jpg", &["jpeg", "jpe"]),
    ("image/png", "png", &[]),
    ("image/gif", "gif", &[]),
    ("image/webp", "webp", &[]),
    ("image/svg+xml", "svg", &[]),
    ("audio/mpeg", "mp3", &[]),
    ("audio/ogg", "ogg", &["oga"]),
    ("video/mp4", "mp4", &["m4v"]),
    ("video/webm", "webm", &[]),
];

/// Canonical extension (without dot) for a MIME type.
#[must_use]
pub fn extension_for_mime(mime: &str) -> Option<&'static str> {
    MIME_TABLE
        .iter()
        .find(|(m, _, _)| m.eq_ignore_ascii_case(mime))
        .map(|(_, ext, _)| *ext)
}

/// MIME type for an extension (with or without leading dot).
#[must_use]
pub fn mime_for_extension(extension: &str) -> Option<&'static str> {
    let ext = extension.trim_start_matches('.');
    MIME_TABLE
        .iter()
        .find(|(_, canonical, others)| {
            canonical.eq_ignore_ascii_case(ext) || others.iter().any(|o| o.eq_ignore_ascii_case(ext))
        })
        .map(|(mime, _, _)| *mime)
}

/// True when `extension` is registered for `mime`.
#[must_use]
pub fn extension_matches_mime(extension: &str, mime: &str) -> bool {
    let ext = extension.trim_start_matches('.');
    MIME_TABLE.iter().any(|(m, canonical, others)| {
        m.eq_ignore_ascii_case(mime)
            && (canonical.eq_ignore_ascii_case(ext)
                || others.iter().any(|o| o.eq_ignore_ascii_case(ext)))
    })
}

/// Extension (with dot) to use for `mime` when the filename's own extension
/// does not fit.
///
/// Falls back to `.html` for `text/html`, `.txt` for other text types and
/// `.bin` for everything else.
#[must_use]
pub fn fallback_extension(mime: Option<&str>) -> String {
    if let Some(mime) = mime {
        if let Some(ext) = extension_for_mime(mime) {
            return format!(".{ext}");
        }
        let lower = mime.to_ascii_lowercase();
        if lower == "text/html" {
            return ".html".to_string();
        }
        if lower.starts_with("text/") {
            return ".txt".to_string();
        }
    }
    ".bin".to_string()
}

//! User-Agent string for transfer requests.

/// Project URL for User-Agent identification (RFC 9308).
const PROJECT_UA_URL: &str = "https://github.com/fierce/fetchkeeper";

/// Default User-Agent for download requests.
#[must_use]
pub(crate) fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("fetchkeeper/{version} (+{PROJECT_UA_URL})")
}

use std::net::TcpListener;
use std::panic::Location;

use wiremock::MockServer;

/// Socket-bound tests fail instead of skipping when this is set.
#[must_use]
pub fn socket_tests_required() -> bool {
    std::env::var("FETCHKEEPER_REQUIRE_SOCKET_TESTS")
        .ok()
        .is_some_and(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
}

/// Starts a mock server, or returns `None` where localhost cannot be bound.
#[track_caller]
pub fn start_mock_server_or_skip() -> impl Future<Output = Option<MockServer>> {
    let location = Location::caller();
    async move {
        if TcpListener::bind("127.0.0.1:0").is_ok() {
            return Some(MockServer::start().await);
        }
        let message = format!(
            "[socket-bound-test] no localhost socket for {}:{}",
            location.file(),
            location.line()
        );
        assert!(
            !socket_tests_required(),
            "{message}; unset FETCHKEEPER_REQUIRE_SOCKET_TESTS to skip"
        );
        eprintln!("{message}; skipping");
        None
    }
}

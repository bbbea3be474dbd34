//! Integration tests for the download engine.
//!
//! These drive `DownloadEngine` against a file-backed database and a wiremock
//! server, checking what ends up on the record and on disk.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fetchkeeper_core::storage::SpaceProbe;
use fetchkeeper_core::{
    Advisory, Control, Database, DestinationPolicy, DownloadEngine, DownloadRecord,
    DownloadStatus, EngineConfig, HostSystem, NetworkInfo, NewDownload, RecordStore, RecordUpdate,
    RootPreference, StorageAllocator, StorageLayout,
};
use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, Request, Respond, ResponseTemplate};

mod support;
use support::socket_guard::start_mock_server_or_skip;

macro_rules! require_mock_server {
    () => {{
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return Ok(());
        };
        mock_server
    }};
}

type TestResult = Result<(), Box<dyn std::error::Error>>;

/// Reports plenty of room everywhere so tests never depend on the host disk.
struct AmpleSpace;

impl SpaceProbe for AmpleSpace {
    fn available_bytes(&self, _path: &Path) -> io::Result<u64> {
        Ok(1 << 40)
    }

    fn total_bytes(&self, _path: &Path) -> io::Result<u64> {
        Ok(1 << 41)
    }
}

struct Fixture {
    engine: Arc<DownloadEngine>,
    system: Arc<HostSystem>,
    dir: TempDir,
}

impl Fixture {
    async fn record(&self, id: i64) -> Result<DownloadRecord, Box<dyn std::error::Error>> {
        Ok(self.engine.record(id).await?.ok_or("record missing")?)
    }

    fn private_files(&self) -> Vec<PathBuf> {
        std::fs::read_dir(self.dir.path().join("private"))
            .map(|entries| entries.filter_map(|e| e.ok().map(|e| e.path())).collect())
            .unwrap_or_default()
    }
}

async fn setup(
    config: EngineConfig,
    system: HostSystem,
) -> Result<Fixture, Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let db = Database::new(&dir.path().join("test.db")).await?;
    let allocator = StorageAllocator::new(StorageLayout::under(dir.path()), RootPreference::Auto)
        .with_probe(Arc::new(AmpleSpace));
    let system = Arc::new(system);
    let engine = DownloadEngine::new(RecordStore::new(db), allocator, system.clone(), config)?;
    Ok(Fixture {
        engine: Arc::new(engine),
        system,
        dir,
    })
}

async fn setup_default() -> Result<Fixture, Box<dyn std::error::Error>> {
    setup(EngineConfig::default(), HostSystem::new()).await
}

/// Waits until the engine reports a running worker.
async fn wait_for_active_worker(engine: &DownloadEngine) {
    for _ in 0..200 {
        if engine.active_workers() > 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("worker never started");
}

fn body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Leaves `prefix` on disk as the partial file of record `id`.
async fn seed_partial(
    fx: &Fixture,
    id: i64,
    name: &str,
    prefix: &[u8],
    total: i64,
    etag: &str,
) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let private = fx.dir.path().join("private");
    std::fs::create_dir_all(&private)?;
    let partial = private.join(name);
    std::fs::write(&partial, prefix)?;
    fx.engine
        .writer()
        .update(
            id,
            RecordUpdate::new()
                .local_path(Some(partial.display().to_string()))
                .current_bytes(u64::try_from(prefix.len())?)
                .total_bytes(Some(u64::try_from(total)?))
                .etag(Some(etag.to_string())),
        )
        .await?;
    Ok(partial)
}

/// Waits until some file in the private area holds at least `min` bytes.
async fn wait_for_bytes_on_disk(fx: &Fixture, min: u64) {
    for _ in 0..1000 {
        let written = fx
            .private_files()
            .iter()
            .filter_map(|p| std::fs::metadata(p).ok())
            .any(|m| m.len() >= min);
        if written {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("no partial file reached {min} bytes");
}

// ==================== Plain Transfers ====================

#[tokio::test]
async fn test_single_download_success() -> TestResult {
    let fx = setup_default().await?;
    let mock_server = require_mock_server!();
    let content = body(10_000);
    Mock::given(method("GET"))
        .and(path("/file.bin"))
        .and(header("Accept-Encoding", "identity"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", "\"v1\"")
                .set_body_bytes(content.clone()),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let mut advisories = fx.engine.subscribe_advisories();
    let id = fx
        .engine
        .enqueue(NewDownload::new(format!("{}/file.bin", mock_server.uri())))
        .await?;
    let stats = fx.engine.process_ready().await?;

    assert_eq!(stats.completed(), 1);
    assert_eq!(stats.total(), 1);

    let record = fx.record(id).await?;
    assert_eq!(record.status(), DownloadStatus::Success);
    assert_eq!(record.current_bytes, 10_000);
    assert_eq!(record.total_bytes, record.current_bytes);
    assert_eq!(record.etag.as_deref(), Some("\"v1\""));

    let path = record.local_file().ok_or("no local path")?;
    assert!(path.starts_with(fx.dir.path().join("private")));
    assert_eq!(std::fs::read(&path)?, content);

    // No external volume is configured, so the private area is a fallback.
    match advisories.try_recv()? {
        Advisory::StorageFallback { id: advised, .. } => assert_eq!(advised, id),
        other => panic!("unexpected advisory {other:?}"),
    }
    assert_eq!(fx.system.active_holds(), 0);
    assert_eq!(fx.engine.active_workers(), 0);
    Ok(())
}

#[tokio::test]
async fn test_http_error_is_terminal() -> TestResult {
    let fx = setup_default().await?;
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock_server)
        .await;

    let id = fx
        .engine
        .enqueue(NewDownload::new(format!("{}/missing", mock_server.uri())))
        .await?;
    let stats = fx.engine.process_ready().await?;

    assert_eq!(stats.failed(), 1);
    let record = fx.record(id).await?;
    assert_eq!(record.status(), DownloadStatus::HttpError(404));
    assert!(record.failed_reason.as_deref().is_some_and(|r| r.contains("404")));
    assert_eq!(fx.engine.next_wakeup().await?, None);
    assert_eq!(fx.system.active_holds(), 0);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_downloads_all_complete() -> TestResult {
    let config = EngineConfig {
        max_concurrent_downloads: 3,
        ..EngineConfig::default()
    };
    let fx = setup(config, HostSystem::new()).await?;
    let mock_server = require_mock_server!();
    for i in 0..6 {
        Mock::given(method("GET"))
            .and(path(format!("/f{i}.bin")))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(body(100 + i))
                    .set_delay(Duration::from_millis(20)),
            )
            .mount(&mock_server)
            .await;
    }

    let mut ids = Vec::new();
    for i in 0..6 {
        ids.push(
            fx.engine
                .enqueue(NewDownload::new(format!("{}/f{i}.bin", mock_server.uri())))
                .await?,
        );
    }
    let stats = fx.engine.process_ready().await?;
    assert_eq!(stats.completed(), 6);

    let mut paths = Vec::new();
    for (i, id) in ids.into_iter().enumerate() {
        let record = fx.record(id).await?;
        assert_eq!(record.status(), DownloadStatus::Success);
        assert_eq!(record.current_bytes, i64::try_from(100 + i)?);
        paths.push(record.local_path.ok_or("no local path")?);
    }
    paths.sort();
    paths.dedup();
    assert_eq!(paths.len(), 6);
    Ok(())
}

// ==================== Redirects ====================

#[tokio::test]
async fn test_permanent_redirect_updates_source() -> TestResult {
    let fx = setup_default().await?;
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path("/old"))
        .respond_with(ResponseTemplate::new(301).insert_header("Location", "/new"))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/new"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"moved".to_vec()))
        .mount(&mock_server)
        .await;

    let id = fx
        .engine
        .enqueue(NewDownload::new(format!("{}/old", mock_server.uri())))
        .await?;
    fx.engine.process_ready().await?;

    let record = fx.record(id).await?;
    assert_eq!(record.status(), DownloadStatus::Success);
    assert_eq!(record.source_uri, format!("{}/new", mock_server.uri()));
    assert_eq!(record.redirect_count, 1);
    Ok(())
}

#[tokio::test]
async fn test_temporary_redirect_keeps_source() -> TestResult {
    let fx = setup_default().await?;
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path("/old"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", "/elsewhere"))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/elsewhere"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"here".to_vec()))
        .mount(&mock_server)
        .await;

    let source = format!("{}/old", mock_server.uri());
    let id = fx.engine.enqueue(NewDownload::new(source.clone())).await?;
    fx.engine.process_ready().await?;

    let record = fx.record(id).await?;
    assert_eq!(record.status(), DownloadStatus::Success);
    assert_eq!(record.source_uri, source);
    Ok(())
}

#[tokio::test]
async fn test_redirect_loop_stops_at_ceiling() -> TestResult {
    let fx = setup_default().await?;
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path("/loop"))
        .respond_with(ResponseTemplate::new(307).insert_header("Location", "/loop"))
        .expect(6)
        .mount(&mock_server)
        .await;

    let id = fx
        .engine
        .enqueue(NewDownload::new(format!("{}/loop", mock_server.uri())))
        .await?;
    let stats = fx.engine.process_ready().await?;

    assert_eq!(stats.failed(), 1);
    let record = fx.record(id).await?;
    assert_eq!(record.status(), DownloadStatus::TooManyRedirects);
    assert_eq!(record.redirect_count, 5);
    Ok(())
}

#[tokio::test]
async fn test_redirect_without_location_is_unhandled() -> TestResult {
    let fx = setup_default().await?;
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(302))
        .mount(&mock_server)
        .await;

    let id = fx
        .engine
        .enqueue(NewDownload::new(format!("{}/nowhere", mock_server.uri())))
        .await?;
    fx.engine.process_ready().await?;

    assert_eq!(
        fx.record(id).await?.status(),
        DownloadStatus::UnhandledRedirect
    );
    Ok(())
}

// ==================== Retry Scheduling ====================

#[tokio::test]
async fn test_service_unavailable_clamps_retry_after() -> TestResult {
    let fx = setup_default().await?;
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503).insert_header("Retry-After", "999999"))
        .mount(&mock_server)
        .await;

    let id = fx
        .engine
        .enqueue(NewDownload::new(format!("{}/busy", mock_server.uri())))
        .await?;
    let stats = fx.engine.process_ready().await?;
    assert_eq!(stats.deferred(), 1);

    let record = fx.record(id).await?;
    assert_eq!(record.status(), DownloadStatus::WaitingToRetry);
    assert_eq!(record.num_failed, 1);
    let day_ms = 24 * 60 * 60 * 1000;
    assert!(record.retry_after_ms >= day_ms);
    assert!(record.retry_after_ms < day_ms + 31_000);

    let wake = fx.engine.next_wakeup().await?.ok_or("no wakeup")?;
    assert_eq!(wake, record.last_modification + record.retry_after_ms);

    // Not due yet: another pass runs nothing.
    assert_eq!(fx.engine.process_ready().await?.total(), 0);
    Ok(())
}

#[tokio::test]
async fn test_retry_budget_exhaustion_reports_status() -> TestResult {
    let config = EngineConfig {
        max_retries: 1,
        ..EngineConfig::default()
    };
    let fx = setup(config, HostSystem::new()).await?;
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&mock_server)
        .await;

    let id = fx
        .engine
        .enqueue(NewDownload::new(format!("{}/busy", mock_server.uri())))
        .await?;

    fx.engine.process_ready().await?;
    let record = fx.record(id).await?;
    assert_eq!(record.status(), DownloadStatus::WaitingToRetry);
    assert_eq!(record.retry_after_ms, 0);

    // Missing Retry-After falls back to backoff (10 s base, up to 1 s fuzz).
    fx.system.advance_clock(12_000);
    fx.engine.process_ready().await?;
    let record = fx.record(id).await?;
    assert_eq!(record.status(), DownloadStatus::HttpError(503));
    assert_eq!(record.num_failed, 0);
    Ok(())
}

#[tokio::test]
async fn test_offline_download_waits_for_network() -> TestResult {
    let fx = setup(EngineConfig::default(), HostSystem::with_network(None)).await?;
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"late".to_vec()))
        .mount(&mock_server)
        .await;

    let id = fx
        .engine
        .enqueue(NewDownload::new(format!("{}/late.bin", mock_server.uri())))
        .await?;
    fx.engine.process_ready().await?;
    assert_eq!(
        fx.record(id).await?.status(),
        DownloadStatus::WaitingForNetwork
    );
    assert_eq!(fx.engine.next_wakeup().await?, None);

    fx.system.set_network(Some(NetworkInfo::wifi()));
    assert!(fx.engine.next_wakeup().await?.is_some());
    fx.engine.process_ready().await?;
    assert_eq!(fx.record(id).await?.status(), DownloadStatus::Success);
    Ok(())
}

// ==================== Resume ====================

#[tokio::test]
async fn test_resume_with_etag_produces_identical_file() -> TestResult {
    let fx = setup_default().await?;
    let mock_server = require_mock_server!();
    let content = body(10);
    Mock::given(method("GET"))
        .and(path("/resume.bin"))
        .and(header("Range", "bytes=4-"))
        .and(header("If-Match", "\"v1\""))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("ETag", "\"v1\"")
                .insert_header("Content-Range", "bytes 4-9/10")
                .set_body_bytes(content[4..].to_vec()),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let id = fx
        .engine
        .enqueue(NewDownload::new(format!("{}/resume.bin", mock_server.uri())))
        .await?;

    // State left behind by a pause after the first four bytes.
    let private = fx.dir.path().join("private");
    std::fs::create_dir_all(&private)?;
    let partial = private.join("resume.bin");
    std::fs::write(&partial, &content[..4])?;
    fx.engine
        .writer()
        .update(
            id,
            RecordUpdate::new()
                .status(DownloadStatus::PausedByApp)
                .control(Control::Paused)
                .local_path(Some(partial.display().to_string()))
                .current_bytes(4)
                .total_bytes(Some(10))
                .etag(Some("\"v1\"".to_string())),
        )
        .await?;

    assert_eq!(fx.engine.process_ready().await?.total(), 0);
    fx.engine.resume(id).await?;
    let stats = fx.engine.process_ready().await?;
    assert_eq!(stats.completed(), 1);

    let record = fx.record(id).await?;
    assert_eq!(record.status(), DownloadStatus::Success);
    assert_eq!(record.current_bytes, 10);
    assert_eq!(std::fs::read(&partial)?, content);
    Ok(())
}

#[tokio::test]
async fn test_range_past_total_is_rejected_before_writing() -> TestResult {
    let fx = setup_default().await?;
    let mock_server = require_mock_server!();
    let content = body(10);
    Mock::given(method("GET"))
        .and(header("Range", "bytes=4-"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("ETag", "\"v1\"")
                .insert_header("Content-Range", "bytes 4-9/8")
                .set_body_bytes(content[4..].to_vec()),
        )
        .mount(&mock_server)
        .await;

    let id = fx
        .engine
        .enqueue(NewDownload::new(format!("{}/short.bin", mock_server.uri())))
        .await?;
    let partial = seed_partial(&fx, id, "short.bin", &content[..4], 8, "\"v1\"").await?;
    fx.engine.process_ready().await?;

    let record = fx.record(id).await?;
    assert_eq!(record.status(), DownloadStatus::HttpDataError);
    assert_eq!(record.current_bytes, 4);
    assert_eq!(record.total_bytes, 8);
    assert_eq!(std::fs::metadata(&partial)?.len(), 4);
    Ok(())
}

#[tokio::test]
async fn test_overlong_body_never_exceeds_total() -> TestResult {
    let fx = setup_default().await?;
    let mock_server = require_mock_server!();
    let content = body(10);
    Mock::given(method("GET"))
        .and(header("Range", "bytes=4-"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("ETag", "\"v1\"")
                .insert_header("Content-Range", "bytes 4-7/8")
                .set_body_bytes(content[4..].to_vec()),
        )
        .mount(&mock_server)
        .await;

    let id = fx
        .engine
        .enqueue(NewDownload::new(format!("{}/long.bin", mock_server.uri())))
        .await?;
    let partial = seed_partial(&fx, id, "long.bin", &content[..4], 8, "\"v1\"").await?;
    fx.engine.process_ready().await?;

    let record = fx.record(id).await?;
    assert_eq!(record.status(), DownloadStatus::HttpDataError);
    assert_eq!(record.total_bytes, 8);
    assert!(record.current_bytes <= record.total_bytes);
    assert_eq!(
        std::fs::metadata(&partial)?.len(),
        u64::try_from(record.current_bytes)?
    );
    Ok(())
}

#[tokio::test]
async fn test_pause_running_download_then_resume() -> TestResult {
    let fx = setup_default().await?;
    let mock_server = require_mock_server!();
    let content = body(4096);
    Mock::given(method("GET"))
        .and(path("/slow.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", "\"slow\"")
                .set_body_bytes(content.clone())
                .set_delay(Duration::from_millis(400)),
        )
        .mount(&mock_server)
        .await;

    let id = fx
        .engine
        .enqueue(NewDownload::new(format!("{}/slow.bin", mock_server.uri())))
        .await?;

    let engine = Arc::clone(&fx.engine);
    let run = tokio::spawn(async move { engine.process_ready().await });
    wait_for_active_worker(&fx.engine).await;
    fx.engine.pause(id).await?;
    let stats = run.await??;
    assert_eq!(stats.deferred(), 1);

    let record = fx.record(id).await?;
    assert_eq!(record.status(), DownloadStatus::PausedByApp);
    assert_eq!(record.control(), Control::Paused);
    assert_eq!(fx.system.active_holds(), 0);

    fx.engine.resume(id).await?;
    fx.engine.process_ready().await?;
    let record = fx.record(id).await?;
    assert_eq!(record.status(), DownloadStatus::Success);
    assert_eq!(std::fs::read(record.local_file().ok_or("no path")?)?, content);
    Ok(())
}

// ==================== Cancel ====================

#[tokio::test]
async fn test_cancel_running_download_deletes_partial_file() -> TestResult {
    let fx = setup_default().await?;
    let mock_server = require_mock_server!();
    let content = body(8192);
    Mock::given(method("GET"))
        .and(header("Range", "bytes=1024-"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("ETag", "\"doomed\"")
                .insert_header("Content-Range", "bytes 1024-8191/8192")
                .set_body_bytes(content[1024..].to_vec())
                .set_delay(Duration::from_millis(400)),
        )
        .mount(&mock_server)
        .await;

    let id = fx
        .engine
        .enqueue(NewDownload::new(format!("{}/doomed.bin", mock_server.uri())))
        .await?;
    let partial =
        seed_partial(&fx, id, "doomed.bin", &content[..1024], 8192, "\"doomed\"").await?;

    let engine = Arc::clone(&fx.engine);
    let run = tokio::spawn(async move { engine.process_ready().await });
    wait_for_active_worker(&fx.engine).await;
    assert_eq!(std::fs::metadata(&partial)?.len(), 1024);
    fx.engine.cancel(id).await?;
    let stats = run.await??;
    assert_eq!(stats.failed(), 1);

    let record = fx.record(id).await?;
    assert_eq!(record.status(), DownloadStatus::Canceled);
    assert!(record.local_path.is_none());
    assert_eq!(record.current_bytes, 0);
    assert!(!partial.exists());
    assert!(fx.private_files().is_empty());
    assert_eq!(fx.system.active_holds(), 0);
    Ok(())
}

#[tokio::test]
async fn test_delete_finished_download_removes_file() -> TestResult {
    let fx = setup_default().await?;
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"bye".to_vec()))
        .mount(&mock_server)
        .await;

    let id = fx
        .engine
        .enqueue(NewDownload::new(format!("{}/bye.txt", mock_server.uri())))
        .await?;
    fx.engine.process_ready().await?;
    let path = fx.record(id).await?.local_file().ok_or("no path")?;
    assert!(path.exists());

    fx.engine.delete(id).await?;
    assert!(fx.engine.record(id).await?.is_none());
    assert!(!path.exists());
    Ok(())
}

// ==================== Segmented Transfers ====================

/// Serves byte ranges of a fixed body and remembers every requested range.
struct RangeResponder {
    body: Arc<Vec<u8>>,
    ranges: Arc<Mutex<Vec<(u64, u64)>>>,
    /// Delay applied to every range that does not start at zero.
    later_delay: Duration,
}

impl RangeResponder {
    fn new(body: Arc<Vec<u8>>, ranges: Arc<Mutex<Vec<(u64, u64)>>>) -> Self {
        Self {
            body,
            ranges,
            later_delay: Duration::ZERO,
        }
    }
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let len = self.body.len() as u64;
        let Some(range) = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("bytes="))
        else {
            return ResponseTemplate::new(200).set_body_bytes(self.body.to_vec());
        };
        let (start, end) = range.split_once('-').unwrap_or((range, ""));
        let start: u64 = start.parse().unwrap_or(0);
        let end: u64 = end.parse().map_or(len - 1, |e: u64| e.min(len - 1));
        self.ranges.lock().unwrap_or_else(|e| e.into_inner()).push((start, end));

        let (from, to) = (usize::try_from(start).unwrap_or(0), usize::try_from(end).unwrap_or(0));
        let template = ResponseTemplate::new(206)
            .insert_header("Content-Range", format!("bytes {start}-{end}/{len}"))
            .set_body_bytes(self.body[from..=to].to_vec());
        if start > 0 {
            template.set_delay(self.later_delay)
        } else {
            template
        }
    }
}

#[tokio::test]
async fn test_segmented_transfer_covers_body_without_gaps() -> TestResult {
    let config = EngineConfig {
        segment_access_points: vec!["wap.example".to_string()],
        ..EngineConfig::default()
    };
    let system = HostSystem::with_network(Some(NetworkInfo::mobile(Some("wap.example"))));
    let fx = setup(config, system).await?;
    let mock_server = require_mock_server!();

    let content = Arc::new(body(1_048_576));
    let ranges = Arc::new(Mutex::new(Vec::new()));
    Mock::given(method("GET"))
        .and(path("/big.bin"))
        .respond_with(RangeResponder::new(Arc::clone(&content), Arc::clone(&ranges)))
        .mount(&mock_server)
        .await;

    let id = fx
        .engine
        .enqueue(NewDownload::new(format!("{}/big.bin", mock_server.uri())))
        .await?;
    let stats = fx.engine.process_ready().await?;
    assert_eq!(stats.completed(), 1);

    let seen = ranges.lock().unwrap_or_else(|e| e.into_inner()).clone();
    assert_eq!(
        seen,
        vec![
            (0, 306_175),
            (306_176, 612_351),
            (612_352, 918_527),
            (918_528, 1_048_575),
        ]
    );

    let record = fx.record(id).await?;
    assert_eq!(record.status(), DownloadStatus::Success);
    assert_eq!(record.total_bytes, 1_048_576);
    let on_disk = std::fs::read(record.local_file().ok_or("no path")?)?;
    assert_eq!(on_disk.as_slice(), content.as_slice());
    Ok(())
}

#[tokio::test]
async fn test_plain_transfer_when_access_point_does_not_match() -> TestResult {
    let config = EngineConfig {
        segment_access_points: vec!["wap.example".to_string()],
        ..EngineConfig::default()
    };
    let system = HostSystem::with_network(Some(NetworkInfo::mobile(Some("internet"))));
    let fx = setup(config, system).await?;
    let mock_server = require_mock_server!();

    let ranges = Arc::new(Mutex::new(Vec::new()));
    let requests = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&requests);
    let responder = RangeResponder::new(Arc::new(body(2048)), Arc::clone(&ranges));
    Mock::given(method("GET"))
        .respond_with(move |request: &Request| {
            counter.fetch_add(1, Ordering::SeqCst);
            responder.respond(request)
        })
        .mount(&mock_server)
        .await;

    let id = fx
        .engine
        .enqueue(NewDownload::new(format!("{}/small.bin", mock_server.uri())))
        .await?;
    fx.engine.process_ready().await?;

    assert_eq!(fx.record(id).await?.status(), DownloadStatus::Success);
    assert_eq!(requests.load(Ordering::SeqCst), 1);
    assert!(ranges.lock().unwrap_or_else(|e| e.into_inner()).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_cancel_segmented_download_deletes_partial_file() -> TestResult {
    let config = EngineConfig {
        segment_access_points: vec!["wap.example".to_string()],
        ..EngineConfig::default()
    };
    let system = HostSystem::with_network(Some(NetworkInfo::mobile(Some("wap.example"))));
    let fx = setup(config, system).await?;
    let mock_server = require_mock_server!();

    let ranges = Arc::new(Mutex::new(Vec::new()));
    let responder = RangeResponder {
        later_delay: Duration::from_millis(500),
        ..RangeResponder::new(Arc::new(body(1_048_576)), Arc::clone(&ranges))
    };
    Mock::given(method("GET"))
        .and(path("/segmented.bin"))
        .respond_with(responder)
        .mount(&mock_server)
        .await;

    let id = fx
        .engine
        .enqueue(NewDownload::new(format!("{}/segmented.bin", mock_server.uri())))
        .await?;
    let engine = Arc::clone(&fx.engine);
    let run = tokio::spawn(async move { engine.process_ready().await });

    // The whole first segment is on disk before the second one is answered.
    wait_for_bytes_on_disk(&fx, 306_176).await;
    fx.engine.cancel(id).await?;
    let stats = run.await??;
    assert_eq!(stats.failed(), 1);

    let record = fx.record(id).await?;
    assert_eq!(record.status(), DownloadStatus::Canceled);
    assert!(record.local_path.is_none());
    assert_eq!(record.current_bytes, 0);
    assert!(fx.private_files().is_empty());
    assert_eq!(fx.system.active_holds(), 0);

    let seen = ranges.lock().unwrap_or_else(|e| e.into_inner()).clone();
    assert!(seen.len() < 4, "transfer ran to completion: {seen:?}");
    Ok(())
}

// ==================== Network Policy ====================

#[tokio::test]
async fn test_wifi_only_download_waits_for_unmetered_network() -> TestResult {
    let system = HostSystem::with_network(Some(NetworkInfo::mobile(None)));
    let fx = setup(EngineConfig::default(), system).await?;
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"wifi".to_vec()))
        .mount(&mock_server)
        .await;

    let id = fx
        .engine
        .enqueue(
            NewDownload::new(format!("{}/w.bin", mock_server.uri()))
                .with_policy(DestinationPolicy::CachePartition)
                .wifi_only(),
        )
        .await?;
    fx.engine.process_ready().await?;
    assert_eq!(fx.record(id).await?.status(), DownloadStatus::QueuedForWifi);
    assert_eq!(fx.engine.process_ready().await?.total(), 0);

    fx.system.set_network(Some(NetworkInfo::wifi()));
    fx.engine.process_ready().await?;
    let record = fx.record(id).await?;
    assert_eq!(record.status(), DownloadStatus::Success);
    assert!(
        record
            .local_file()
            .is_some_and(|p| p.starts_with(fx.dir.path().join("cache")))
    );
    Ok(())
}

#[tokio::test]
async fn test_metered_size_ceiling_applies_to_first_response() -> TestResult {
    let config = EngineConfig {
        mobile_max_bytes: Some(100),
        ..EngineConfig::default()
    };
    let system = HostSystem::with_network(Some(NetworkInfo::mobile(None)));
    let fx = setup(config, system).await?;
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body(10_000)))
        .mount(&mock_server)
        .await;

    let id = fx
        .engine
        .enqueue(NewDownload::new(format!("{}/large.bin", mock_server.uri())))
        .await?;
    let stats = fx.engine.process_ready().await?;
    assert_eq!(stats.deferred(), 1);

    let record = fx.record(id).await?;
    assert_eq!(record.status(), DownloadStatus::QueuedForWifi);
    assert_eq!(record.current_bytes, 0);
    assert!(record.local_path.is_none());
    assert!(fx.private_files().is_empty());

    fx.system.set_network(Some(NetworkInfo::wifi()));
    fx.engine.process_ready().await?;
    let record = fx.record(id).await?;
    assert_eq!(record.status(), DownloadStatus::Success);
    assert_eq!(record.current_bytes, 10_000);
    Ok(())
}

#[tokio::test]
async fn test_origin_storage_codes_raise_no_advisory() -> TestResult {
    let fx = setup_default().await?;
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(498))
        .mount(&mock_server)
        .await;

    let mut advisories = fx.engine.subscribe_advisories();
    let id = fx
        .engine
        .enqueue(NewDownload::new(format!("{}/odd.bin", mock_server.uri())))
        .await?;
    fx.engine.process_ready().await?;

    assert_eq!(
        fx.record(id).await?.status(),
        DownloadStatus::InsufficientSpace
    );
    assert!(advisories.try_recv().is_err());
    Ok(())
}

#[tokio::test]
async fn test_interrupted_running_record_is_recovered() -> TestResult {
    let fx = setup_default().await?;
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"again".to_vec()))
        .mount(&mock_server)
        .await;

    let id = fx
        .engine
        .enqueue(NewDownload::new(format!("{}/again.bin", mock_server.uri())))
        .await?;
    fx.engine
        .writer()
        .update(id, RecordUpdate::new().status(DownloadStatus::Running))
        .await?;

    assert_eq!(fx.engine.recover_interrupted().await?, 1);
    assert_eq!(fx.record(id).await?.status(), DownloadStatus::Pending);
    fx.engine.process_ready().await?;
    assert_eq!(fx.record(id).await?.status(), DownloadStatus::Success);
    Ok(())
}

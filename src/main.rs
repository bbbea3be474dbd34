//! CLI entry point for fetchkeeper.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use fetchkeeper_core::system::SystemFacade;
use fetchkeeper_core::{
    Database, DownloadEngine, EngineConfig, HostSystem, NewDownload, ProgressView, RecordStore,
    Selection, SelectionArg, StorageAllocator, StorageLayout,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

mod app_config;
mod cli;

use app_config::{FileConfig, load_file_config};
use cli::{AddArgs, Args, Command, ListArgs, RunArgs};

/// Upper bound on a single idle wait in `run`, so network changes are noticed.
const MAX_IDLE_WAIT: Duration = Duration::from_secs(60);

const DATABASE_FILE: &str = "fetchkeeper.db";

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let file_config = load_file_config(args.config.as_deref())?;
    let mut config = EngineConfig::default();
    file_config.apply_to(&mut config);
    if let Command::Run(run) = &args.command {
        apply_run_flags(run, &mut config);
    }

    let data_dir = resolve_data_dir(args.data_dir.as_deref(), &file_config)?;
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create data directory '{}'", data_dir.display()))?;
    debug!(data_dir = %data_dir.display(), "using data directory");

    let db = Database::new_with_options(
        &data_dir.join(DATABASE_FILE),
        file_config.database_options(),
    )
    .await
    .context("Failed to open download database")?;

    let mut layout = StorageLayout::under(&data_dir);
    layout.primary_volume.clone_from(&file_config.primary_volume);
    let allocator = StorageAllocator::new(layout, config.root_preference.clone());

    let system = Arc::new(HostSystem::new());
    let engine = DownloadEngine::new(RecordStore::new(db), allocator, system.clone(), config)?;

    match args.command {
        Command::Add(add) => add_download(&engine, add).await?,
        Command::Run(run) => run_downloads(&engine, system.as_ref(), run.once).await?,
        Command::List(list) => list_downloads(&engine, list).await?,
        Command::Pause { id } => {
            engine.pause(id).await?;
            info!(id, "download paused");
        }
        Command::Resume { id } => {
            engine.resume(id).await?;
            info!(id, "download resumed");
        }
        Command::Cancel { id } => {
            engine.cancel(id).await?;
            info!(id, "download canceled");
        }
        Command::Restart { id } => engine.restart(id).await?,
        Command::Delete { id } => {
            engine.delete(id).await?;
        }
    }

    engine.writer().flush().await?;
    Ok(())
}

fn apply_run_flags(run: &RunArgs, config: &mut EngineConfig) {
    if let Some(concurrency) = run.concurrency {
        config.max_concurrent_downloads = usize::from(concurrency);
    }
    if let Some(retries) = run.max_retries {
        config.max_retries = u32::from(retries);
    }
}

/// CLI flag, then config file, then `$XDG_DATA_HOME/fetchkeeper`,
/// then `$HOME/.local/share/fetchkeeper`.
fn resolve_data_dir(flag: Option<&Path>, file_config: &FileConfig) -> Result<PathBuf> {
    if let Some(dir) = flag.or(file_config.data_dir.as_deref()) {
        return Ok(dir.to_path_buf());
    }
    if let Some(xdg) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(xdg).join("fetchkeeper"));
    }
    match env::var_os("HOME").filter(|v| !v.is_empty()) {
        Some(home) => Ok(PathBuf::from(home)
            .join(".local")
            .join("share")
            .join("fetchkeeper")),
        None => bail!("No data directory: pass --data-dir or set data_dir in the config file"),
    }
}

async fn add_download(engine: &DownloadEngine, add: AddArgs) -> Result<()> {
    let mut request = NewDownload::new(add.url)
        .with_policy(add.policy)
        .with_visibility(add.visibility);
    if let Some(hint) = add.hint {
        request = request.with_hint(hint);
    }
    if let Some(mime) = add.mime_type {
        request = request.with_mime_type(mime);
    }
    for header in &add.headers {
        let Some((name, value)) = header.split_once(':') else {
            bail!("Invalid header '{header}': expected \"Name: value\"");
        };
        request = request.with_header(name.trim(), value.trim());
    }
    if add.wifi_only {
        request = request.wifi_only();
    }
    if add.no_integrity {
        request = request.without_integrity();
    }

    let id = engine.enqueue(request).await?;
    println!("{id}");
    Ok(())
}

async fn run_downloads(engine: &DownloadEngine, system: &HostSystem, once: bool) -> Result<()> {
    let recovered = engine.recover_interrupted().await?;
    if recovered > 0 {
        info!(recovered, "resuming interrupted downloads");
    }

    let mut advisories = engine.subscribe_advisories();
    let advisory_task = tokio::spawn(async move {
        loop {
            match advisories.recv().await {
                Ok(advisory) => warn!(id = advisory.id(), "{advisory}"),
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "advisories dropped"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    loop {
        let stats = engine.process_ready().await?;
        info!(
            completed = stats.completed(),
            failed = stats.failed(),
            deferred = stats.deferred(),
            total = stats.total(),
            "pass complete"
        );
        if once {
            break;
        }

        let Some(wake_at) = engine.next_wakeup().await? else {
            info!("no runnable downloads left");
            break;
        };
        let now = system.now_ms();
        if wake_at <= now && stats.total() == 0 {
            break;
        }

        let wait = Duration::from_millis(u64::try_from(wake_at - now).unwrap_or(0))
            .min(MAX_IDLE_WAIT);
        debug!(wait_ms = wait.as_millis(), "waiting for next due download");
        tokio::select! {
            () = tokio::time::sleep(wait) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; pending downloads resume on next run");
                break;
            }
        }
    }

    advisory_task.abort();
    Ok(())
}

async fn list_downloads(engine: &DownloadEngine, list: ListArgs) -> Result<()> {
    let selection = match list.filter {
        Some(clause) => {
            let args = list.args.into_iter().map(selection_arg).collect();
            Selection::parse(&clause, args)?
        }
        None => Selection::all(),
    };

    for record in engine.query(&selection).await? {
        let view = ProgressView::from_record(&record);
        let progress = match (view.percent(), view.total) {
            (Some(pct), Some(total)) => format!("{pct:>3}% of {total}"),
            _ => format!("{} bytes", view.current),
        };
        println!(
            "{:>5}  {:<20}  {:<18}  {}  {}",
            record.id,
            record.status().label(),
            progress,
            record.source_uri,
            record.local_path.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

fn selection_arg(raw: String) -> SelectionArg {
    match raw.parse::<i64>() {
        Ok(value) => SelectionArg::from(value),
        Err(_) => SelectionArg::from(raw),
    }
}

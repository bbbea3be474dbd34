//! SQLite pool for the download record table.
//!
//! Opening a [`Database`] creates the file when missing, switches the journal
//! to WAL so readers never block the record writer, and applies the embedded
//! migrations.
//!
//! ```no_run
//! use fetchkeeper_core::{Database, DatabaseOptions};
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let options = DatabaseOptions { max_connections: 2, ..DatabaseOptions::default() };
//! let db = Database::new_with_options(Path::new("fetchkeeper.db"), options).await?;
//! # drop(db);
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use thiserror::Error;
use tracing::{debug, instrument};

/// SQLite serializes writers, so a handful of connections is plenty.
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// How long a connection waits on a locked database before failing.
const DEFAULT_BUSY_TIMEOUT_MS: u32 = 5000;

/// Errors opening or migrating the record database.
#[derive(Error, Debug)]
pub enum DbError {
    /// The database file could not be opened or created.
    #[error("cannot open database at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: sqlx::Error,
    },

    /// A pool or pragma query failed.
    #[error("database query failed: {0}")]
    Query(#[from] sqlx::Error),

    /// The embedded schema could not be applied.
    #[error("failed to apply migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Pool tuning for file-backed databases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseOptions {
    /// Maximum pooled connections.
    pub max_connections: u32,
    /// `PRAGMA busy_timeout` in milliseconds.
    pub busy_timeout_ms: u32,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

/// Handle to the record database. Cloning shares the pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens the database at `db_path` with [`DatabaseOptions::default`].
    ///
    /// # Errors
    ///
    /// See [`Database::new_with_options`].
    pub async fn new(db_path: &Path) -> Result<Self, DbError> {
        Self::new_with_options(db_path, DatabaseOptions::default()).await
    }

    /// Opens (creating if needed) the database at `db_path`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Open`] when the file cannot be opened and
    /// [`DbError::Migration`] when the schema cannot be applied.
    #[instrument(skip(db_path), fields(path = %db_path.display()))]
    pub async fn new_with_options(
        db_path: &Path,
        options: DatabaseOptions,
    ) -> Result<Self, DbError> {
        let connect = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(u64::from(options.busy_timeout_ms)));

        let pool = SqlitePoolOptions::new()
            .max_connections(options.max_connections.max(1))
            .connect_with(connect)
            .await
            .map_err(|source| DbError::Open {
                path: db_path.to_path_buf(),
                source,
            })?;

        Self::migrated(pool).await
    }

    /// Opens a private in-memory database, used by tests.
    ///
    /// The pool holds a single connection; the schema lives as long as it does.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Query`] or [`DbError::Migration`].
    #[instrument]
    pub async fn new_in_memory() -> Result<Self, DbError> {
        let connect: SqliteConnectOptions = "sqlite::memory:".parse()?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect)
            .await?;

        Self::migrated(pool).await
    }

    async fn migrated(pool: SqlitePool) -> Result<Self, DbError> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        debug!("schema up to date");
        Ok(Self { pool })
    }

    /// The underlying pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Reports whether the journal is in WAL mode.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Query`] if the pragma fails.
    pub async fn is_wal_enabled(&self) -> Result<bool, DbError> {
        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&self.pool)
            .await?;
        Ok(mode.eq_ignore_ascii_case("wal"))
    }

    /// Closes every pooled connection.
    pub async fn close(self) {
        self.pool.close().await;
    }
}

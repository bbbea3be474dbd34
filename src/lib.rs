//! Fetchkeeper Core Library
//!
//! This library provides a resumable, retrying download engine that keeps
//! every download as a durable record. A download survives process restarts,
//! network loss and server hiccups, and finishes as a complete file in a
//! storage root chosen for it.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`db`] - Database connection and schema management
//! - [`record`] - Download records, partial updates, queries and the single writer
//! - [`storage`] - Storage root selection, free-space checks and cache reclaiming
//! - [`download`] - Engine, transfer workers, retry policy and destination naming
//! - [`system`] - Clock, network state and wake-holds
//! - [`config`] - Engine tunables and their validation

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod db;
pub mod download;
pub mod record;
pub mod storage;
pub mod system;
pub(crate) mod user_agent;

#[cfg(test)]
pub mod test_support;

// Re-export commonly used types
pub use config::{ConfigError, DEFAULT_CONCURRENCY, EngineConfig};
pub use db::{Database, DatabaseOptions, DbError};
pub use download::{
    Advisory, DownloadEngine, DownloadStats, EngineError, HttpClient, RetryPolicy, StopRequest,
};
pub use record::{
    Control, DestinationPolicy, DownloadRecord, DownloadStatus, NewDownload, ProgressView,
    RecordStore, RecordUpdate, RecordWriter, Selection, SelectionArg, StoreError, Visibility,
};
pub use storage::{RootPreference, StorageAllocator, StorageError, StorageLayout};
pub use system::{HostSystem, NetworkClass, NetworkInfo, SystemFacade, WakeHold};

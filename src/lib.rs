//! Photo library indexer with incremental face clustering.
//!
//! Scans photo folders into a persistent index, extracts face embeddings
//! through a pluggable backend and groups faces into persons, keeping human
//! corrections across runs.

pub mod config;
pub mod db;
pub mod error;
pub mod export;
pub mod faces;
pub mod logging;
pub mod scanner;

pub use config::Config;
pub use db::{IndexStore, SqliteStore};
pub use error::{ErrorKind, IndexError, StoreError};
pub use faces::{ClusteringEngine, IndexPipeline, RunSummary};
pub use scanner::{PhotoScanner, ScanEvent, ScanSummary};

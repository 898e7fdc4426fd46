//! # citydb - CityGML import pipeline for a 3D city database
//!
//! The importer streams large CityGML files through a chain of worker pools:
//! - a feature reader pool that turns raw XML chunks into feature trees
//! - a database import pool that writes features and geometries
//! - an XLink registration pool that spills unresolved references to disk
//! - an XLink resolver pool fed by the splitter once parsing has drained
//!
//! Identifier lookups and pending references live in spill tables managed
//! by the cache manager, so memory stays bounded for arbitrarily large inputs.

pub mod cache;
pub mod cancel;
pub mod citygml;
pub mod concurrent;
pub mod config;
pub mod event;
pub mod importer;
pub mod input;
pub mod lookup;
pub mod model;
pub mod storage;
pub mod ui;

// Re-exports for convenient access
pub use cancel::CancellationToken;
pub use config::Config;
pub use event::{Event, EventDispatcher, EventHandler};
pub use importer::{ImportSummary, Importer};
pub use model::{Feature, FeatureKind, Geometry, GeometryKind, ReferenceKind, UnresolvedReference};
pub use storage::{DbPool, SqliteStore};

/// Result type alias for importer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for importer operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Worker pool '{0}' has been shut down")]
    PoolShutdown(String),

    #[error("Worker pool '{pool}' lost {count} worker thread(s)")]
    WorkerPanicked { pool: String, count: usize },

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

//! Importer - orchestrates the import pipeline over all input files
//!
//! Per file the importer walks `Idle -> Parsing -> XlinkResolving -> Idle`,
//! or ends in `Aborted` when the run is interrupted:
//! 1. chunks are read on the calling thread and fed to the feature reader pool
//! 2. parsed features flow into the DB import pool, unresolved references
//!    into the XLink registration pool
//! 3. reader and import pools drain, the registration pool is joined
//! 4. the splitter feeds persisted references to the resolver pool
//! 5. the session's spill tables and lookup servers are torn down
//!
//! Index deactivation wraps the whole run; the feature-count filter and the
//! interrupt flag span all files.

pub mod content;
pub mod control;
pub mod filter;
pub mod import_log;
pub mod reader;
pub mod resolver;
pub mod session;
pub mod splitter;
pub mod transform;
pub mod xlink;

pub use control::{ImportState, RunControl};
pub use filter::{FeatureCountFilter, FeatureFilter, FilterDecision};
pub use import_log::ImportLogger;
pub use splitter::{SplitterStats, XlinkSplitter};
pub use transform::AffineTransformer;

use crate::cancel::CancellationToken;
use crate::concurrent::WorkerPool;
use crate::config::Config;
use crate::event::{CounterKind, Event, EventDispatcher, EventHandler};
use crate::model::{FeatureKind, GeometryKind};
use crate::storage::{DbPool, IndexKind, SqliteStore};
use crate::{input, Error, Result};
use parking_lot::Mutex;
use serde::Serialize;
use session::{ImportSession, SessionEnv};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// Final state of one worker pool of a session
#[derive(Debug, Clone, Serialize)]
pub struct PoolReport {
    pub name: String,
    pub submitted: u64,
    pub completed: u64,
    pub discarded: u64,
    pub blocked_submits: u64,
    pub terminated: bool,
}

impl PoolReport {
    pub fn new<T: Send + 'static>(pool: &WorkerPool<T>) -> Self {
        let stats = pool.stats();
        Self {
            name: pool.name().to_string(),
            submitted: stats.submitted,
            completed: stats.completed,
            discarded: stats.discarded,
            blocked_submits: stats.blocked_submits,
            terminated: pool.is_terminated(),
        }
    }
}

/// Aggregated outcome of a run, reported whether or not it completed
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportSummary {
    pub completed: bool,
    pub files: Vec<PathBuf>,
    pub features: BTreeMap<FeatureKind, u64>,
    pub geometries: BTreeMap<GeometryKind, u64>,
    pub xlinks_registered: u64,
    pub xlinks_resolved: u64,
    pub validation_errors: u64,
    pub interrupt: Option<String>,
    pub error: Option<String>,
    pub pools: Vec<PoolReport>,
    pub elapsed_ms: u64,
}

impl ImportSummary {
    pub fn total_features(&self) -> u64 {
        self.features.values().sum()
    }

    pub fn total_geometries(&self) -> u64 {
        self.geometries.values().sum()
    }

    pub fn all_pools_terminated(&self) -> bool {
        self.pools.iter().all(|p| p.terminated)
    }
}

#[derive(Default)]
struct Totals {
    features: BTreeMap<FeatureKind, u64>,
    geometries: BTreeMap<GeometryKind, u64>,
    files: u64,
    xlinks_registered: u64,
    xlinks_resolved: u64,
}

/// Subscribed for the duration of a run: aggregates counters and routes
/// interrupt events into the run control.
struct RunEventHandler {
    control: Arc<RunControl>,
    totals: Arc<Mutex<Totals>>,
}

impl EventHandler for RunEventHandler {
    fn handle_event(&self, event: &Event) {
        match event {
            Event::FeatureCounter(counts) => {
                let mut totals = self.totals.lock();
                for (kind, n) in counts {
                    *totals.features.entry(*kind).or_default() += n;
                }
            }
            Event::GeometryCounter(counts) => {
                let mut totals = self.totals.lock();
                for (kind, n) in counts {
                    *totals.geometries.entry(*kind).or_default() += n;
                }
            }
            Event::Counter { kind, value } => {
                let mut totals = self.totals.lock();
                match kind {
                    CounterKind::File => totals.files += value,
                    CounterKind::XlinkRegistered => totals.xlinks_registered += value,
                    CounterKind::XlinkResolved => totals.xlinks_resolved += value,
                }
            }
            Event::Interrupt { kind, message, level } => {
                self.control.raise(*kind, message.as_deref(), *level);
            }
            Event::StatusTitle(_) | Event::StatusMessage(_) => {}
        }
    }
}

/// Imports the configured input files. One importer performs one run.
pub struct Importer {
    config: Config,
    db: DbPool,
    events: Arc<EventDispatcher>,
    control: Arc<RunControl>,
    totals: Arc<Mutex<Totals>>,
    summary: Mutex<ImportSummary>,
}

impl Importer {
    pub fn new(config: Config, events: Arc<EventDispatcher>) -> Self {
        let db = DbPool::from_config(&config.database);
        Self {
            config,
            db,
            events,
            control: Arc::new(RunControl::new(CancellationToken::new())),
            totals: Arc::new(Mutex::new(Totals::default())),
            summary: Mutex::new(ImportSummary::default()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Token raised by the first interrupt
    pub fn cancellation_token(&self) -> CancellationToken {
        self.control.token().clone()
    }

    pub fn state(&self) -> ImportState {
        self.control.state()
    }

    pub fn summary(&self) -> ImportSummary {
        self.summary.lock().clone()
    }

    /// Run the import. `true` when every file was imported, `false` when the
    /// run failed or was interrupted. Blocks until the pipeline is torn down.
    pub fn do_process(&self) -> bool {
        let started = Instant::now();
        let subscription = self.events.subscribe(Arc::new(RunEventHandler {
            control: Arc::clone(&self.control),
            totals: Arc::clone(&self.totals),
        }));

        let mut files = Vec::new();
        let mut pools = Vec::new();
        let outcome = self.run(&mut files, &mut pools);

        self.events.flush();
        self.events.unsubscribe(subscription);

        let error = match &outcome {
            Err(e) => {
                tracing::error!("Import failed: {}", e);
                Some(e.to_string())
            }
            Ok(()) => None,
        };
        let completed = error.is_none() && !self.control.is_cancelled();
        self.control
            .set_state(if completed { ImportState::Idle } else { ImportState::Aborted });

        let summary = {
            let totals = self.totals.lock();
            ImportSummary {
                completed,
                files,
                features: totals.features.clone(),
                geometries: totals.geometries.clone(),
                xlinks_registered: totals.xlinks_registered,
                xlinks_resolved: totals.xlinks_resolved,
                validation_errors: self.control.validation_errors(),
                interrupt: self.control.reason().map(|(_, message)| message),
                error,
                pools,
                elapsed_ms: started.elapsed().as_millis() as u64,
            }
        };
        log_summary(&summary);
        *self.summary.lock() = summary;
        completed
    }

    fn run(&self, processed: &mut Vec<PathBuf>, pools: &mut Vec<PoolReport>) -> Result<()> {
        self.config.validate()?;
        let transformer = AffineTransformer::from_config(&self.config.importer.affine_transformation)?;
        let files = input::expand_inputs(&self.config.input.paths)?;

        let store = self.db.connect()?;
        self.check_workspace(&store)?;
        let import_log = match self.config.importer.import_log.enabled {
            true => Some(Arc::new(ImportLogger::create(&self.config.importer.import_log.path)?)),
            false => None,
        };
        let filter = FeatureCountFilter::new(&self.config.importer.filter.feature_count);
        if FeatureFilter::new(&self.config.importer.filter).is_active() {
            tracing::info!("Importing only features matching the class, gml:id or bounding box filter");
        }

        // nothing below may return early: indexes are restored after the loop
        let deactivated = self.deactivate_indexes(&store);

        let mut result = Ok(());
        for (index, file) in files.iter().enumerate() {
            if !self.control.token().should_run() {
                break;
            }
            if filter.is_exhausted() {
                tracing::debug!("Feature count filter exhausted, skipping remaining files");
                break;
            }

            tracing::info!("Importing {} ({} of {})", file.display(), index + 1, files.len());
            self.events.publish(Event::StatusTitle(format!(
                "Importing file {} of {}: {}",
                index + 1,
                files.len(),
                file.display()
            )));
            self.events.publish(Event::counter(CounterKind::File, 1));

            let env = SessionEnv {
                config: &self.config,
                db: &self.db,
                events: &self.events,
                control: &self.control,
                filter: &filter,
                transformer: transformer.as_ref(),
                import_log: import_log.as_ref(),
            };
            let file_result = ImportSession::new(env, file).and_then(|mut session| {
                let outcome = session.run(file);
                pools.extend(session.close());
                outcome
            });

            if let Err(e) = file_result {
                result = Err(e);
                break;
            }
            if !self.control.is_cancelled() {
                processed.push(file.clone());
                self.control.set_state(ImportState::Idle);
            }
        }

        if self.config.importer.filter.feature_count.is_active() {
            tracing::info!("Feature count filter saw {} feature(s)", filter.seen());
        }
        if let Some(log) = &import_log {
            match log.flush() {
                Ok(()) => tracing::info!("Import log {} has {} entries", log.path().display(), log.entries()),
                Err(e) => tracing::warn!("Failed to flush import log: {}", e),
            }
        }

        if self.control.is_cancelled() {
            if !deactivated.is_empty() {
                tracing::warn!("Run was interrupted, indexes stay deactivated");
            }
        } else {
            self.reactivate_indexes(&store, &deactivated);
        }
        result
    }

    fn check_workspace(&self, store: &SqliteStore) -> Result<()> {
        let workspace = &self.config.database.workspace;
        if self.config.database.is_default_workspace() {
            return Ok(());
        }
        if !store.workspace_exists(workspace)? {
            return Err(Error::Config(format!("Database workspace '{}' does not exist", workspace)));
        }
        tracing::info!("Importing into workspace '{}'", workspace);
        Ok(())
    }

    fn deactivate_indexes(&self, store: &SqliteStore) -> Vec<IndexKind> {
        let indexes = &self.config.database.indexes;
        let mut deactivated = Vec::new();

        for (kind, mode) in [(IndexKind::Spatial, indexes.spatial), (IndexKind::Normal, indexes.normal)] {
            if !mode.deactivates() {
                continue;
            }
            self.events
                .publish(Event::StatusMessage(format!("Deactivating {} indexes", kind.as_str())));
            let report = store.drop_indexes(kind);
            for failure in report.failures() {
                tracing::warn!("Could not deactivate index: {}", failure);
            }
            if mode.reactivates() {
                deactivated.push(kind);
            }
        }
        deactivated
    }

    fn reactivate_indexes(&self, store: &SqliteStore, kinds: &[IndexKind]) {
        for &kind in kinds {
            self.events
                .publish(Event::StatusMessage(format!("Activating {} indexes", kind.as_str())));
            let report = store.create_indexes(kind);
            for failure in report.failures() {
                tracing::warn!("Could not activate index: {}", failure);
            }
        }
    }
}

fn log_summary(summary: &ImportSummary) {
    for (kind, count) in &summary.features {
        tracing::info!("{}: {}", kind, count);
    }
    for (kind, count) in &summary.geometries {
        tracing::debug!("{}: {}", kind, count);
    }
    tracing::info!(
        "Imported {} feature(s) and {} geometry object(s) from {} file(s)",
        summary.total_features(),
        summary.total_geometries(),
        summary.files.len()
    );
    if summary.validation_errors > 0 {
        tracing::warn!("{} validation error(s) encountered", summary.validation_errors);
    }
    if !summary.completed {
        tracing::warn!("Import did not complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_for(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.database.path = dir.join("city.db");
        config.importer.threads.min_threads = 1;
        config.importer.threads.max_threads = 2;
        config.importer.cache.in_memory = true;
        config
    }

    #[test]
    fn test_missing_workspace_fails_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("city.gml");
        std::fs::write(&input, "<CityModel/>").unwrap();

        let mut config = config_for(dir.path());
        config.database.workspace = "Nowhere".into();
        config.input.paths = vec![input];

        let importer = Importer::new(config, Arc::new(EventDispatcher::new().unwrap()));
        assert!(!importer.do_process());
        let summary = importer.summary();
        assert!(summary.error.unwrap().contains("Nowhere"));
        assert!(summary.files.is_empty());
        assert_eq!(importer.state(), ImportState::Aborted);
    }

    #[test]
    fn test_no_input_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_for(dir.path());
        config.input.paths = vec![dir.path().join("missing")];

        let importer = Importer::new(config, Arc::new(EventDispatcher::new().unwrap()));
        assert!(!importer.do_process());
    }
}

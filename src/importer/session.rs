//! Import session: the cache, lookup servers and pools of one input file

use super::content::{DbImportContext, DbImportWorkerFactory};
use super::control::{ImportState, RunControl};
use super::filter::{FeatureCountFilter, FeatureFilter, FilterDecision};
use super::import_log::ImportLogger;
use super::reader::{FeatureReaderContext, FeatureReaderWorkerFactory};
use super::resolver::{XlinkResolverContext, XlinkResolverWorkerFactory};
use super::splitter::XlinkSplitter;
use super::transform::AffineTransformer;
use super::xlink::XlinkRegistrationWorkerFactory;
use super::PoolReport;
use crate::cache::CacheManager;
use crate::citygml::{CityGmlReader, XmlChunk};
use crate::concurrent::{PoolConfig, WorkerPool};
use crate::config::{Config, ThreadConfig};
use crate::event::{EventDispatcher, InterruptKind};
use crate::lookup::{LookupServerKind, LookupServerManager};
use crate::model::{Feature, UnresolvedReference};
use crate::storage::DbPool;
use crate::Result;
use std::path::Path;
use std::sync::Arc;

/// Run-wide collaborators a session borrows
pub(crate) struct SessionEnv<'a> {
    pub config: &'a Config,
    pub db: &'a DbPool,
    pub events: &'a Arc<EventDispatcher>,
    pub control: &'a Arc<RunControl>,
    pub filter: &'a FeatureCountFilter,
    pub transformer: Option<&'a AffineTransformer>,
    pub import_log: Option<&'a Arc<ImportLogger>>,
}

fn pool_config(name: &str, threads: &ThreadConfig) -> PoolConfig {
    PoolConfig::new(name, threads.min_threads, threads.max_threads)
        .with_queue_capacity(threads.queue_capacity())
        .with_keep_alive(threads.keep_alive())
}

pub(crate) struct ImportSession<'a> {
    env: SessionEnv<'a>,
    file: String,
    cache: Arc<CacheManager>,
    lookup: Arc<LookupServerManager>,
    reader_pool: Arc<WorkerPool<XmlChunk>>,
    content_pool: Arc<WorkerPool<Feature>>,
    registration_pool: Arc<WorkerPool<UnresolvedReference>>,
    resolver_pool: Option<Arc<WorkerPool<UnresolvedReference>>>,
    reports: Vec<PoolReport>,
    closed: bool,
}

impl<'a> ImportSession<'a> {
    pub fn new(env: SessionEnv<'a>, file: &Path) -> Result<Self> {
        let config = env.config;
        let batching = &config.database.batching;
        let threads = &config.importer.threads;
        let file_name = file.display().to_string();

        let cache = Arc::new(CacheManager::open(&config.importer.cache)?);
        let lookup = Arc::new(LookupServerManager::new(Arc::clone(&cache)));
        lookup.init_server(
            LookupServerKind::Feature,
            &config.importer.lookup_server.feature,
            batching.lookup_cache_batch_size,
        )?;
        lookup.init_server(
            LookupServerKind::Geometry,
            &config.importer.lookup_server.geometry,
            batching.lookup_cache_batch_size,
        )?;

        let registration_pool = Arc::new(WorkerPool::new(
            pool_config("xlink-register", threads),
            XlinkRegistrationWorkerFactory::new(Arc::clone(&cache), Arc::clone(env.events), batching.xlink_batch_size),
        )?);

        let content_pool = Arc::new(WorkerPool::new(
            pool_config("db-import", threads),
            DbImportWorkerFactory::new(DbImportContext {
                db: env.db.clone(),
                workspace: config.database.workspace.clone(),
                codespace: config.importer.gml_id.codespace_for(file),
                import_file: file_name.clone(),
                batch_size: batching.feature_batch_size,
                lookup: Arc::clone(&lookup),
                xlink_pool: Arc::clone(&registration_pool),
                events: Arc::clone(env.events),
                import_log: env.import_log.cloned(),
            }),
        )?);

        let reader_pool = Arc::new(WorkerPool::new(
            pool_config("feature-reader", threads),
            FeatureReaderWorkerFactory::new(FeatureReaderContext {
                content_pool: Arc::clone(&content_pool),
                events: Arc::clone(env.events),
                control: Arc::clone(env.control),
                transformer: env.transformer.cloned(),
                filter: FeatureFilter::new(&config.importer.filter),
                validation: config.importer.validation.clone(),
                file: file_name.clone(),
            }),
        )?);

        Ok(Self {
            env,
            file: file_name,
            cache,
            lookup,
            reader_pool,
            content_pool,
            registration_pool,
            resolver_pool: None,
            reports: Vec::new(),
            closed: false,
        })
    }

    /// Parse, import and resolve one file. Returns early, leaving cleanup to
    /// [`close`](Self::close), when the run is interrupted.
    pub fn run(&mut self, path: &Path) -> Result<()> {
        let control = self.env.control;
        control.set_state(ImportState::Parsing);

        self.registration_pool.prestart()?;
        self.content_pool.prestart()?;
        self.reader_pool.prestart()?;

        let mut reader = CityGmlReader::open(path)?;
        while control.token().should_run() {
            if self.env.filter.is_exhausted() {
                tracing::debug!("Feature count filter exhausted, skipping the rest of {}", self.file);
                break;
            }

            let chunk = match reader.next_chunk() {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    control.interrupt(
                        self.env.events,
                        InterruptKind::ParseError,
                        format!("Failed to read {}: {}", self.file, e),
                        tracing::Level::ERROR,
                    );
                    break;
                }
            };

            match self.env.filter.next() {
                FilterDecision::Forward => self.reader_pool.submit(chunk)?,
                FilterDecision::Skip => continue,
                FilterDecision::Exhausted => break,
            }
        }
        tracing::debug!("Read {} feature(s) from {}", reader.chunks_read(), self.file);

        if control.is_cancelled() {
            return Ok(());
        }

        self.reader_pool.shutdown_and_wait()?;
        self.content_pool.shutdown_and_wait()?;
        // stays open: resolving geometry references registers new ones
        self.registration_pool.join();

        if control.is_cancelled() {
            return Ok(());
        }
        self.resolve_xlinks()
    }

    fn resolve_xlinks(&mut self) -> Result<()> {
        let control = self.env.control;
        let config = self.env.config;
        control.set_state(ImportState::XlinkResolving);

        let resolver_pool = Arc::new(WorkerPool::new(
            pool_config("xlink-resolve", &config.importer.threads),
            XlinkResolverWorkerFactory::new(XlinkResolverContext {
                db: self.env.db.clone(),
                lookup: Arc::clone(&self.lookup),
                cache: Arc::clone(&self.cache),
                registration_pool: Arc::clone(&self.registration_pool),
                events: Arc::clone(self.env.events),
                batch_size: config.database.batching.resolver_batch_size,
            }),
        )?);
        self.resolver_pool = Some(Arc::clone(&resolver_pool));
        resolver_pool.prestart()?;

        let splitter = Arc::new(XlinkSplitter::new(
            Arc::clone(&self.cache),
            Arc::clone(&resolver_pool),
            Arc::clone(&self.registration_pool),
            config.database.batching.splitter_batch_size,
        ));
        control.register_splitter(Some(Arc::clone(&splitter)));
        let outcome = splitter.start_query();
        control.register_splitter(None);

        match outcome {
            Ok(stats) => tracing::debug!(
                "XLink splitter dispatched {} reference(s) in {} batch(es) for {}",
                stats.dispatched,
                stats.batches,
                self.file
            ),
            Err(e) => tracing::error!("XLink resolution for {} is incomplete: {}", self.file, e),
        }

        if control.is_cancelled() {
            return Ok(());
        }
        resolver_pool.shutdown_and_wait()?;
        self.registration_pool.shutdown_and_wait()?;
        Ok(())
    }

    /// Release everything the session holds. Runs however `run` ended.
    pub fn close(&mut self) -> Vec<PoolReport> {
        if self.closed {
            return std::mem::take(&mut self.reports);
        }
        self.closed = true;

        // upstream first, so nobody blocks submitting into a stopped pool
        terminate(&self.reader_pool, &mut self.reports);
        terminate(&self.content_pool, &mut self.reports);
        if let Some(resolver) = self.resolver_pool.take() {
            terminate(&resolver, &mut self.reports);
        }
        terminate(&self.registration_pool, &mut self.reports);

        if let Err(e) = self.cache.drop_all() {
            tracing::error!("Failed to drop temporary tables of {}: {}", self.file, e);
        }
        self.lookup.shutdown_all();
        self.env.events.flush();

        let validation_errors = self.env.control.validation_errors();
        if validation_errors > 0 {
            tracing::warn!("{} validation error(s) so far", validation_errors);
        }

        std::mem::take(&mut self.reports)
    }
}

impl Drop for ImportSession<'_> {
    fn drop(&mut self) {
        if !self.closed {
            self.close();
        }
    }
}

/// Force down a pool that has not terminated and record its final state.
fn terminate<T: Send + 'static>(pool: &WorkerPool<T>, reports: &mut Vec<PoolReport>) {
    if !pool.is_terminated() {
        let discarded = pool.shutdown_now();
        if discarded > 0 {
            tracing::debug!("Pool '{}' discarded {} item(s) at cleanup", pool.name(), discarded);
        }
    }
    reports.push(PoolReport::new(pool));
}

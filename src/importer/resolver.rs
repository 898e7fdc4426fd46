//! XLink resolver stage
//!
//! Resolves references read back by the splitter against the lookup servers
//! and writes the deferred updates. Processed references are removed from
//! their spill table once the batch commits. Resolving a geometry reference
//! copies the target subtree, and unresolved placeholders inside the copy are
//! handed back to the registration pool.

use crate::cache::{CacheManager, CacheTableKind};
use crate::concurrent::{Worker, WorkerFactory, WorkerPool};
use crate::event::{CounterKind, Event, EventDispatcher};
use crate::lookup::LookupServerManager;
use crate::model::{ReferenceKind, UnresolvedReference};
use crate::storage::{DbPool, SqliteStore};
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;

pub struct XlinkResolverContext {
    pub db: DbPool,
    pub lookup: Arc<LookupServerManager>,
    pub cache: Arc<CacheManager>,
    pub registration_pool: Arc<WorkerPool<UnresolvedReference>>,
    pub events: Arc<EventDispatcher>,
    pub batch_size: usize,
}

pub struct XlinkResolverWorkerFactory {
    ctx: Arc<XlinkResolverContext>,
}

impl XlinkResolverWorkerFactory {
    pub fn new(ctx: XlinkResolverContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }
}

impl WorkerFactory<UnresolvedReference> for XlinkResolverWorkerFactory {
    fn create_worker(&self) -> Result<Box<dyn Worker<UnresolvedReference>>> {
        Ok(Box::new(XlinkResolverWorker {
            store: self.ctx.db.connect()?,
            ctx: Arc::clone(&self.ctx),
            batch: ResolverBatch::default(),
        }))
    }
}

#[derive(Default)]
struct ResolverBatch {
    size: usize,
    resolved: u64,
    /// Spill table ids to delete after commit, by kind
    processed: HashMap<ReferenceKind, Vec<i64>>,
    discovered: Vec<UnresolvedReference>,
}

pub struct XlinkResolverWorker {
    ctx: Arc<XlinkResolverContext>,
    store: SqliteStore,
    batch: ResolverBatch,
}

impl XlinkResolverWorker {
    /// `Ok(false)` when the target is unknown
    fn resolve(&mut self, reference: &UnresolvedReference) -> Result<bool> {
        let Some(target) = self.ctx.lookup.lookup(reference.kind.into(), &reference.target_gml_id)? else {
            tracing::warn!(
                "Could not resolve {} reference from {}.{} {} to '{}'",
                reference.kind,
                reference.referencing_table(),
                reference.referencing_column(),
                reference.referencing_id,
                reference.target_gml_id
            );
            return Ok(false);
        };

        self.store.savepoint()?;
        let outcome = match reference.kind {
            ReferenceKind::Feature => self
                .store
                .update_reference(reference.referencing, reference.referencing_id, target.database_key)
                .map(|_| Vec::new()),
            ReferenceKind::Geometry => self
                .store
                .resolve_geometry_xlink(reference.referencing_id, target.database_key),
        };

        match outcome {
            Ok(pending) => {
                self.store.release_savepoint()?;
                self.batch.discovered.extend(
                    pending
                        .into_iter()
                        .map(|(id, href)| UnresolvedReference::geometry(id, href)),
                );
                Ok(true)
            }
            Err(e) => {
                if let Err(undo) = self.store.rollback_to_savepoint() {
                    tracing::error!("Failed to undo partial resolution: {}", undo);
                }
                Err(e)
            }
        }
    }

    fn commit_batch(&mut self) {
        if !self.store.in_transaction() {
            return;
        }

        let batch = std::mem::take(&mut self.batch);
        if let Err(e) = self.store.commit() {
            tracing::error!("Failed to commit {} resolved reference(s): {}", batch.size, e);
            if let Err(e) = self.store.rollback() {
                tracing::debug!("Rollback after failed commit: {}", e);
            }
            return;
        }

        for (kind, ids) in batch.processed {
            let Some(table) = self.ctx.cache.get_table(CacheTableKind::for_references(kind)) else {
                continue;
            };
            if let Err(e) = table.delete_references(&ids) {
                tracing::warn!("Failed to remove {} processed {} reference(s): {}", ids.len(), kind, e);
            }
        }

        if batch.resolved > 0 {
            self.ctx
                .events
                .publish(Event::counter(CounterKind::XlinkResolved, batch.resolved));
        }

        for reference in batch.discovered {
            if let Err(e) = self.ctx.registration_pool.submit(reference) {
                tracing::warn!("Dropping copied geometry references: {}", e);
                break;
            }
        }
    }
}

impl Worker<UnresolvedReference> for XlinkResolverWorker {
    fn do_work(&mut self, reference: UnresolvedReference) {
        if !self.store.in_transaction() {
            if let Err(e) = self.store.begin_transaction() {
                tracing::error!("Failed to start resolver transaction: {}", e);
                return;
            }
        }

        match self.resolve(&reference) {
            Ok(resolved) => {
                if resolved {
                    self.batch.resolved += 1;
                }
                self.batch.processed.entry(reference.kind).or_default().push(reference.id);
            }
            Err(e) => tracing::error!(
                "Failed to resolve {} reference to '{}': {}",
                reference.kind,
                reference.target_gml_id,
                e
            ),
        }

        self.batch.size += 1;
        if self.batch.size >= self.ctx.batch_size {
            self.commit_batch();
        }
    }

    fn flush(&mut self) {
        self.commit_batch();
    }

    fn shutdown(&mut self) {
        self.commit_batch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrent::PoolConfig;
    use crate::config::LookupServerConfig;
    use crate::importer::splitter::XlinkSplitter;
    use crate::importer::xlink::XlinkRegistrationWorkerFactory;
    use crate::lookup::{LookupEntry, LookupServerKind};
    use crate::model::FeatureKind;
    use crate::storage::CityObjectRow;
    use std::time::Duration;

    fn building(store: &SqliteStore, gml_id: &str) -> i64 {
        store
            .insert_city_object(&CityObjectRow {
                gml_id: Some(gml_id),
                codespace: None,
                object_class: "Building",
                kind: FeatureKind::Building,
                parent_id: None,
                root_id: None,
                workspace: "LIVE",
                import_file: None,
            })
            .unwrap()
    }

    #[test]
    fn test_references_resolved_once_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let db = DbPool::new(dir.path().join("city.db"), Duration::from_secs(5));
        let store = db.connect().unwrap();
        let source = building(&store, "b1");
        let target = building(&store, "b2");
        let resolvable = store.insert_object_reference(source, "relatedTo", "b2", None).unwrap();
        let dangling = store.insert_object_reference(source, "relatedTo", "missing", None).unwrap();

        let cache = Arc::new(CacheManager::in_memory().unwrap());
        let lookup = Arc::new(LookupServerManager::new(Arc::clone(&cache)));
        lookup
            .init_server(LookupServerKind::Feature, &LookupServerConfig::default(), 100)
            .unwrap()
            .put(LookupEntry::new("b2", target, "Building"))
            .unwrap();

        let table = cache.create_table(CacheTableKind::XlinkFeature).unwrap();
        table
            .insert_references(&[
                UnresolvedReference::feature(resolvable, "b2"),
                UnresolvedReference::feature(dangling, "missing"),
            ])
            .unwrap();

        let events = Arc::new(EventDispatcher::new().unwrap());
        let registration = Arc::new(
            WorkerPool::new(
                PoolConfig::new("xlink-register", 1, 1),
                XlinkRegistrationWorkerFactory::new(Arc::clone(&cache), Arc::clone(&events), 10),
            )
            .unwrap(),
        );
        let resolver_pool = |name: &str| {
            Arc::new(
                WorkerPool::new(
                    PoolConfig::new(name, 1, 2),
                    XlinkResolverWorkerFactory::new(XlinkResolverContext {
                        db: db.clone(),
                        lookup: Arc::clone(&lookup),
                        cache: Arc::clone(&cache),
                        registration_pool: Arc::clone(&registration),
                        events: Arc::clone(&events),
                        batch_size: 10,
                    }),
                )
                .unwrap(),
            )
        };

        let first = resolver_pool("xlink-resolve");
        let splitter = XlinkSplitter::new(Arc::clone(&cache), Arc::clone(&first), Arc::clone(&registration), 1);
        assert_eq!(splitter.start_query().unwrap().dispatched, 2);
        first.shutdown_and_wait().unwrap();

        assert_eq!(store.reference_target(resolvable).unwrap(), Some(target));
        assert_eq!(store.reference_target(dangling).unwrap(), None);
        assert_eq!(table.count().unwrap(), 0);

        let second = resolver_pool("xlink-resolve-again");
        let rerun = XlinkSplitter::new(Arc::clone(&cache), Arc::clone(&second), registration, 1);
        assert_eq!(rerun.start_query().unwrap().dispatched, 0);
        second.shutdown_and_wait().unwrap();
    }
}

//! Database import stage
//!
//! Each worker owns a connection and writes features in batches of
//! `feature_batch_size` inside one `BEGIN IMMEDIATE` transaction. A single
//! feature is wrapped in a savepoint so a failing feature does not take its
//! batch down with it. Only after a batch commits are its identifiers handed
//! to the lookup servers and its unresolved references to the registration
//! pool, so the resolver never sees a key that is not yet visible.

use super::import_log::ImportLogger;
use crate::concurrent::{Worker, WorkerFactory, WorkerPool};
use crate::event::{Event, EventDispatcher};
use crate::lookup::{LookupEntry, LookupServerKind, LookupServerManager};
use crate::model::{Feature, FeatureKind, Geometry, GeometryKind, UnresolvedReference};
use crate::storage::{CityObjectRow, DbPool, GeometryRow, SqliteStore};
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;

pub struct DbImportContext {
    pub db: DbPool,
    pub workspace: String,
    pub codespace: Option<String>,
    pub import_file: String,
    pub batch_size: usize,
    pub lookup: Arc<LookupServerManager>,
    pub xlink_pool: Arc<WorkerPool<UnresolvedReference>>,
    pub events: Arc<EventDispatcher>,
    pub import_log: Option<Arc<ImportLogger>>,
}

pub struct DbImportWorkerFactory {
    ctx: Arc<DbImportContext>,
}

impl DbImportWorkerFactory {
    pub fn new(ctx: DbImportContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }
}

impl WorkerFactory<Feature> for DbImportWorkerFactory {
    fn create_worker(&self) -> Result<Box<dyn Worker<Feature>>> {
        let store = self.ctx.db.connect()?;
        Ok(Box::new(DbImportWorker {
            ctx: Arc::clone(&self.ctx),
            store,
            batch: Batch::default(),
        }))
    }
}

/// Everything written since the last commit
#[derive(Default)]
struct Batch {
    features: usize,
    feature_entries: Vec<LookupEntry>,
    geometry_entries: Vec<LookupEntry>,
    references: Vec<UnresolvedReference>,
    feature_counts: HashMap<FeatureKind, u64>,
    geometry_counts: HashMap<GeometryKind, u64>,
    /// Top-level features for the import log
    logged: Vec<(String, Option<String>)>,
}

#[derive(Clone, Copy)]
struct BatchMark {
    feature_entries: usize,
    geometry_entries: usize,
    references: usize,
}

impl Batch {
    fn mark(&self) -> BatchMark {
        BatchMark {
            feature_entries: self.feature_entries.len(),
            geometry_entries: self.geometry_entries.len(),
            references: self.references.len(),
        }
    }

    fn reset_to(&mut self, mark: BatchMark) {
        self.feature_entries.truncate(mark.feature_entries);
        self.geometry_entries.truncate(mark.geometry_entries);
        self.references.truncate(mark.references);
    }
}

pub struct DbImportWorker {
    ctx: Arc<DbImportContext>,
    store: SqliteStore,
    batch: Batch,
}

impl DbImportWorker {
    fn import(&mut self, feature: &Feature) -> Result<()> {
        if !self.store.in_transaction() {
            self.store.begin_transaction()?;
        }

        let mark = self.batch.mark();
        self.store.savepoint()?;

        let result = FeatureWriter {
            store: &self.store,
            ctx: &self.ctx,
            batch: &mut self.batch,
        }
        .import(feature, None);

        match result {
            Ok(_) => {
                self.store.release_savepoint()?;
                self.batch.features += 1;
                feature.count_features(&mut self.batch.feature_counts);
                feature.count_geometries(&mut self.batch.geometry_counts);
                if self.ctx.import_log.is_some() {
                    self.batch.logged.push((feature.class_name.clone(), feature.gml_id.clone()));
                }
                Ok(())
            }
            Err(e) => {
                if let Err(undo) = self.store.rollback_to_savepoint() {
                    tracing::error!("Failed to undo partially imported feature: {}", undo);
                }
                self.batch.reset_to(mark);
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
            tracing::error!("Failed to commit {} feature(s) from {}: {}", batch.features, self.ctx.import_file, e);
            if let Err(e) = self.store.rollback() {
                tracing::debug!("Rollback after failed commit: {}", e);
            }
            return;
        }

        tracing::trace!("Committed {} feature(s)", batch.features);
        self.publish(batch);
    }

    fn publish(&self, batch: Batch) {
        for (kind, entries) in [
            (LookupServerKind::Feature, batch.feature_entries),
            (LookupServerKind::Geometry, batch.geometry_entries),
        ] {
            if entries.is_empty() {
                continue;
            }
            match self.ctx.lookup.server(kind) {
                Some(server) => {
                    if let Err(e) = server.put_all(entries) {
                        tracing::error!("Failed to cache {} identifiers: {}", kind.as_str(), e);
                    }
                }
                None => tracing::warn!("No {} lookup server, identifiers are lost", kind.as_str()),
            }
        }

        for reference in batch.references {
            if let Err(e) = self.ctx.xlink_pool.submit(reference) {
                tracing::warn!("Dropping unresolved references: {}", e);
                break;
            }
        }

        if !batch.feature_counts.is_empty() {
            self.ctx.events.publish(Event::FeatureCounter(batch.feature_counts));
        }
        if !batch.geometry_counts.is_empty() {
            self.ctx.events.publish(Event::GeometryCounter(batch.geometry_counts));
        }

        if let Some(log) = &self.ctx.import_log {
            for (class_name, gml_id) in batch.logged {
                if let Err(e) = log.write(&class_name, gml_id.as_deref(), &self.ctx.import_file) {
                    tracing::warn!("Failed to write import log: {}", e);
                    break;
                }
            }
        }
    }
}

impl Worker<Feature> for DbImportWorker {
    fn do_work(&mut self, feature: Feature) {
        if let Err(e) = self.import(&feature) {
            tracing::error!(
                "Failed to import {} '{}': {}",
                feature.class_name,
                feature.gml_id.as_deref().unwrap_or("<no gml:id>"),
                e
            );
        }

        if self.batch.features >= self.ctx.batch_size {
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

#[derive(Debug, Clone, Copy)]
struct Parent {
    id: i64,
    root: i64,
}

type FeatureHandler = fn(&mut FeatureWriter<'_>, &Feature, Option<Parent>) -> Result<i64>;

/// Per-kind import handlers
fn handler_for(kind: FeatureKind) -> FeatureHandler {
    match kind {
        FeatureKind::CityObjectGroup => import_group,
        FeatureKind::ThematicSurface
        | FeatureKind::Opening
        | FeatureKind::WaterBoundarySurface
        | FeatureKind::TrafficArea
        | FeatureKind::ReliefComponent => import_component,
        _ => import_city_object,
    }
}

fn import_city_object(w: &mut FeatureWriter<'_>, feature: &Feature, parent: Option<Parent>) -> Result<i64> {
    let id = w.write_object(feature, parent)?;
    w.write_geometries(feature, id)?;
    w.write_references(feature, id)?;

    let this = Parent {
        id,
        root: parent.map_or(id, |p| p.root),
    };
    for child in &feature.children {
        w.import(child, Some(this))?;
    }
    Ok(id)
}

/// Boundary surfaces, openings and similar parts of an enclosing feature
fn import_component(w: &mut FeatureWriter<'_>, feature: &Feature, parent: Option<Parent>) -> Result<i64> {
    if parent.is_none() {
        tracing::debug!(
            "{} '{}' has no enclosing feature, importing it as a root",
            feature.class_name,
            feature.gml_id.as_deref().unwrap_or("")
        );
    }
    import_city_object(w, feature, parent)
}

/// Inline group members are city objects of their own, linked to the group by reference.
fn import_group(w: &mut FeatureWriter<'_>, group: &Feature, parent: Option<Parent>) -> Result<i64> {
    let id = w.write_object(group, parent)?;
    w.write_geometries(group, id)?;

    for member in &group.children {
        let member_id = w.import(member, None)?;
        w.store.insert_object_reference(
            id,
            "groupMember",
            member.gml_id.as_deref().unwrap_or_default(),
            Some(member_id),
        )?;
    }

    w.write_references(group, id)?;
    Ok(id)
}

struct FeatureWriter<'a> {
    store: &'a SqliteStore,
    ctx: &'a DbImportContext,
    batch: &'a mut Batch,
}

impl FeatureWriter<'_> {
    fn import(&mut self, feature: &Feature, parent: Option<Parent>) -> Result<i64> {
        handler_for(feature.kind)(self, feature, parent)
    }

    fn write_object(&mut self, feature: &Feature, parent: Option<Parent>) -> Result<i64> {
        let id = self.store.insert_city_object(&CityObjectRow {
            gml_id: feature.gml_id.as_deref(),
            codespace: self.ctx.codespace.as_deref(),
            object_class: &feature.class_name,
            kind: feature.kind,
            parent_id: parent.map(|p| p.id),
            root_id: parent.map(|p| p.root),
            workspace: &self.ctx.workspace,
            import_file: Some(&self.ctx.import_file),
        })?;

        if let Some(gml_id) = &feature.gml_id {
            self.batch
                .feature_entries
                .push(LookupEntry::new(gml_id.as_str(), id, feature.class_name.as_str()));
        }
        Ok(id)
    }

    fn write_geometries(&mut self, feature: &Feature, cityobject_id: i64) -> Result<()> {
        for geometry in &feature.geometries {
            self.write_geometry(geometry, cityobject_id, None, None)?;
        }
        Ok(())
    }

    fn write_geometry(
        &mut self,
        geometry: &Geometry,
        cityobject_id: i64,
        parent_id: Option<i64>,
        root_id: Option<i64>,
    ) -> Result<i64> {
        let id = self.store.insert_geometry(&GeometryRow {
            gml_id: geometry.gml_id.as_deref(),
            parent_id,
            root_id,
            cityobject_id: Some(cityobject_id),
            kind: geometry.kind,
            role: geometry.role.as_deref(),
            dimension: geometry.dimension,
            coordinates: &geometry.coordinates,
            xlink_href: geometry.href.as_deref(),
        })?;

        match (&geometry.href, &geometry.gml_id) {
            (Some(href), _) => self.batch.references.push(UnresolvedReference::geometry(id, href.as_str())),
            (None, Some(gml_id)) => self
                .batch
                .geometry_entries
                .push(LookupEntry::new(gml_id.as_str(), id, geometry.kind.as_str())),
            (None, None) => {}
        }

        let root = root_id.unwrap_or(id);
        for child in &geometry.children {
            self.write_geometry(child, cityobject_id, Some(id), Some(root))?;
        }
        Ok(id)
    }

    fn write_references(&mut self, feature: &Feature, cityobject_id: i64) -> Result<()> {
        for reference in &feature.references {
            let target = self.known_feature(&reference.target_gml_id)?;
            let reference_id =
                self.store
                    .insert_object_reference(cityobject_id, &reference.role, &reference.target_gml_id, target)?;
            if target.is_none() {
                self.batch
                    .references
                    .push(UnresolvedReference::feature(reference_id, reference.target_gml_id.as_str()));
            }
        }
        Ok(())
    }

    /// Key of a feature written earlier in this batch or already committed
    fn known_feature(&self, gml_id: &str) -> Result<Option<i64>> {
        if let Some(entry) = self.batch.feature_entries.iter().find(|e| e.gml_id == gml_id) {
            return Ok(Some(entry.database_key));
        }
        Ok(self
            .ctx
            .lookup
            .lookup(LookupServerKind::Feature, gml_id)?
            .map(|entry| entry.database_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheManager;
    use crate::concurrent::PoolConfig;
    use crate::config::LookupServerConfig;
    use crate::model::FeatureReference;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct Collect(Arc<Mutex<Vec<UnresolvedReference>>>);

    impl Worker<UnresolvedReference> for Collect {
        fn do_work(&mut self, work: UnresolvedReference) {
            self.0.lock().push(work);
        }
    }

    struct CollectFactory(Arc<Mutex<Vec<UnresolvedReference>>>);

    impl WorkerFactory<UnresolvedReference> for CollectFactory {
        fn create_worker(&self) -> Result<Box<dyn Worker<UnresolvedReference>>> {
            Ok(Box::new(Collect(Arc::clone(&self.0))))
        }
    }

    fn polygon(id: &str) -> Geometry {
        let mut polygon = Geometry::new(GeometryKind::Polygon, Some(id.to_string()));
        polygon.coordinates = vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [1.0, 1.0, 0.0], [0.0, 0.0, 0.0]];
        polygon
    }

    #[test]
    fn test_worker_writes_batch_and_hands_off_references() {
        let dir = tempfile::tempdir().unwrap();
        let db = DbPool::new(dir.path().join("city.db"), Duration::from_secs(5));
        let cache = Arc::new(CacheManager::in_memory().unwrap());
        let lookup = Arc::new(LookupServerManager::new(Arc::clone(&cache)));
        let config = LookupServerConfig::default();
        lookup.init_server(LookupServerKind::Feature, &config, 100).unwrap();
        lookup.init_server(LookupServerKind::Geometry, &config, 100).unwrap();

        let collected = Arc::new(Mutex::new(Vec::new()));
        let xlink_pool = Arc::new(
            WorkerPool::new(PoolConfig::new("xlink", 1, 1), CollectFactory(Arc::clone(&collected))).unwrap(),
        );
        let events = Arc::new(EventDispatcher::new().unwrap());

        let factory = DbImportWorkerFactory::new(DbImportContext {
            db: db.clone(),
            workspace: "LIVE".into(),
            codespace: None,
            import_file: "city.gml".into(),
            batch_size: 10,
            lookup: Arc::clone(&lookup),
            xlink_pool: Arc::clone(&xlink_pool),
            events,
            import_log: None,
        });
        let mut worker = factory.create_worker().unwrap();

        let mut building = Feature::new(FeatureKind::Building, "Building", Some("b1".into()));
        let mut solid = Geometry::new(GeometryKind::Solid, Some("s1".into()));
        solid.children.push(polygon("p1"));
        solid.children.push(Geometry::reference("p2"));
        building.geometries.push(solid);
        let mut roof = Feature::new(FeatureKind::ThematicSurface, "RoofSurface", Some("r1".into()));
        roof.geometries.push(polygon("p2"));
        building.children.push(roof);

        let mut group = Feature::new(FeatureKind::CityObjectGroup, "CityObjectGroup", Some("g1".into()));
        group.references.push(FeatureReference {
            role: "groupMember".into(),
            target_gml_id: "b1".into(),
        });
        group.references.push(FeatureReference {
            role: "groupMember".into(),
            target_gml_id: "later".into(),
        });

        worker.do_work(building);
        worker.do_work(group);
        worker.flush();
        xlink_pool.shutdown_and_wait().unwrap();

        let store = db.connect().unwrap();
        assert_eq!(store.count_city_objects().unwrap(), 3);
        let roof_id = store.find_city_object_id("r1").unwrap().unwrap();
        let building_id = store.find_city_object_id("b1").unwrap().unwrap();
        assert_ne!(roof_id, building_id);

        // the group's reference to b1 was resolved from the same batch
        let references = collected.lock().clone();
        assert_eq!(references.len(), 2);
        assert!(references.iter().any(|r| r.target_gml_id == "p2" && r.kind == crate::ReferenceKind::Geometry));
        assert!(references.iter().any(|r| r.target_gml_id == "later" && r.kind == crate::ReferenceKind::Feature));

        assert_eq!(
            lookup.lookup(LookupServerKind::Feature, "r1").unwrap().unwrap().database_key,
            roof_id
        );
        assert!(lookup.lookup(LookupServerKind::Geometry, "p2").unwrap().is_some());
    }
}

//! Lookup Server Manager
//!
//! One [`LookupServer`] per identifier space (features, geometries), each
//! backed by a spill table allocated from the session's cache manager.

pub mod server;

pub use server::{LookupServer, LookupStats};

use crate::cache::{CacheManager, CacheTableKind};
use crate::config::LookupServerConfig;
use crate::model::ReferenceKind;
use crate::Result;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Resolved identity of an imported feature or geometry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupEntry {
    pub gml_id: String,
    pub database_key: i64,
    /// Element name of the imported object, e.g. `Building` or `Polygon`
    pub object_class: String,
}

impl LookupEntry {
    pub fn new(gml_id: impl Into<String>, database_key: i64, object_class: impl Into<String>) -> Self {
        Self {
            gml_id: gml_id.into(),
            database_key,
            object_class: object_class.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LookupServerKind {
    Feature,
    Geometry,
}

impl LookupServerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LookupServerKind::Feature => "feature",
            LookupServerKind::Geometry => "geometry",
        }
    }

    pub fn cache_table(&self) -> CacheTableKind {
        match self {
            LookupServerKind::Feature => CacheTableKind::GmlIdFeature,
            LookupServerKind::Geometry => CacheTableKind::GmlIdGeometry,
        }
    }
}

impl From<ReferenceKind> for LookupServerKind {
    fn from(kind: ReferenceKind) -> Self {
        match kind {
            ReferenceKind::Feature => LookupServerKind::Feature,
            ReferenceKind::Geometry => LookupServerKind::Geometry,
        }
    }
}

pub struct LookupServerManager {
    cache: Arc<CacheManager>,
    servers: RwLock<HashMap<LookupServerKind, Arc<LookupServer>>>,
    shut_down: AtomicBool,
}

impl LookupServerManager {
    pub fn new(cache: Arc<CacheManager>) -> Self {
        Self {
            cache,
            servers: RwLock::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Create the server for `kind` together with its spill table.
    pub fn init_server(
        &self,
        kind: LookupServerKind,
        config: &LookupServerConfig,
        batch_size: usize,
    ) -> Result<Arc<LookupServer>> {
        let table = self.cache.create_table(kind.cache_table())?;
        let server = Arc::new(LookupServer::new(kind.as_str(), table, config, batch_size));
        self.servers.write().insert(kind, Arc::clone(&server));
        self.shut_down.store(false, Ordering::Release);

        tracing::debug!(
            "Initialized {} lookup server ({} partitions, cache size {})",
            kind.as_str(),
            server.partition_count(),
            config.cache_size
        );
        Ok(server)
    }

    pub fn server(&self, kind: LookupServerKind) -> Option<Arc<LookupServer>> {
        self.servers.read().get(&kind).cloned()
    }

    /// Look up a `gml:id` on the server for `kind`; `None` if that server is not running.
    pub fn lookup(&self, kind: LookupServerKind, gml_id: &str) -> Result<Option<LookupEntry>> {
        match self.server(kind) {
            Some(server) => server.lookup(gml_id),
            None => Ok(None),
        }
    }

    /// Release every server. Safe to call more than once.
    pub fn shutdown_all(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let servers: Vec<_> = self.servers.write().drain().collect();
        for (kind, server) in servers {
            tracing::debug!("{} lookup server: {}", kind.as_str(), server.stats());
            server.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_all_is_idempotent() {
        let cache = Arc::new(CacheManager::in_memory().unwrap());
        let manager = LookupServerManager::new(Arc::clone(&cache));
        let config = LookupServerConfig::default();

        let server = manager.init_server(LookupServerKind::Feature, &config, 100).unwrap();
        server.put(LookupEntry::new("b1", 1, "Building")).unwrap();
        assert_eq!(manager.lookup(LookupServerKind::Feature, "b1").unwrap().unwrap().database_key, 1);
        assert!(manager.lookup(LookupServerKind::Geometry, "b1").unwrap().is_none());

        manager.shutdown_all();
        manager.shutdown_all();
        assert!(manager.server(LookupServerKind::Feature).is_none());
        assert_eq!(server.resident_count(), 0);
    }

    #[test]
    fn test_init_server_reports_storage_error() {
        let cache = Arc::new(CacheManager::in_memory().unwrap());
        cache
            .connection()
            .lock()
            .execute("CREATE TABLE tmp_gmlid_geometry (x INTEGER)", [])
            .unwrap();

        let manager = LookupServerManager::new(Arc::clone(&cache));
        let result = manager.init_server(LookupServerKind::Geometry, &LookupServerConfig::default(), 10);
        assert!(matches!(result, Err(crate::Error::Storage(_))));
        assert!(manager.server(LookupServerKind::Geometry).is_none());
    }
}

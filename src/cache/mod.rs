//! Cache Manager
//!
//! Owns the spill database of one import session and every table allocated
//! in it. All tables are registered so that [`CacheManager::drop_all`] can
//! reclaim the session's storage no matter which component created them.

pub mod table;

pub use table::{CacheTable, CacheTableKind};

use crate::config::CacheConfig;
use crate::{Error, Result};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::TempDir;

const SPILL_FILE: &str = "spill.db";

pub struct CacheManager {
    conn: Arc<Mutex<Connection>>,
    tables: Mutex<HashMap<CacheTableKind, Arc<CacheTable>>>,
    /// Removed together with the spill database when the manager is dropped
    spill_dir: Option<TempDir>,
}

impl CacheManager {
    /// Open a fresh spill database as configured.
    pub fn open(config: &CacheConfig) -> Result<Self> {
        if config.in_memory {
            return Self::in_memory();
        }

        let dir = match &config.spill_dir {
            Some(parent) => {
                std::fs::create_dir_all(parent)?;
                tempfile::Builder::new().prefix("citydb-cache-").tempdir_in(parent)?
            }
            None => tempfile::Builder::new().prefix("citydb-cache-").tempdir()?,
        };

        let conn = Connection::open(dir.path().join(SPILL_FILE))?;
        // spill data never outlives the process
        conn.pragma_update(None, "synchronous", "OFF")?;
        conn.pragma_update_and_check(None, "journal_mode", "MEMORY", |row| row.get::<_, String>(0))?;

        tracing::debug!("Opened spill database in {}", dir.path().display());
        Ok(Self::with_connection(conn, Some(dir)))
    }

    /// Spill tables held in memory (small inputs and tests)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self::with_connection(conn, None))
    }

    fn with_connection(conn: Connection, spill_dir: Option<TempDir>) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            tables: Mutex::new(HashMap::new()),
            spill_dir,
        }
    }

    /// Allocate the table for `kind`, or return the already registered one.
    pub fn create_table(&self, kind: CacheTableKind) -> Result<Arc<CacheTable>> {
        let mut tables = self.tables.lock();
        if let Some(table) = tables.get(&kind) {
            return Ok(Arc::clone(table));
        }

        self.conn.lock().execute(&kind.create_statement(), [])?;
        let table = Arc::new(CacheTable::new(kind, Arc::clone(&self.conn)));
        tables.insert(kind, Arc::clone(&table));
        tracing::debug!("Created cache table {}", kind);
        Ok(table)
    }

    pub fn get_table(&self, kind: CacheTableKind) -> Option<Arc<CacheTable>> {
        self.tables.lock().get(&kind).cloned()
    }

    /// Number of currently registered tables
    pub fn table_count(&self) -> usize {
        self.tables.lock().len()
    }

    /// Drop every registered table.
    ///
    /// Each table is attempted even if an earlier one fails; the first failure
    /// is returned after all tables were tried. Calling again is a no-op.
    pub fn drop_all(&self) -> Result<()> {
        let tables: Vec<_> = self.tables.lock().drain().collect();
        let mut first_error: Option<Error> = None;

        for (kind, table) in tables {
            if let Err(e) = table.drop_table() {
                tracing::error!("Failed to drop cache table {}: {}", kind, e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Names of spill tables physically present in the spill database
    pub fn existing_tables(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE 'tmp\\_%' ESCAPE '\\' ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(names)
    }

    pub fn is_spilling_to_disk(&self) -> bool {
        self.spill_dir.is_some()
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("tables", &self.table_count())
            .field("on_disk", &self.is_spilling_to_disk())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::LookupEntry;
    use crate::model::UnresolvedReference;

    #[test]
    fn test_create_table_is_idempotent() {
        let cache = CacheManager::in_memory().unwrap();
        let a = cache.create_table(CacheTableKind::XlinkFeature).unwrap();
        let b = cache.create_table(CacheTableKind::XlinkFeature).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.table_count(), 1);
    }

    #[test]
    fn test_drop_all_twice() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            in_memory: false,
            spill_dir: Some(dir.path().to_path_buf()),
        };
        let cache = CacheManager::open(&config).unwrap();
        assert!(cache.is_spilling_to_disk());
        for kind in CacheTableKind::all() {
            cache.create_table(*kind).unwrap();
        }
        assert_eq!(cache.existing_tables().unwrap().len(), 4);

        cache.drop_all().unwrap();
        cache.drop_all().unwrap();
        assert_eq!(cache.table_count(), 0);
        assert!(cache.existing_tables().unwrap().is_empty());
    }

    #[test]
    fn test_reference_paging_and_delete() {
        let cache = CacheManager::in_memory().unwrap();
        let table = cache.create_table(CacheTableKind::XlinkGeometry).unwrap();

        let refs: Vec<_> = (1..=5).map(|i| UnresolvedReference::geometry(i, format!("poly_{}", i))).collect();
        assert_eq!(table.insert_references(&refs).unwrap(), 5);

        let first = table.fetch_page(0, 2).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].target_gml_id, "poly_1");
        let rest = table.fetch_page(first[1].id, 10).unwrap();
        assert_eq!(rest.len(), 3);

        table.delete_references(&[first[0].id, first[1].id]).unwrap();
        assert_eq!(table.count().unwrap(), 3);
    }

    #[test]
    fn test_table_shape_is_checked() {
        let cache = CacheManager::in_memory().unwrap();
        let lookup = cache.create_table(CacheTableKind::GmlIdFeature).unwrap();
        assert!(lookup.insert_references(&[UnresolvedReference::feature(1, "x")]).is_err());

        lookup
            .insert_lookup_batch(&[LookupEntry::new("b1", 10, "Building")])
            .unwrap();
        assert_eq!(lookup.find_lookup("b1").unwrap().unwrap().database_key, 10);
        assert!(lookup.find_lookup("b2").unwrap().is_none());
    }

    #[test]
    fn test_dropped_table_rejects_use() {
        let cache = CacheManager::in_memory().unwrap();
        let table = cache.create_table(CacheTableKind::XlinkFeature).unwrap();
        cache.drop_all().unwrap();
        assert!(table.is_dropped());
        assert!(table.fetch_page(0, 10).is_err());
    }
}

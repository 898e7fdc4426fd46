//! Spill tables
//!
//! Two shapes of table live in the spill database:
//! - lookup tables (`tmp_gmlid_*`) receive entries evicted from a lookup
//!   server partition
//! - xlink tables (`tmp_xlink_*`) hold unresolved references until the
//!   splitter pages them back out

use crate::lookup::LookupEntry;
use crate::model::{ReferenceKind, ReferencingColumn, UnresolvedReference};
use crate::{Error, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// The fixed set of spill tables a session can allocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheTableKind {
    GmlIdFeature,
    GmlIdGeometry,
    XlinkFeature,
    XlinkGeometry,
}

impl CacheTableKind {
    pub fn table_name(&self) -> &'static str {
        match self {
            CacheTableKind::GmlIdFeature => "tmp_gmlid_feature",
            CacheTableKind::GmlIdGeometry => "tmp_gmlid_geometry",
            CacheTableKind::XlinkFeature => "tmp_xlink_feature",
            CacheTableKind::XlinkGeometry => "tmp_xlink_geometry",
        }
    }

    pub fn all() -> &'static [CacheTableKind] {
        &[
            CacheTableKind::GmlIdFeature,
            CacheTableKind::GmlIdGeometry,
            CacheTableKind::XlinkFeature,
            CacheTableKind::XlinkGeometry,
        ]
    }

    /// Spill table holding unresolved references of `kind`
    pub fn for_references(kind: ReferenceKind) -> Self {
        match kind {
            ReferenceKind::Feature => CacheTableKind::XlinkFeature,
            ReferenceKind::Geometry => CacheTableKind::XlinkGeometry,
        }
    }

    pub fn is_lookup(&self) -> bool {
        matches!(self, CacheTableKind::GmlIdFeature | CacheTableKind::GmlIdGeometry)
    }

    fn reference_kind(&self) -> Option<ReferenceKind> {
        match self {
            CacheTableKind::XlinkFeature => Some(ReferenceKind::Feature),
            CacheTableKind::XlinkGeometry => Some(ReferenceKind::Geometry),
            _ => None,
        }
    }

    pub(crate) fn create_statement(&self) -> String {
        if self.is_lookup() {
            format!(
                "CREATE TABLE {} (
                    gmlid TEXT PRIMARY KEY,
                    db_key INTEGER NOT NULL,
                    object_class TEXT NOT NULL
                )",
                self.table_name()
            )
        } else {
            format!(
                "CREATE TABLE {} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    referencing TEXT NOT NULL,
                    referencing_id INTEGER NOT NULL,
                    target_gmlid TEXT NOT NULL
                )",
                self.table_name()
            )
        }
    }
}

impl std::fmt::Display for CacheTableKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.table_name())
    }
}

/// Handle to one allocated spill table.
pub struct CacheTable {
    kind: CacheTableKind,
    conn: Arc<Mutex<Connection>>,
    dropped: AtomicBool,
}

impl CacheTable {
    pub(crate) fn new(kind: CacheTableKind, conn: Arc<Mutex<Connection>>) -> Self {
        Self {
            kind,
            conn,
            dropped: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> CacheTableKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind.table_name()
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }

    fn check_usable(&self, lookup: bool) -> Result<()> {
        if self.is_dropped() {
            return Err(Error::InvalidValue(format!("cache table {} has been dropped", self.name())));
        }
        if self.kind.is_lookup() != lookup {
            return Err(Error::InvalidValue(format!(
                "cache table {} does not hold {}",
                self.name(),
                if lookup { "lookup entries" } else { "references" }
            )));
        }
        Ok(())
    }

    // ========== Lookup Operations ==========

    /// Store evicted lookup entries, replacing older keys for the same `gml:id`.
    pub fn insert_lookup_batch(&self, entries: &[LookupEntry]) -> Result<()> {
        self.check_usable(true)?;
        if entries.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let sql = format!(
                "INSERT OR REPLACE INTO {} (gmlid, db_key, object_class) VALUES (?1, ?2, ?3)",
                self.name()
            );
            let mut stmt = tx.prepare_cached(&sql)?;
            for entry in entries {
                stmt.execute(params![entry.gml_id, entry.database_key, entry.object_class])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn find_lookup(&self, gml_id: &str) -> Result<Option<LookupEntry>> {
        self.check_usable(true)?;
        let conn = self.conn.lock();
        let sql = format!("SELECT gmlid, db_key, object_class FROM {} WHERE gmlid = ?1", self.name());
        conn.query_row(&sql, [gml_id], |row| {
            Ok(LookupEntry {
                gml_id: row.get(0)?,
                database_key: row.get(1)?,
                object_class: row.get(2)?,
            })
        })
        .optional()
        .map_err(Into::into)
    }

    // ========== Reference Operations ==========

    /// Persist a batch of unresolved references in one transaction.
    pub fn insert_references(&self, references: &[UnresolvedReference]) -> Result<usize> {
        self.check_usable(false)?;
        if references.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let sql = format!(
                "INSERT INTO {} (referencing, referencing_id, target_gmlid) VALUES (?1, ?2, ?3)",
                self.name()
            );
            let mut stmt = tx.prepare_cached(&sql)?;
            for reference in references {
                stmt.execute(params![
                    reference.referencing.qualified_name(),
                    reference.referencing_id,
                    reference.target_gml_id,
                ])?;
            }
        }
        tx.commit()?;
        Ok(references.len())
    }

    /// Read up to `limit` references with an id greater than `after_id`, ordered by id.
    pub fn fetch_page(&self, after_id: i64, limit: usize) -> Result<Vec<UnresolvedReference>> {
        self.check_usable(false)?;
        let kind = self
            .kind
            .reference_kind()
            .ok_or_else(|| Error::InvalidValue(format!("cache table {} does not hold references", self.name())))?;

        let conn = self.conn.lock();
        let sql = format!(
            "SELECT id, referencing, referencing_id, target_gmlid FROM {} WHERE id > ?1 ORDER BY id LIMIT ?2",
            self.name()
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![after_id, limit as i64], |row| {
            let referencing: String = row.get(1)?;
            let referencing = referencing.parse::<ReferencingColumn>().map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
            })?;
            Ok(UnresolvedReference {
                id: row.get(0)?,
                referencing,
                referencing_id: row.get(2)?,
                target_gml_id: row.get(3)?,
                kind,
            })
        })?;

        let mut page = Vec::new();
        for row in rows {
            page.push(row?);
        }
        Ok(page)
    }

    pub fn delete_references(&self, ids: &[i64]) -> Result<usize> {
        self.check_usable(false)?;
        if ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut deleted = 0;
        {
            let sql = format!("DELETE FROM {} WHERE id = ?1", self.name());
            let mut stmt = tx.prepare_cached(&sql)?;
            for id in ids {
                deleted += stmt.execute([id])?;
            }
        }
        tx.commit()?;
        Ok(deleted)
    }

    pub fn count(&self) -> Result<usize> {
        if self.is_dropped() {
            return Ok(0);
        }
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", self.name()), [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Drop the backing table. Later calls are no-ops.
    pub(crate) fn drop_table(&self) -> Result<()> {
        if self.dropped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let conn = self.conn.lock();
        conn.execute(&format!("DROP TABLE {}", self.name()), [])?;
        Ok(())
    }
}

impl std::fmt::Debug for CacheTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheTable")
            .field("kind", &self.kind)
            .field("dropped", &self.is_dropped())
            .finish()
    }
}

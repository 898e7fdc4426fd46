//! SQLite storage implementation

use super::index::{IndexOutcome, IndexReport, IndexStatus};
use super::schema::{self, IndexKind};
use crate::model::{FeatureKind, GeometryKind, ReferencingColumn};
use crate::{Error, Result};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::time::Duration;

/// A feature row to insert
#[derive(Debug, Clone)]
pub struct CityObjectRow<'a> {
    pub gml_id: Option<&'a str>,
    pub codespace: Option<&'a str>,
    pub object_class: &'a str,
    pub kind: FeatureKind,
    pub parent_id: Option<i64>,
    /// `None` for top-level features, which become their own root
    pub root_id: Option<i64>,
    pub workspace: &'a str,
    pub import_file: Option<&'a str>,
}

/// A geometry node to insert
#[derive(Debug, Clone)]
pub struct GeometryRow<'a> {
    pub gml_id: Option<&'a str>,
    pub parent_id: Option<i64>,
    /// `None` for the top node of a geometry tree
    pub root_id: Option<i64>,
    pub cityobject_id: Option<i64>,
    pub kind: GeometryKind,
    pub role: Option<&'a str>,
    pub dimension: u8,
    pub coordinates: &'a [[f64; 3]],
    /// Referenced `gml:id` for XLink placeholders
    pub xlink_href: Option<&'a str>,
}

/// A geometry node as stored
#[derive(Debug, Clone, PartialEq)]
pub struct StoredGeometry {
    pub id: i64,
    pub gml_id: Option<String>,
    pub parent_id: Option<i64>,
    pub root_id: Option<i64>,
    pub cityobject_id: Option<i64>,
    pub geometry_type: String,
    pub role: Option<String>,
    pub dimension: u8,
    pub coordinates: Option<String>,
    pub is_xlink: bool,
    pub xlink_href: Option<String>,
    pub xlink_ref_id: Option<i64>,
}

impl StoredGeometry {
    pub fn is_unresolved_xlink(&self) -> bool {
        self.is_xlink && self.xlink_ref_id.is_none()
    }
}

/// SQLite-backed storage for imported city objects
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open a database file (creates if doesn't exist)
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_timeout(path, Duration::from_secs(30))
    }

    /// Open a database file for concurrent use: WAL journal, waiting up to
    /// `busy_timeout` for other writers.
    pub fn open_with_timeout(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        let store = Self { conn };
        store.initialize_schema()?;
        Ok(store)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.initialize_schema()?;
        Ok(store)
    }

    /// Initialize the database schema
    fn initialize_schema(&self) -> Result<()> {
        let fresh = !self.table_exists("cityobject")?;
        for stmt in schema::all_schema_statements() {
            self.conn.execute(stmt, [])?;
        }
        if fresh {
            for stmt in schema::initial_statements() {
                self.conn.execute(&stmt, [])?;
            }
        }
        Ok(())
    }

    fn table_exists(&self, name: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // ========== Workspace Operations ==========

    pub fn workspace_exists(&self, name: &str) -> Result<bool> {
        let found: Option<String> = self
            .conn
            .query_row("SELECT name FROM database_workspace WHERE name = ?1", [name], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    pub fn create_workspace(&self, name: &str) -> Result<()> {
        self.conn
            .execute("INSERT OR IGNORE INTO database_workspace (name) VALUES (?1)", [name])?;
        Ok(())
    }

    // ========== Index Operations ==========

    /// Drop every index of `kind`. A missing index is reported as a failure
    /// for that index only.
    pub fn drop_indexes(&self, kind: IndexKind) -> IndexReport {
        let statuses = schema::indexes_of(kind)
            .map(|def| {
                let outcome = match self.conn.execute(&format!("DROP INDEX {}", def.name), []) {
                    Ok(_) => IndexOutcome::Dropped,
                    Err(e) => IndexOutcome::Failed(e.to_string()),
                };
                IndexStatus::new(def, outcome)
            })
            .collect();
        IndexReport { kind, statuses }
    }

    pub fn create_indexes(&self, kind: IndexKind) -> IndexReport {
        let statuses = schema::indexes_of(kind)
            .map(|def| {
                let outcome = match self.conn.execute(&def.create_statement(), []) {
                    Ok(_) => IndexOutcome::Created,
                    Err(e) => IndexOutcome::Failed(e.to_string()),
                };
                IndexStatus::new(def, outcome)
            })
            .collect();
        IndexReport { kind, statuses }
    }

    pub fn index_exists(&self, name: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = ?1",
            [name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // ========== City Object Operations ==========

    /// Insert a feature row and return its key
    pub fn insert_city_object(&self, row: &CityObjectRow<'_>) -> Result<i64> {
        let mut stmt = self.conn.prepare_cached(
            r#"
            INSERT INTO cityobject (gmlid, gmlid_codespace, objectclass, kind, parent_id, root_id, workspace, import_file)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )?;
        stmt.execute(params![
            row.gml_id,
            row.codespace,
            row.object_class,
            row.kind.as_str(),
            row.parent_id,
            row.root_id,
            row.workspace,
            row.import_file,
        ])?;
        let id = self.conn.last_insert_rowid();

        if row.root_id.is_none() {
            self.conn
                .execute("UPDATE cityobject SET root_id = ?1 WHERE id = ?1", [id])?;
        }
        Ok(id)
    }

    pub fn find_city_object_id(&self, gml_id: &str) -> Result<Option<i64>> {
        self.conn
            .query_row("SELECT id FROM cityobject WHERE gmlid = ?1 ORDER BY id LIMIT 1", [gml_id], |row| {
                row.get(0)
            })
            .optional()
            .map_err(Into::into)
    }

    /// Count imported features per object class
    pub fn count_by_class(&self) -> Result<Vec<(String, usize)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT objectclass, COUNT(*) FROM cityobject GROUP BY objectclass ORDER BY objectclass")?;

        let counts = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize)))?
            .filter_map(|r| r.ok())
            .collect();

        Ok(counts)
    }

    pub fn count_city_objects(&self) -> Result<usize> {
        self.count("SELECT COUNT(*) FROM cityobject")
    }

    // ========== Geometry Operations ==========

    /// Insert a geometry node and return its key
    pub fn insert_geometry(&self, row: &GeometryRow<'_>) -> Result<i64> {
        let coordinates = if row.coordinates.is_empty() {
            None
        } else {
            Some(encode_coordinates(row.coordinates, row.dimension))
        };

        let mut stmt = self.conn.prepare_cached(
            r#"
            INSERT INTO surface_geometry
                (gmlid, parent_id, root_id, cityobject_id, geometry_type, role, dimension, coordinates, is_xlink, xlink_href)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )?;
        stmt.execute(params![
            row.gml_id,
            row.parent_id,
            row.root_id,
            row.cityobject_id,
            row.kind.as_str(),
            row.role,
            row.dimension,
            coordinates,
            row.xlink_href.is_some(),
            row.xlink_href,
        ])?;
        let id = self.conn.last_insert_rowid();

        if row.root_id.is_none() {
            self.conn
                .execute("UPDATE surface_geometry SET root_id = ?1 WHERE id = ?1", [id])?;
        }
        Ok(id)
    }

    pub fn load_geometry(&self, id: i64) -> Result<Option<StoredGeometry>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM surface_geometry WHERE id = ?1", GEOMETRY_COLUMNS),
                [id],
                row_to_geometry,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn child_geometries(&self, parent_id: i64) -> Result<Vec<StoredGeometry>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {} FROM surface_geometry WHERE parent_id = ?1 AND id <> ?1 ORDER BY id",
            GEOMETRY_COLUMNS
        ))?;

        let children = stmt
            .query_map([parent_id], row_to_geometry)?
            .filter_map(|r| r.ok())
            .collect();

        Ok(children)
    }

    pub fn find_geometry_id(&self, gml_id: &str) -> Result<Option<i64>> {
        self.conn
            .query_row(
                "SELECT id FROM surface_geometry WHERE gmlid = ?1 ORDER BY id LIMIT 1",
                [gml_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn count_geometries(&self) -> Result<usize> {
        self.count("SELECT COUNT(*) FROM surface_geometry")
    }

    // ========== Reference Operations ==========

    /// Insert a feature-to-feature reference; `target_id` is `None` while unresolved
    pub fn insert_object_reference(
        &self,
        cityobject_id: i64,
        role: &str,
        target_gml_id: &str,
        target_id: Option<i64>,
    ) -> Result<i64> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO cityobject_reference (cityobject_id, role, target_gmlid, target_id) VALUES (?1, ?2, ?3, ?4)",
        )?;
        stmt.execute(params![cityobject_id, role, target_gml_id, target_id])?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn reference_target(&self, reference_id: i64) -> Result<Option<i64>> {
        let target: Option<Option<i64>> = self
            .conn
            .query_row(
                "SELECT target_id FROM cityobject_reference WHERE id = ?1",
                [reference_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(target.flatten())
    }

    /// Write a resolved key into the referencing column. Returns the number of updated rows.
    pub fn update_reference(&self, column: ReferencingColumn, referencing_id: i64, key: i64) -> Result<usize> {
        let sql = format!("UPDATE {} SET {} = ?1 WHERE id = ?2", column.table(), column.column());
        let updated = self.conn.execute(&sql, params![key, referencing_id])?;
        Ok(updated)
    }

    /// Resolve a geometry placeholder against the geometry `target_id`.
    ///
    /// The placeholder takes over the target's type and coordinates and
    /// receives a copy of the target's subtree. Copied nodes that are
    /// themselves unresolved placeholders are returned as `(id, href)` so
    /// they can be registered for resolution.
    pub fn resolve_geometry_xlink(&self, placeholder_id: i64, target_id: i64) -> Result<Vec<(i64, String)>> {
        let placeholder = self
            .load_geometry(placeholder_id)?
            .ok_or_else(|| Error::InvalidValue(format!("geometry placeholder {} does not exist", placeholder_id)))?;
        let target = self
            .load_geometry(target_id)?
            .ok_or_else(|| Error::InvalidValue(format!("geometry {} does not exist", target_id)))?;

        self.conn.execute(
            r#"
            UPDATE surface_geometry
            SET xlink_ref_id = ?1, geometry_type = ?2, dimension = ?3, coordinates = ?4
            WHERE id = ?5
            "#,
            params![target.id, target.geometry_type, target.dimension, target.coordinates, placeholder_id],
        )?;

        let mut pending = Vec::new();
        self.copy_subtree(target.id, placeholder_id, &placeholder, &mut pending)?;
        Ok(pending)
    }

    fn copy_subtree(
        &self,
        source_parent: i64,
        dest_parent: i64,
        anchor: &StoredGeometry,
        pending: &mut Vec<(i64, String)>,
    ) -> Result<()> {
        for child in self.child_geometries(source_parent)? {
            // a placeholder pointing at one of its own ancestors
            if child.id == anchor.id {
                continue;
            }

            self.conn.execute(
                r#"
                INSERT INTO surface_geometry
                    (gmlid, parent_id, root_id, cityobject_id, geometry_type, role, dimension, coordinates, is_xlink, xlink_href, xlink_ref_id)
                VALUES (NULL, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
                params![
                    dest_parent,
                    anchor.root_id,
                    anchor.cityobject_id,
                    child.geometry_type,
                    child.role,
                    child.dimension,
                    child.coordinates,
                    child.is_xlink,
                    child.xlink_href,
                    child.xlink_ref_id,
                ],
            )?;
            let copy_id = self.conn.last_insert_rowid();

            if child.is_unresolved_xlink() {
                if let Some(href) = &child.xlink_href {
                    pending.push((copy_id, href.clone()));
                }
            }
            self.copy_subtree(child.id, copy_id, anchor, pending)?;
        }
        Ok(())
    }

    // ========== Bulk Operations ==========

    /// Begin a write transaction for bulk operations
    pub fn begin_transaction(&mut self) -> Result<()> {
        self.conn.execute("BEGIN IMMEDIATE", [])?;
        Ok(())
    }

    /// Commit a transaction
    pub fn commit(&mut self) -> Result<()> {
        self.conn.execute("COMMIT", [])?;
        Ok(())
    }

    /// Rollback a transaction
    pub fn rollback(&mut self) -> Result<()> {
        self.conn.execute("ROLLBACK", [])?;
        Ok(())
    }

    pub fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    /// Mark a point inside the current transaction that a single feature can be undone to
    pub fn savepoint(&self) -> Result<()> {
        self.conn.execute_batch("SAVEPOINT feature")?;
        Ok(())
    }

    pub fn release_savepoint(&self) -> Result<()> {
        self.conn.execute_batch("RELEASE SAVEPOINT feature")?;
        Ok(())
    }

    /// Undo everything since [`savepoint`](Self::savepoint), keeping the enclosing transaction
    pub fn rollback_to_savepoint(&self) -> Result<()> {
        self.conn
            .execute_batch("ROLLBACK TO SAVEPOINT feature; RELEASE SAVEPOINT feature")?;
        Ok(())
    }

    /// Get database statistics
    pub fn stats(&self) -> Result<DbStats> {
        Ok(DbStats {
            city_objects: self.count_city_objects()?,
            geometries: self.count_geometries()?,
            object_references: self.count("SELECT COUNT(*) FROM cityobject_reference")?,
            unresolved_references: self.count("SELECT COUNT(*) FROM cityobject_reference WHERE target_id IS NULL")?,
            unresolved_xlinks: self.count(
                "SELECT COUNT(*) FROM surface_geometry WHERE is_xlink = 1 AND xlink_ref_id IS NULL",
            )?,
            workspaces: self.count("SELECT COUNT(*) FROM database_workspace")?,
        })
    }

    fn count(&self, sql: &str) -> Result<usize> {
        let count: i64 = self.conn.query_row(sql, [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

const GEOMETRY_COLUMNS: &str = "id, gmlid, parent_id, root_id, cityobject_id, geometry_type, role, dimension, coordinates, is_xlink, xlink_href, xlink_ref_id";

fn row_to_geometry(row: &rusqlite::Row) -> rusqlite::Result<StoredGeometry> {
    Ok(StoredGeometry {
        id: row.get(0)?,
        gml_id: row.get(1)?,
        parent_id: row.get(2)?,
        root_id: row.get(3)?,
        cityobject_id: row.get(4)?,
        geometry_type: row.get(5)?,
        role: row.get(6)?,
        dimension: row.get(7)?,
        coordinates: row.get(8)?,
        is_xlink: row.get(9)?,
        xlink_href: row.get(10)?,
        xlink_ref_id: row.get(11)?,
    })
}

/// Space separated ordinates, `dimension` values per point
pub fn encode_coordinates(points: &[[f64; 3]], dimension: u8) -> String {
    let dim = usize::from(dimension.clamp(2, 3));
    let mut out = String::with_capacity(points.len() * dim * 12);
    for point in points {
        for value in &point[..dim] {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(&value.to_string());
        }
    }
    out
}

pub fn decode_coordinates(text: &str, dimension: u8) -> Result<Vec<[f64; 3]>> {
    let dim = usize::from(dimension.clamp(2, 3));
    let values = text
        .split_whitespace()
        .map(|v| v.parse::<f64>().map_err(|_| Error::InvalidValue(format!("not a coordinate: {}", v))))
        .collect::<Result<Vec<_>>>()?;

    if values.len() % dim != 0 {
        return Err(Error::InvalidValue(format!(
            "{} ordinates do not form {}D points",
            values.len(),
            dim
        )));
    }

    Ok(values
        .chunks(dim)
        .map(|c| [c[0], c[1], if dim == 3 { c[2] } else { 0.0 }])
        .collect())
}

/// Database statistics
#[derive(Debug, Clone)]
pub struct DbStats {
    pub city_objects: usize,
    pub geometries: usize,
    pub object_references: usize,
    pub unresolved_references: usize,
    pub unresolved_xlinks: usize,
    pub workspaces: usize,
}

impl std::fmt::Display for DbStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Database Statistics:")?;
        writeln!(f, "  City objects: {}", self.city_objects)?;
        writeln!(f, "  Geometries: {}", self.geometries)?;
        writeln!(f, "  Object references: {}", self.object_references)?;
        writeln!(f, "  Unresolved references: {}", self.unresolved_references)?;
        writeln!(f, "  Unresolved geometry xlinks: {}", self.unresolved_xlinks)?;
        writeln!(f, "  Workspaces: {}", self.workspaces)
    }
}

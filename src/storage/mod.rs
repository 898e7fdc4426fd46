//! Storage Layer - SQLite-backed city database
//!
//! Tables:
//! - cityobject(gmlid, objectclass, kind, parent_id, root_id, ...)
//! - surface_geometry(gmlid, parent_id, root_id, cityobject_id, geometry_type, coordinates, xlink_*)
//! - cityobject_reference(cityobject_id, role, target_gmlid, target_id)
//! - database_workspace(name)

pub mod index;
pub mod pool;
pub mod schema;
pub mod sqlite;

pub use index::{IndexOutcome, IndexReport, IndexStatus};
pub use pool::DbPool;
pub use schema::IndexKind;
pub use sqlite::{CityObjectRow, DbStats, GeometryRow, SqliteStore, StoredGeometry};

//! Per-worker database connections

use super::SqliteStore;
use crate::config::DatabaseConfig;
use crate::Result;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Hands out one [`SqliteStore`] per worker thread.
#[derive(Debug, Clone)]
pub struct DbPool {
    path: PathBuf,
    busy_timeout: Duration,
}

impl DbPool {
    pub fn new(path: impl Into<PathBuf>, busy_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            busy_timeout,
        }
    }

    pub fn from_config(config: &DatabaseConfig) -> Self {
        Self::new(&config.path, config.busy_timeout())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn connect(&self) -> Result<SqliteStore> {
        SqliteStore::open_with_timeout(&self.path, self.busy_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FeatureKind;
    use crate::storage::CityObjectRow;

    #[test]
    fn test_connections_share_the_database() {
        let dir = tempfile::tempdir().unwrap();
        let pool = DbPool::new(dir.path().join("city.db"), Duration::from_secs(5));

        let mut writer = pool.connect().unwrap();
        writer.begin_transaction().unwrap();
        writer
            .insert_city_object(&CityObjectRow {
                gml_id: Some("b1"),
                codespace: None,
                object_class: "Building",
                kind: FeatureKind::Building,
                parent_id: None,
                root_id: None,
                workspace: "LIVE",
                import_file: None,
            })
            .unwrap();
        writer.commit().unwrap();

        let reader = pool.connect().unwrap();
        assert!(reader.find_city_object_id("b1").unwrap().is_some());
    }
}

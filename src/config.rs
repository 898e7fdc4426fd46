//! Importer configuration
//!
//! Loaded from `impexp.toml`. Every section has defaults, so a partial file
//! (or no file at all) yields a runnable configuration.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the default database workspace, never checked for existence.
pub const DEFAULT_WORKSPACE: &str = "LIVE";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub importer: ImporterConfig,
    pub input: InputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub workspace: String,
    pub busy_timeout_ms: u64,
    pub indexes: IndexConfig,
    pub batching: BatchConfig,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("citydb.sqlite"),
            workspace: DEFAULT_WORKSPACE.to_string(),
            busy_timeout_ms: 30_000,
            indexes: IndexConfig::default(),
            batching: BatchConfig::default(),
        }
    }
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn is_default_workspace(&self) -> bool {
        self.workspace.trim().is_empty() || self.workspace.eq_ignore_ascii_case(DEFAULT_WORKSPACE)
    }
}

/// What to do with a group of indexes around the bulk load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IndexMode {
    #[default]
    Unchanged,
    /// Drop before the import and leave dropped
    Deactivate,
    /// Drop before the import and recreate afterwards
    DeactivateActivate,
}

impl IndexMode {
    pub fn deactivates(&self) -> bool {
        matches!(self, IndexMode::Deactivate | IndexMode::DeactivateActivate)
    }

    pub fn reactivates(&self) -> bool {
        matches!(self, IndexMode::DeactivateActivate)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct IndexConfig {
    pub spatial: IndexMode,
    pub normal: IndexMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Features per import transaction
    pub feature_batch_size: usize,
    /// References per spill table insert
    pub xlink_batch_size: usize,
    /// Resolved references per resolver transaction
    pub resolver_batch_size: usize,
    /// Evicted lookup entries per spill table insert
    pub lookup_cache_batch_size: usize,
    /// Spill rows read per splitter page
    pub splitter_batch_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            feature_batch_size: 20,
            xlink_batch_size: 1000,
            resolver_batch_size: 100,
            lookup_cache_batch_size: 1000,
            splitter_batch_size: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ImporterConfig {
    pub threads: ThreadConfig,
    pub lookup_server: LookupServersConfig,
    pub gml_id: GmlIdConfig,
    pub affine_transformation: AffineTransformConfig,
    pub filter: FilterConfig,
    pub validation: ValidationConfig,
    pub import_log: ImportLogConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadConfig {
    pub min_threads: usize,
    pub max_threads: usize,
    pub keep_alive_ms: u64,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(2);
        Self {
            min_threads: (cores / 2).max(1),
            max_threads: cores.max(1),
            keep_alive_ms: 60_000,
        }
    }
}

impl ThreadConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }

    pub fn queue_capacity(&self) -> usize {
        self.max_threads.max(1) * 2
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LookupServerConfig {
    /// Resident entries across all partitions
    pub cache_size: usize,
    /// Share of a full partition written to the spill table at once
    pub page_factor: f64,
    pub partitions: usize,
}

impl Default for LookupServerConfig {
    fn default() -> Self {
        Self {
            cache_size: 200_000,
            page_factor: 0.85,
            partitions: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LookupServersConfig {
    pub feature: LookupServerConfig,
    pub geometry: LookupServerConfig,
}

/// Codespace stored alongside each imported `gml:id`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CodespaceMode {
    #[default]
    None,
    /// Input file name
    Relative,
    /// Absolute input file path
    Absolute,
    /// `user_codespace`
    User,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GmlIdConfig {
    pub codespace: CodespaceMode,
    pub user_codespace: String,
}

impl GmlIdConfig {
    pub fn codespace_for(&self, file: &Path) -> Option<String> {
        match self.codespace {
            CodespaceMode::None => None,
            CodespaceMode::Relative => file.file_name().map(|n| n.to_string_lossy().into_owned()),
            CodespaceMode::Absolute => Some(
                std::fs::canonicalize(file)
                    .unwrap_or_else(|_| file.to_path_buf())
                    .display()
                    .to_string(),
            ),
            CodespaceMode::User => Some(self.user_codespace.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AffineTransformConfig {
    pub enabled: bool,
    /// Row-major 3x4 matrix `[R | t]`
    pub matrix: [[f64; 4]; 3],
}

impl Default for AffineTransformConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            matrix: [[1.0, 0.0, 0.0, 0.0], [0.0, 1.0, 0.0, 0.0], [0.0, 0.0, 1.0, 0.0]],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FilterConfig {
    pub feature_count: FeatureCountFilterConfig,
    /// Element names of top-level features to import, e.g. `Building`.
    /// Empty imports every class.
    pub feature_classes: Vec<String>,
    /// `gml:id`s of top-level features to import. Empty imports every feature.
    pub gml_ids: Vec<String>,
    /// Only import features whose envelope overlaps this box
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BoundingBoxConfig>,
}

/// Axis-aligned box in the x/y plane of the database coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBoxConfig {
    pub lower: [f64; 2],
    pub upper: [f64; 2],
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FeatureCountFilterConfig {
    /// First ordinal to import, 1-based
    pub first: Option<u64>,
    /// Last ordinal to import, inclusive
    pub last: Option<u64>,
}

impl FeatureCountFilterConfig {
    pub fn is_active(&self) -> bool {
        self.first.is_some() || self.last.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub enabled: bool,
    pub report_one_error_per_feature: bool,
    /// Strict mode, the first validation error interrupts the run
    pub abort_on_error: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            report_one_error_per_feature: true,
            abort_on_error: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportLogConfig {
    pub enabled: bool,
    /// Directory receiving `import-<timestamp>.log`
    pub path: PathBuf,
}

impl Default for ImportLogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from("import-logs"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CacheConfig {
    /// Keep spill tables in memory instead of a temporary file
    pub in_memory: bool,
    /// Parent directory of the temporary spill database, system temp by default
    pub spill_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct InputConfig {
    pub paths: Vec<PathBuf>,
}

impl Config {
    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let threads = &self.importer.threads;
        if threads.max_threads == 0 {
            return Err(Error::Config("max_threads must be at least 1".into()));
        }
        if threads.min_threads > threads.max_threads {
            return Err(Error::Config(format!(
                "min_threads ({}) must not exceed max_threads ({})",
                threads.min_threads, threads.max_threads
            )));
        }

        for (name, server) in [
            ("feature", &self.importer.lookup_server.feature),
            ("geometry", &self.importer.lookup_server.geometry),
        ] {
            if server.partitions == 0 {
                return Err(Error::Config(format!("{} lookup server needs at least one partition", name)));
            }
            if server.cache_size == 0 {
                return Err(Error::Config(format!("{} lookup server cache size must be positive", name)));
            }
            if !(server.page_factor > 0.0 && server.page_factor <= 1.0) {
                return Err(Error::Config(format!(
                    "{} lookup server page factor must be in (0, 1], got {}",
                    name, server.page_factor
                )));
            }
        }

        let b = &self.database.batching;
        for (name, value) in [
            ("feature_batch_size", b.feature_batch_size),
            ("xlink_batch_size", b.xlink_batch_size),
            ("resolver_batch_size", b.resolver_batch_size),
            ("lookup_cache_batch_size", b.lookup_cache_batch_size),
            ("splitter_batch_size", b.splitter_batch_size),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("{} must be positive", name)));
            }
        }

        let range = &self.importer.filter.feature_count;
        if let (Some(first), Some(last)) = (range.first, range.last) {
            if first > last {
                return Err(Error::Config(format!("feature count filter: first ({}) > last ({})", first, last)));
            }
        }

        if let Some(bbox) = &self.importer.filter.bbox {
            if bbox.lower[0] > bbox.upper[0] || bbox.lower[1] > bbox.upper[1] {
                return Err(Error::Config(format!(
                    "bounding box filter: lower corner {:?} exceeds upper corner {:?}",
                    bbox.lower, bbox.upper
                )));
            }
        }

        if self.importer.gml_id.codespace == CodespaceMode::User && self.importer.gml_id.user_codespace.is_empty() {
            return Err(Error::Config("user codespace mode requires user_codespace".into()));
        }

        Ok(())
    }
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("impexp.toml")
}

/// Load the configuration, falling back to defaults when the file is missing.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    if !path.exists() {
        return Ok(Config::default());
    }

    let contents = std::fs::read_to_string(&path)?;
    let config: Config = toml::from_str(&contents)?;
    Ok(config)
}

pub fn write_config(path: &Path, config: &Config, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("config already exists at {} (use --force to overwrite)", path.display());
    }

    let contents = toml::to_string_pretty(config)?;
    std::fs::write(path, contents)?;
    Ok(())
}

pub fn ensure_db_dir(db_path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [database]
            workspace = "Berlin"

            [importer.filter.feature_count]
            first = 3
            last = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.database.workspace, "Berlin");
        assert!(!config.database.is_default_workspace());
        assert_eq!(config.importer.filter.feature_count.first, Some(3));
        assert_eq!(config.database.batching.feature_batch_size, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_sizes() {
        let mut config = Config::default();
        config.importer.threads.min_threads = 4;
        config.importer.threads.max_threads = 2;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = Config::default();
        config.importer.lookup_server.geometry.page_factor = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.database.batching.splitter_batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_attribute_filters() {
        let config: Config = toml::from_str(
            r#"
            [importer.filter]
            feature_classes = ["Building", "CityObjectGroup"]
            gml_ids = ["b1"]

            [importer.filter.bbox]
            lower = [0.0, 0.0]
            upper = [100.0, 50.0]
            "#,
        )
        .unwrap();

        let filter = &config.importer.filter;
        assert_eq!(filter.feature_classes, vec!["Building", "CityObjectGroup"]);
        assert_eq!(filter.bbox.unwrap().upper, [100.0, 50.0]);
        assert!(!filter.feature_count.is_active());
        assert!(config.validate().is_ok());

        let mut config = config;
        config.importer.filter.bbox = Some(BoundingBoxConfig {
            lower: [10.0, 0.0],
            upper: [5.0, 5.0],
        });
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_write_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("impexp.toml");

        let mut config = Config::default();
        config.database.indexes.spatial = IndexMode::DeactivateActivate;
        write_config(&path, &config, false).unwrap();
        assert!(write_config(&path, &config, false).is_err());

        let loaded = load_config(Some(&path)).unwrap();
        assert_eq!(loaded.database.indexes.spatial, IndexMode::DeactivateActivate);
        assert_eq!(loaded.importer.affine_transformation.matrix[2][2], 1.0);
    }

    #[test]
    fn test_codespace_modes() {
        let mut gml_id = GmlIdConfig::default();
        let file = Path::new("data/berlin.gml");
        assert_eq!(gml_id.codespace_for(file), None);

        gml_id.codespace = CodespaceMode::Relative;
        assert_eq!(gml_id.codespace_for(file).as_deref(), Some("berlin.gml"));

        gml_id.codespace = CodespaceMode::User;
        gml_id.user_codespace = "urn:city".into();
        assert_eq!(gml_id.codespace_for(file).as_deref(), Some("urn:city"));
    }
}

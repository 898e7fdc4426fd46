//! Import log: one line per imported top-level feature

use crate::Result;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

const HEADER: &str = "FEATURE_TYPE,GMLID,INPUT_FILE";

pub struct ImportLogger {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    entries: AtomicU64,
}

impl ImportLogger {
    /// Create `import-<timestamp>.log` below `dir`.
    pub fn create(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let path = dir.join(format!("import-{}.log", stamp));

        let mut writer = BufWriter::new(File::create(&path)?);
        writeln!(writer, "{}", HEADER)?;

        tracing::info!("Writing import log to {}", path.display());
        Ok(Self {
            path,
            writer: Mutex::new(writer),
            entries: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, feature_type: &str, gml_id: Option<&str>, input_file: &str) -> Result<()> {
        let mut writer = self.writer.lock();
        writeln!(writer, "{},{},{}", feature_type, gml_id.unwrap_or(""), input_file)?;
        self.entries.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn entries(&self) -> u64 {
        self.entries.load(Ordering::Relaxed)
    }

    pub fn flush(&self) -> Result<()> {
        self.writer.lock().flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let log = ImportLogger::create(&dir.path().join("logs")).unwrap();
        log.write("Building", Some("b1"), "city.gml").unwrap();
        log.write("LandUse", None, "city.gml").unwrap();
        log.flush().unwrap();

        let contents = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines, vec![HEADER, "Building,b1,city.gml", "LandUse,,city.gml"]);
        assert_eq!(log.entries(), 2);
    }
}

//! Input expansion: files, directories and wildcard patterns to a sorted
//! list of CityGML files.

use crate::{Error, Result};
use ignore::WalkBuilder;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Extensions picked up when walking a directory
pub const CITYGML_EXTENSIONS: &[&str] = &["gml", "xml", "citygml"];

pub fn is_citygml_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| CITYGML_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
        .unwrap_or(false)
}

fn is_pattern(entry: &str) -> bool {
    entry.contains(['*', '?', '['])
}

/// Expand the configured input entries. Explicit files are kept whatever
/// their extension.
pub fn expand_inputs(entries: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = BTreeSet::new();

    for entry in entries {
        if entry.is_file() {
            files.insert(entry.clone());
        } else if entry.is_dir() {
            walk_dir(entry, &mut files);
        } else if is_pattern(&entry.to_string_lossy()) {
            expand_pattern(entry, &mut files)?;
        } else {
            tracing::warn!("Input {} does not exist", entry.display());
        }
    }

    if files.is_empty() {
        return Err(Error::Config("Failed to find CityGML files".into()));
    }
    tracing::debug!("Expanded {} input entr(ies) to {} file(s)", entries.len(), files.len());
    Ok(files.into_iter().collect())
}

fn walk_dir(root: &Path, files: &mut BTreeSet<PathBuf>) {
    let mut builder = WalkBuilder::new(root);
    builder.standard_filters(false).follow_links(false);

    for result in builder.build() {
        match result {
            Ok(entry) => {
                let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
                if is_file && is_citygml_file(entry.path()) {
                    files.insert(entry.into_path());
                }
            }
            Err(e) => tracing::warn!("Skipping unreadable entry below {}: {}", root.display(), e),
        }
    }
}

fn expand_pattern(pattern: &Path, files: &mut BTreeSet<PathBuf>) -> Result<()> {
    let pattern = pattern.to_string_lossy();
    let paths = glob::glob(&pattern).map_err(|e| Error::Config(format!("Invalid input pattern '{}': {}", pattern, e)))?;

    let before = files.len();
    for path in paths {
        match path {
            Ok(path) if path.is_file() => {
                files.insert(path);
            }
            Ok(path) if path.is_dir() => walk_dir(&path, files),
            Ok(_) => {}
            Err(e) => tracing::warn!("Skipping unreadable match of '{}': {}", pattern, e),
        }
    }
    if files.len() == before {
        tracing::warn!("No files found matching the pattern: {}", pattern);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_directory_walk_filters_extensions() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("district");
        fs::create_dir(&nested).unwrap();
        fs::write(dir.path().join("a.gml"), "").unwrap();
        fs::write(nested.join("b.CityGML"), "").unwrap();
        fs::write(nested.join("notes.txt"), "").unwrap();
        // hidden files are not skipped
        fs::write(dir.path().join(".c.xml"), "").unwrap();

        let files = expand_inputs(&[dir.path().to_path_buf()]).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 3);
        assert!(names.contains(&"b.CityGML".to_string()));
        assert!(!names.contains(&"notes.txt".to_string()));
    }

    #[test]
    fn test_pattern_and_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["t2.gml", "t1.gml", "other.gml"] {
            fs::write(dir.path().join(name), "").unwrap();
        }

        let files = expand_inputs(&[dir.path().join("t*.gml"), dir.path().join("t1.gml")]).unwrap();
        assert_eq!(files, vec![dir.path().join("t1.gml"), dir.path().join("t2.gml")]);
    }

    #[test]
    fn test_explicit_file_kept_whatever_its_extension() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("export.dat");
        fs::write(&file, "").unwrap();
        assert_eq!(expand_inputs(&[file.clone()]).unwrap(), vec![file]);
    }

    #[test]
    fn test_nothing_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = expand_inputs(&[dir.path().join("*.gml"), dir.path().join("missing.gml")]).unwrap_err();
        assert!(err.to_string().contains("Failed to find CityGML files"));
    }
}

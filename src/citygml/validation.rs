//! Structural validation of parsed features

use super::parser::parse_chunk;
use super::reader::CityGmlReader;
use crate::Result;
use std::path::{Path, PathBuf};

/// A structural problem found while parsing a chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    /// `gml:id` of the innermost enclosing feature
    pub gml_id: Option<String>,
    pub message: String,
    /// Byte offset within the chunk
    pub position: u64,
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.gml_id {
            Some(id) => write!(f, "[{}] offset {}: {}", id, self.position, self.message),
            None => write!(f, "offset {}: {}", self.position, self.message),
        }
    }
}

/// Outcome of validating a whole file
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub features: u64,
    /// Issues keyed by the ordinal of the feature they occurred in
    pub issues: Vec<(u64, ValidationIssue)>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Read, parse and validate every feature of a file without importing it.
pub fn validate_file(path: &Path) -> Result<ValidationReport> {
    let mut report = ValidationReport::default();

    for chunk in CityGmlReader::open(path)? {
        let chunk = chunk?;
        let parsed = parse_chunk(&chunk, true)?;
        if parsed.feature.is_some() {
            report.features += 1;
        }
        report
            .issues
            .extend(parsed.issues.into_iter().map(|issue| (chunk.ordinal, issue)));
    }

    tracing::debug!(
        "Validated {}: {} feature(s), {} issue(s)",
        path.display(),
        report.features,
        report.issues.len()
    );
    Ok(report)
}

/// Validate each file in turn. A file that cannot be read or parsed is
/// reported with its error and does not stop the others.
pub fn validate_files(paths: &[PathBuf]) -> Vec<(PathBuf, Result<ValidationReport>)> {
    paths
        .iter()
        .map(|path| {
            let outcome = validate_file(path);
            if let Err(e) = &outcome {
                tracing::debug!("Validation of {} failed: {}", path.display(), e);
            }
            (path.clone(), outcome)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_file_collects_issues_per_feature() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.gml");
        std::fs::write(
            &path,
            r#"<CityModel xmlns:gml="urn:gml">
  <cityObjectMember><Building gml:id="ok"/></cityObjectMember>
  <cityObjectMember>
    <Building gml:id="bad">
      <lod1Solid><gml:Solid><gml:exterior><gml:CompositeSurface><gml:surfaceMember>
        <gml:Polygon><gml:exterior><gml:LinearRing>
          <gml:posList>0 0 0 1 0 0 1 1</gml:posList>
        </gml:LinearRing></gml:exterior></gml:Polygon>
      </gml:surfaceMember></gml:CompositeSurface></gml:exterior></gml:Solid></lod1Solid>
    </Building>
  </cityObjectMember>
</CityModel>"#,
        )
        .unwrap();

        let report = validate_file(&path).unwrap();
        assert_eq!(report.features, 2);
        assert!(!report.is_valid());
        assert!(report.issues.iter().all(|(ordinal, _)| *ordinal == 2));
        assert_eq!(report.issues[0].1.gml_id.as_deref(), Some("bad"));
    }

    #[test]
    fn test_malformed_file_does_not_stop_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let malformed = dir.path().join("a.gml");
        std::fs::write(&malformed, "<CityModel><cityObjectMember><Building></cityObjectMember>").unwrap();
        let good = dir.path().join("b.gml");
        std::fs::write(
            &good,
            r#"<CityModel xmlns:gml="urn:gml"><cityObjectMember><Building gml:id="b1"/></cityObjectMember></CityModel>"#,
        )
        .unwrap();

        let results = validate_files(&[malformed.clone(), good.clone()]);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, malformed);
        assert!(results[0].1.is_err());
        assert_eq!(results[1].0, good);
        let report = results[1].1.as_ref().unwrap();
        assert!(report.is_valid());
        assert_eq!(report.features, 1);
    }
}

//! Affine coordinate transformation applied to every imported geometry

use crate::config::AffineTransformConfig;
use crate::model::Feature;
use crate::{Error, Result};

/// Determinants below this are treated as zero
const SINGULARITY_EPSILON: f64 = 1e-12;

/// `p' = R * p + t` with `[R | t]` given as a row-major 3x4 matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct AffineTransformer {
    matrix: [[f64; 4]; 3],
}

impl AffineTransformer {
    /// Fails with a configuration error if the linear part cannot be inverted.
    pub fn new(matrix: [[f64; 4]; 3]) -> Result<Self> {
        let det = determinant(&matrix);
        if !det.is_finite() || det.abs() < SINGULARITY_EPSILON {
            return Err(Error::Config("The homogeneous transformation matrix is singular".into()));
        }
        Ok(Self { matrix })
    }

    /// `None` when the transformation is disabled
    pub fn from_config(config: &AffineTransformConfig) -> Result<Option<Self>> {
        if !config.enabled {
            return Ok(None);
        }
        Self::new(config.matrix).map(Some)
    }

    pub fn transform_point(&self, p: [f64; 3]) -> [f64; 3] {
        let m = &self.matrix;
        let mut out = [0.0; 3];
        for (row, value) in out.iter_mut().enumerate() {
            *value = m[row][0] * p[0] + m[row][1] * p[1] + m[row][2] * p[2] + m[row][3];
        }
        out
    }

    /// Transform all coordinates of a feature tree in place.
    pub fn transform_feature(&self, feature: &mut Feature) {
        feature.for_each_geometry_mut(&mut |geometry| {
            for point in geometry.coordinates.iter_mut() {
                *point = self.transform_point(*point);
            }
        });
    }
}

fn determinant(m: &[[f64; 4]; 3]) -> f64 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1]) - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FeatureKind, Geometry, GeometryKind};

    #[test]
    fn test_translation_and_scale() {
        let t = AffineTransformer::new([[2.0, 0.0, 0.0, 10.0], [0.0, 2.0, 0.0, 20.0], [0.0, 0.0, 1.0, -5.0]]).unwrap();
        assert_eq!(t.transform_point([1.0, 1.0, 1.0]), [12.0, 22.0, -4.0]);
    }

    #[test]
    fn test_singular_matrix_is_a_config_error() {
        let singular = [[1.0, 2.0, 3.0, 0.0], [2.0, 4.0, 6.0, 0.0], [0.0, 0.0, 1.0, 0.0]];
        match AffineTransformer::new(singular) {
            Err(Error::Config(msg)) => assert!(msg.contains("singular")),
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[test]
    fn test_disabled_config_yields_none() {
        let mut config = AffineTransformConfig::default();
        assert!(AffineTransformer::from_config(&config).unwrap().is_none());
        config.enabled = true;
        config.matrix = [[0.0; 4]; 3];
        assert!(AffineTransformer::from_config(&config).is_err());
    }

    #[test]
    fn test_transform_feature_walks_nested_geometries() {
        let mut feature = Feature::new(FeatureKind::Building, "Building", None);
        let mut solid = Geometry::new(GeometryKind::Solid, None);
        let mut polygon = Geometry::new(GeometryKind::Polygon, None);
        polygon.coordinates = vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0]];
        solid.children.push(polygon);
        feature.geometries.push(solid);

        let t = AffineTransformer::new([[1.0, 0.0, 0.0, 100.0], [0.0, 1.0, 0.0, 0.0], [0.0, 0.0, 1.0, 0.0]]).unwrap();
        t.transform_feature(&mut feature);
        assert_eq!(feature.geometries[0].children[0].coordinates[1], [101.0, 0.0, 0.0]);
    }
}

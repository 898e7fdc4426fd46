//! Feature filters
//!
//! [`FeatureCountFilter`] decides on the ordinal of a feature before it is
//! parsed; [`FeatureFilter`] looks at the parsed feature. A feature dropped by
//! the attribute filters still took its ordinal.

use crate::config::{BoundingBoxConfig, FeatureCountFilterConfig, FilterConfig};
use crate::model::Feature;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    Forward,
    Skip,
    /// Past `last`, no later feature can match
    Exhausted,
}

/// Forwards only features whose ordinal lies in `[first, last]`.
///
/// The ordinal counts every top-level feature read during the run, across
/// all input files, whether or not it is forwarded.
#[derive(Debug, Default)]
pub struct FeatureCountFilter {
    first: u64,
    last: Option<u64>,
    seen: AtomicU64,
}

impl FeatureCountFilter {
    pub fn new(config: &FeatureCountFilterConfig) -> Self {
        Self {
            first: config.first.unwrap_or(1).max(1),
            last: config.last,
            seen: AtomicU64::new(0),
        }
    }

    /// Count one more feature and decide whether to forward it.
    pub fn next(&self) -> FilterDecision {
        let ordinal = self.seen.fetch_add(1, Ordering::AcqRel) + 1;
        match self.last {
            Some(last) if ordinal > last => FilterDecision::Exhausted,
            _ if ordinal < self.first => FilterDecision::Skip,
            _ => FilterDecision::Forward,
        }
    }

    /// True once every feature up to `last` has been counted
    pub fn is_exhausted(&self) -> bool {
        matches!(self.last, Some(last) if self.seen.load(Ordering::Acquire) >= last)
    }

    pub fn seen(&self) -> u64 {
        self.seen.load(Ordering::Acquire)
    }
}

/// Class, `gml:id` and bounding-box filters on parsed top-level features
#[derive(Debug, Clone, Default)]
pub struct FeatureFilter {
    classes: HashSet<String>,
    gml_ids: HashSet<String>,
    bbox: Option<BoundingBoxConfig>,
}

impl FeatureFilter {
    pub fn new(config: &FilterConfig) -> Self {
        Self {
            classes: config.feature_classes.iter().map(|c| c.trim().to_ascii_lowercase()).collect(),
            gml_ids: config.gml_ids.iter().map(|id| id.trim().to_string()).collect(),
            bbox: config.bbox,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.classes.is_empty() || !self.gml_ids.is_empty() || self.bbox.is_some()
    }

    /// True if `feature` passes every configured filter.
    pub fn accepts(&self, feature: &Feature) -> bool {
        self.accepts_class(feature) && self.accepts_id(feature) && self.accepts_extent(feature)
    }

    fn accepts_class(&self, feature: &Feature) -> bool {
        self.classes.is_empty()
            || self.classes.contains(&feature.class_name.to_ascii_lowercase())
            || self.classes.contains(&feature.kind.as_str().to_ascii_lowercase())
    }

    fn accepts_id(&self, feature: &Feature) -> bool {
        self.gml_ids.is_empty()
            || feature
                .gml_id
                .as_deref()
                .is_some_and(|id| self.gml_ids.contains(id))
    }

    /// Overlap test; a feature without coordinates has no extent and fails.
    fn accepts_extent(&self, feature: &Feature) -> bool {
        let Some(bbox) = &self.bbox else {
            return true;
        };
        let Some([min_x, min_y, max_x, max_y]) = feature.envelope() else {
            return false;
        };
        min_x <= bbox.upper[0] && max_x >= bbox.lower[0] && min_y <= bbox.upper[1] && max_y >= bbox.lower[1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FeatureKind, Geometry, GeometryKind};

    fn feature_at(kind: FeatureKind, class: &str, id: &str, x: f64, y: f64) -> Feature {
        let mut feature = Feature::new(kind, class, Some(id.into()));
        let mut polygon = Geometry::new(GeometryKind::Polygon, None);
        polygon.coordinates = vec![[x, y, 0.0], [x + 1.0, y, 0.0], [x + 1.0, y + 1.0, 0.0], [x, y, 0.0]];
        feature.geometries.push(polygon);
        feature
    }

    #[test]
    fn test_range_three_to_five() {
        let filter = FeatureCountFilter::new(&FeatureCountFilterConfig {
            first: Some(3),
            last: Some(5),
        });

        let forwarded: Vec<u64> = (1..=10)
            .filter(|_| !filter.is_exhausted())
            .filter_map(|ordinal| (filter.next() == FilterDecision::Forward).then_some(ordinal))
            .collect();

        assert_eq!(forwarded, vec![3, 4, 5]);
        assert!(filter.is_exhausted());
        assert_eq!(filter.seen(), 5);
    }

    #[test]
    fn test_inactive_filter_forwards_everything() {
        let filter = FeatureCountFilter::new(&FeatureCountFilterConfig::default());
        assert!((0..100).all(|_| filter.next() == FilterDecision::Forward));
        assert!(!filter.is_exhausted());
    }

    #[test]
    fn test_class_and_id_filters() {
        let filter = FeatureFilter::new(&FilterConfig {
            feature_classes: vec!["building".into(), "CityFurniture".into()],
            gml_ids: vec!["b1".into(), "f1".into(), "r1".into()],
            ..Default::default()
        });
        assert!(filter.is_active());

        assert!(filter.accepts(&feature_at(FeatureKind::Building, "Building", "b1", 0.0, 0.0)));
        assert!(filter.accepts(&feature_at(FeatureKind::CityFurniture, "CityFurniture", "f1", 0.0, 0.0)));
        assert!(!filter.accepts(&feature_at(FeatureKind::Building, "Building", "b2", 0.0, 0.0)));
        assert!(!filter.accepts(&feature_at(FeatureKind::TransportationComplex, "Road", "r1", 0.0, 0.0)));
    }

    #[test]
    fn test_bbox_keeps_overlapping_features() {
        let filter = FeatureFilter::new(&FilterConfig {
            bbox: Some(BoundingBoxConfig {
                lower: [0.0, 0.0],
                upper: [10.0, 10.0],
            }),
            ..Default::default()
        });

        assert!(filter.accepts(&feature_at(FeatureKind::Building, "Building", "in", 4.0, 4.0)));
        assert!(filter.accepts(&feature_at(FeatureKind::Building, "Building", "edge", 9.5, -0.5)));
        assert!(!filter.accepts(&feature_at(FeatureKind::Building, "Building", "out", 20.0, 4.0)));
        assert!(!filter.accepts(&Feature::new(FeatureKind::CityObjectGroup, "CityObjectGroup", None)));
    }

    #[test]
    fn test_empty_filter_accepts_everything() {
        let filter = FeatureFilter::new(&FilterConfig::default());
        assert!(!filter.is_active());
        assert!(filter.accepts(&Feature::new(FeatureKind::LandUse, "LandUse", None)));
    }
}

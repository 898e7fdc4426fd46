//! In-memory feature trees produced by the chunk parser

use super::kinds::{FeatureKind, GeometryKind};
use std::collections::HashMap;

/// A parsed CityGML feature with its nested features and geometries.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    /// `gml:id` as found in the file
    pub gml_id: Option<String>,
    pub kind: FeatureKind,
    /// Element local name, e.g. `RoofSurface`
    pub class_name: String,
    pub geometries: Vec<Geometry>,
    /// Nested features (boundary surfaces, building parts, ...)
    pub children: Vec<Feature>,
    /// `xlink:href` links to other features
    pub references: Vec<FeatureReference>,
}

impl Feature {
    pub fn new(kind: FeatureKind, class_name: impl Into<String>, gml_id: Option<String>) -> Self {
        Self {
            gml_id,
            kind,
            class_name: class_name.into(),
            geometries: Vec::new(),
            children: Vec::new(),
            references: Vec::new(),
        }
    }

    /// Add this feature and all nested features to `counts`.
    pub fn count_features(&self, counts: &mut HashMap<FeatureKind, u64>) {
        *counts.entry(self.kind).or_default() += 1;
        for child in &self.children {
            child.count_features(counts);
        }
    }

    /// Add every concrete geometry of this feature tree to `counts`.
    pub fn count_geometries(&self, counts: &mut HashMap<GeometryKind, u64>) {
        for geometry in &self.geometries {
            geometry.count(counts);
        }
        for child in &self.children {
            child.count_geometries(counts);
        }
    }

    /// 2D envelope `[min_x, min_y, max_x, max_y]` of all coordinates in the
    /// tree, `None` without any coordinates.
    pub fn envelope(&self) -> Option<[f64; 4]> {
        let mut envelope: Option<[f64; 4]> = None;
        self.extend_envelope(&mut envelope);
        envelope
    }

    fn extend_envelope(&self, envelope: &mut Option<[f64; 4]>) {
        for geometry in &self.geometries {
            geometry.extend_envelope(envelope);
        }
        for child in &self.children {
            child.extend_envelope(envelope);
        }
    }

    /// Apply `f` to every geometry in the tree, depth first.
    pub fn for_each_geometry_mut(&mut self, f: &mut impl FnMut(&mut Geometry)) {
        for geometry in &mut self.geometries {
            geometry.for_each_mut(f);
        }
        for child in &mut self.children {
            child.for_each_geometry_mut(f);
        }
    }
}

/// Link from a feature property to another feature, e.g. a group member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureReference {
    /// Property name carrying the link, e.g. `groupMember`
    pub role: String,
    pub target_gml_id: String,
}

/// A geometry node. Aggregates hold their members in `children`.
#[derive(Debug, Clone, PartialEq)]
pub struct Geometry {
    pub gml_id: Option<String>,
    pub kind: GeometryKind,
    /// Property the geometry hangs off, e.g. `lod2Solid`
    pub role: Option<String>,
    pub dimension: u8,
    pub coordinates: Vec<[f64; 3]>,
    pub children: Vec<Geometry>,
    /// Target `gml:id` when `kind` is [`GeometryKind::Reference`]
    pub href: Option<String>,
}

impl Geometry {
    pub fn new(kind: GeometryKind, gml_id: Option<String>) -> Self {
        Self {
            gml_id,
            kind,
            role: None,
            dimension: 3,
            coordinates: Vec::new(),
            children: Vec::new(),
            href: None,
        }
    }

    /// Placeholder for a geometry referenced by `xlink:href`.
    pub fn reference(target_gml_id: impl Into<String>) -> Self {
        let mut geometry = Geometry::new(GeometryKind::Reference, None);
        geometry.href = Some(target_gml_id.into());
        geometry
    }

    pub fn is_reference(&self) -> bool {
        self.kind == GeometryKind::Reference
    }

    fn count(&self, counts: &mut HashMap<GeometryKind, u64>) {
        if !self.is_reference() {
            *counts.entry(self.kind).or_default() += 1;
        }
        for child in &self.children {
            child.count(counts);
        }
    }

    fn extend_envelope(&self, envelope: &mut Option<[f64; 4]>) {
        for [x, y, _] in &self.coordinates {
            let env = envelope.get_or_insert([*x, *y, *x, *y]);
            env[0] = env[0].min(*x);
            env[1] = env[1].min(*y);
            env[2] = env[2].max(*x);
            env[3] = env[3].max(*y);
        }
        for child in &self.children {
            child.extend_envelope(envelope);
        }
    }

    fn for_each_mut(&mut self, f: &mut impl FnMut(&mut Geometry)) {
        f(self);
        for child in &mut self.children {
            child.for_each_mut(f);
        }
    }
}

/// Strip the local fragment marker from an `xlink:href` value.
pub fn normalize_href(href: &str) -> &str {
    href.trim().trim_start_matches('#')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn building() -> Feature {
        let mut building = Feature::new(FeatureKind::Building, "Building", Some("b1".into()));
        let mut solid = Geometry::new(GeometryKind::Solid, Some("s1".into()));
        solid.children.push(Geometry::new(GeometryKind::Polygon, Some("p1".into())));
        solid.children.push(Geometry::reference("p9"));
        building.geometries.push(solid);

        let mut roof = Feature::new(FeatureKind::ThematicSurface, "RoofSurface", Some("r1".into()));
        roof.geometries.push(Geometry::new(GeometryKind::MultiSurface, None));
        building.children.push(roof);
        building
    }

    #[test]
    fn test_counts_walk_nested_features() {
        let feature = building();
        let mut features = HashMap::new();
        let mut geometries = HashMap::new();
        feature.count_features(&mut features);
        feature.count_geometries(&mut geometries);

        assert_eq!(features[&FeatureKind::Building], 1);
        assert_eq!(features[&FeatureKind::ThematicSurface], 1);
        assert_eq!(geometries[&GeometryKind::Solid], 1);
        assert_eq!(geometries[&GeometryKind::Polygon], 1);
        assert!(!geometries.contains_key(&GeometryKind::Reference));
    }

    #[test]
    fn test_envelope_spans_nested_geometries() {
        let mut feature = building();
        assert_eq!(feature.envelope(), None);

        feature.geometries[0].children[0].coordinates = vec![[2.0, 3.0, 0.0], [5.0, -1.0, 9.0]];
        feature.children[0].geometries[0].coordinates = vec![[-4.0, 8.0, 1.0]];
        assert_eq!(feature.envelope(), Some([-4.0, -1.0, 5.0, 8.0]));
    }

    #[test]
    fn test_normalize_href() {
        assert_eq!(normalize_href("#poly_1"), "poly_1");
        assert_eq!(normalize_href(" poly_1 "), "poly_1");
    }
}

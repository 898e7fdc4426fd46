//! Unresolved forward references (XLinks)

use crate::{Error, Result};
use std::str::FromStr;

/// Which lookup server resolves a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceKind {
    Feature,
    Geometry,
}

impl ReferenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceKind::Feature => "feature",
            ReferenceKind::Geometry => "geometry",
        }
    }

    pub fn all() -> &'static [ReferenceKind] {
        &[ReferenceKind::Geometry, ReferenceKind::Feature]
    }
}

impl FromStr for ReferenceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "feature" => Ok(ReferenceKind::Feature),
            "geometry" => Ok(ReferenceKind::Geometry),
            _ => Err(Error::InvalidValue(format!("Unknown reference kind: {}", s))),
        }
    }
}

impl std::fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The table column a resolved reference is written into.
///
/// Closed set so that table and column names never come from input data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferencingColumn {
    /// `cityobject_reference.target_id`
    CityObjectReferenceTarget,
    /// `surface_geometry.xlink_ref_id`
    SurfaceGeometryXlink,
}

impl ReferencingColumn {
    pub fn table(&self) -> &'static str {
        match self {
            ReferencingColumn::CityObjectReferenceTarget => "cityobject_reference",
            ReferencingColumn::SurfaceGeometryXlink => "surface_geometry",
        }
    }

    pub fn column(&self) -> &'static str {
        match self {
            ReferencingColumn::CityObjectReferenceTarget => "target_id",
            ReferencingColumn::SurfaceGeometryXlink => "xlink_ref_id",
        }
    }

    /// `table.column`, the form persisted in spill tables
    pub fn qualified_name(&self) -> &'static str {
        match self {
            ReferencingColumn::CityObjectReferenceTarget => "cityobject_reference.target_id",
            ReferencingColumn::SurfaceGeometryXlink => "surface_geometry.xlink_ref_id",
        }
    }
}

impl FromStr for ReferencingColumn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cityobject_reference.target_id" => Ok(ReferencingColumn::CityObjectReferenceTarget),
            "surface_geometry.xlink_ref_id" => Ok(ReferencingColumn::SurfaceGeometryXlink),
            _ => Err(Error::InvalidValue(format!("Unknown referencing column: {}", s))),
        }
    }
}

/// A reference whose target had no database key when its source was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedReference {
    /// Spill table row id, 0 until persisted
    pub id: i64,
    pub referencing: ReferencingColumn,
    /// Primary key of the row holding the reference
    pub referencing_id: i64,
    pub target_gml_id: String,
    pub kind: ReferenceKind,
}

impl UnresolvedReference {
    /// Reference from a `cityobject_reference` row to another feature
    pub fn feature(referencing_id: i64, target_gml_id: impl Into<String>) -> Self {
        Self {
            id: 0,
            referencing: ReferencingColumn::CityObjectReferenceTarget,
            referencing_id,
            target_gml_id: target_gml_id.into(),
            kind: ReferenceKind::Feature,
        }
    }

    /// Reference from a placeholder `surface_geometry` row to another geometry
    pub fn geometry(referencing_id: i64, target_gml_id: impl Into<String>) -> Self {
        Self {
            id: 0,
            referencing: ReferencingColumn::SurfaceGeometryXlink,
            referencing_id,
            target_gml_id: target_gml_id.into(),
            kind: ReferenceKind::Geometry,
        }
    }

    pub fn referencing_table(&self) -> &'static str {
        self.referencing.table()
    }

    pub fn referencing_column(&self) -> &'static str {
        self.referencing.column()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_referencing_column_round_trips_through_text() {
        let col = ReferencingColumn::SurfaceGeometryXlink;
        assert_eq!(col.qualified_name().parse::<ReferencingColumn>().unwrap(), col);
        assert!("cityobject.gmlid".parse::<ReferencingColumn>().is_err());
    }

    #[test]
    fn test_constructors_pick_kind() {
        let r = UnresolvedReference::geometry(7, "poly");
        assert_eq!(r.kind, ReferenceKind::Geometry);
        assert_eq!(r.referencing_table(), "surface_geometry");
        assert_eq!(r.referencing_column(), "xlink_ref_id");
        assert_eq!(UnresolvedReference::feature(1, "b").kind, ReferenceKind::Feature);
    }
}

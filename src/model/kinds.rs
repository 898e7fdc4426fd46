//! Feature and geometry kinds
//!
//! CityGML has dozens of feature classes. They are folded into a closed set of
//! kinds that drive counters and the per-kind import dispatch; the concrete
//! element name is kept separately on each [`Feature`](super::Feature).

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Top-level and nested CityGML feature kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FeatureKind {
    Building,
    BuildingPart,
    BuildingInstallation,
    Room,
    BuildingFurniture,
    /// Wall, roof, ground and the other boundary surfaces
    ThematicSurface,
    /// Windows and doors
    Opening,
    Bridge,
    Tunnel,
    CityFurniture,
    LandUse,
    WaterBody,
    WaterBoundarySurface,
    PlantCover,
    SolitaryVegetationObject,
    /// Road, railway, track, square
    TransportationComplex,
    TrafficArea,
    ReliefFeature,
    ReliefComponent,
    GenericCityObject,
    CityObjectGroup,
}

impl FeatureKind {
    /// Get the string representation of the feature kind
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureKind::Building => "Building",
            FeatureKind::BuildingPart => "BuildingPart",
            FeatureKind::BuildingInstallation => "BuildingInstallation",
            FeatureKind::Room => "Room",
            FeatureKind::BuildingFurniture => "BuildingFurniture",
            FeatureKind::ThematicSurface => "ThematicSurface",
            FeatureKind::Opening => "Opening",
            FeatureKind::Bridge => "Bridge",
            FeatureKind::Tunnel => "Tunnel",
            FeatureKind::CityFurniture => "CityFurniture",
            FeatureKind::LandUse => "LandUse",
            FeatureKind::WaterBody => "WaterBody",
            FeatureKind::WaterBoundarySurface => "WaterBoundarySurface",
            FeatureKind::PlantCover => "PlantCover",
            FeatureKind::SolitaryVegetationObject => "SolitaryVegetationObject",
            FeatureKind::TransportationComplex => "TransportationComplex",
            FeatureKind::TrafficArea => "TrafficArea",
            FeatureKind::ReliefFeature => "ReliefFeature",
            FeatureKind::ReliefComponent => "ReliefComponent",
            FeatureKind::GenericCityObject => "GenericCityObject",
            FeatureKind::CityObjectGroup => "CityObjectGroup",
        }
    }

    /// Map an XML element local name to a feature kind.
    pub fn from_element(local_name: &str) -> Option<FeatureKind> {
        let kind = match local_name {
            "Building" => FeatureKind::Building,
            "BuildingPart" => FeatureKind::BuildingPart,
            "BuildingInstallation" | "IntBuildingInstallation" => FeatureKind::BuildingInstallation,
            "Room" => FeatureKind::Room,
            "BuildingFurniture" => FeatureKind::BuildingFurniture,
            "WallSurface" | "RoofSurface" | "GroundSurface" | "ClosureSurface" | "CeilingSurface"
            | "InteriorWallSurface" | "FloorSurface" | "OuterCeilingSurface"
            | "OuterFloorSurface" => FeatureKind::ThematicSurface,
            "Window" | "Door" => FeatureKind::Opening,
            "Bridge" | "BridgePart" => FeatureKind::Bridge,
            "Tunnel" | "TunnelPart" => FeatureKind::Tunnel,
            "CityFurniture" => FeatureKind::CityFurniture,
            "LandUse" => FeatureKind::LandUse,
            "WaterBody" => FeatureKind::WaterBody,
            "WaterSurface" | "WaterGroundSurface" | "WaterClosureSurface" => {
                FeatureKind::WaterBoundarySurface
            }
            "PlantCover" => FeatureKind::PlantCover,
            "SolitaryVegetationObject" => FeatureKind::SolitaryVegetationObject,
            "TransportationComplex" | "Road" | "Railway" | "Track" | "Square" => {
                FeatureKind::TransportationComplex
            }
            "TrafficArea" | "AuxiliaryTrafficArea" => FeatureKind::TrafficArea,
            "ReliefFeature" => FeatureKind::ReliefFeature,
            "TINRelief" | "MassPointRelief" | "BreaklineRelief" | "RasterRelief" => {
                FeatureKind::ReliefComponent
            }
            "GenericCityObject" => FeatureKind::GenericCityObject,
            "CityObjectGroup" => FeatureKind::CityObjectGroup,
            _ => return None,
        };
        Some(kind)
    }
}

impl FromStr for FeatureKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        FeatureKind::from_element(s)
            .or_else(|| match s {
                "ThematicSurface" => Some(FeatureKind::ThematicSurface),
                "Opening" => Some(FeatureKind::Opening),
                "WaterBoundarySurface" => Some(FeatureKind::WaterBoundarySurface),
                "ReliefComponent" => Some(FeatureKind::ReliefComponent),
                _ => None,
            })
            .ok_or_else(|| Error::InvalidValue(format!("Unknown feature kind: {}", s)))
    }
}

impl std::fmt::Display for FeatureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// GML geometry kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum GeometryKind {
    Point,
    MultiPoint,
    LineString,
    MultiCurve,
    CompositeCurve,
    LinearRing,
    Polygon,
    Triangle,
    MultiSurface,
    CompositeSurface,
    TriangulatedSurface,
    OrientableSurface,
    Solid,
    CompositeSolid,
    MultiSolid,
    MultiGeometry,
    GeometricComplex,
    /// Placeholder for an `xlink:href` to a geometry defined elsewhere
    Reference,
}

impl GeometryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GeometryKind::Point => "Point",
            GeometryKind::MultiPoint => "MultiPoint",
            GeometryKind::LineString => "LineString",
            GeometryKind::MultiCurve => "MultiCurve",
            GeometryKind::CompositeCurve => "CompositeCurve",
            GeometryKind::LinearRing => "LinearRing",
            GeometryKind::Polygon => "Polygon",
            GeometryKind::Triangle => "Triangle",
            GeometryKind::MultiSurface => "MultiSurface",
            GeometryKind::CompositeSurface => "CompositeSurface",
            GeometryKind::TriangulatedSurface => "TriangulatedSurface",
            GeometryKind::OrientableSurface => "OrientableSurface",
            GeometryKind::Solid => "Solid",
            GeometryKind::CompositeSolid => "CompositeSolid",
            GeometryKind::MultiSolid => "MultiSolid",
            GeometryKind::MultiGeometry => "MultiGeometry",
            GeometryKind::GeometricComplex => "GeometricComplex",
            GeometryKind::Reference => "Reference",
        }
    }

    /// Map an XML element local name to a geometry kind. Never yields `Reference`.
    pub fn from_element(local_name: &str) -> Option<GeometryKind> {
        let kind = match local_name {
            "Point" => GeometryKind::Point,
            "MultiPoint" => GeometryKind::MultiPoint,
            "LineString" => GeometryKind::LineString,
            "MultiCurve" => GeometryKind::MultiCurve,
            "CompositeCurve" => GeometryKind::CompositeCurve,
            "LinearRing" => GeometryKind::LinearRing,
            "Polygon" => GeometryKind::Polygon,
            "Triangle" => GeometryKind::Triangle,
            "MultiSurface" => GeometryKind::MultiSurface,
            "CompositeSurface" => GeometryKind::CompositeSurface,
            "TriangulatedSurface" | "Tin" => GeometryKind::TriangulatedSurface,
            "OrientableSurface" => GeometryKind::OrientableSurface,
            "Solid" => GeometryKind::Solid,
            "CompositeSolid" => GeometryKind::CompositeSolid,
            "MultiSolid" => GeometryKind::MultiSolid,
            "MultiGeometry" => GeometryKind::MultiGeometry,
            "GeometricComplex" => GeometryKind::GeometricComplex,
            _ => return None,
        };
        Some(kind)
    }
}

impl FromStr for GeometryKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == "Reference" {
            return Ok(GeometryKind::Reference);
        }
        GeometryKind::from_element(s)
            .ok_or_else(|| Error::InvalidValue(format!("Unknown geometry kind: {}", s)))
    }
}

impl std::fmt::Display for GeometryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_surface_elements_fold_into_thematic_surface() {
        assert_eq!(FeatureKind::from_element("RoofSurface"), Some(FeatureKind::ThematicSurface));
        assert_eq!(FeatureKind::from_element("WallSurface"), Some(FeatureKind::ThematicSurface));
        assert_eq!(FeatureKind::from_element("boundedBy"), None);
    }

    #[test]
    fn test_kind_names_parse_back() {
        for kind in [FeatureKind::Opening, FeatureKind::Building, FeatureKind::ReliefComponent] {
            assert_eq!(kind.as_str().parse::<FeatureKind>().unwrap(), kind);
        }
        assert_eq!("Reference".parse::<GeometryKind>().unwrap(), GeometryKind::Reference);
        assert!("Envelope".parse::<GeometryKind>().is_err());
    }
}

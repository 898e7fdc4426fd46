//! Chunk parser
//!
//! Builds a [`Feature`] tree from one [`XmlChunk`]. Elements are matched by
//! local name, so any namespace prefix is accepted. The parser keeps a frame
//! stack mirroring the open elements:
//! - feature elements (`Building`, `WallSurface`, ...) open a feature
//! - geometry elements (`Solid`, `Polygon`, ...) open a geometry node
//! - `pos`, `posList` and `coordinates` inside a geometry collect ordinates
//! - lowercase elements are properties; an `xlink:href` on a property becomes
//!   a geometry placeholder or a feature reference
//! - anything else is skipped

use super::reader::XmlChunk;
use super::validation::ValidationIssue;
use crate::model::{normalize_href, Feature, FeatureKind, FeatureReference, Geometry, GeometryKind};
use crate::{Error, Result};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use std::collections::HashSet;

/// Properties that always hold geometries, besides the `lod*` family
const GEOMETRY_PROPERTIES: &[&str] = &[
    "surfaceMember",
    "surfaceMembers",
    "solidMember",
    "solidMembers",
    "curveMember",
    "curveMembers",
    "pointMember",
    "pointMembers",
    "geometryMember",
    "geometryMembers",
    "exterior",
    "interior",
    "baseSurface",
    "patches",
    "trianglePatches",
    "segments",
];

fn is_geometry_property(name: &str) -> bool {
    name.starts_with("lod") || GEOMETRY_PROPERTIES.contains(&name)
}

fn is_coordinate_element(name: &str) -> bool {
    matches!(name, "pos" | "posList" | "coordinates")
}

#[derive(Debug, Clone)]
pub struct ParsedChunk {
    pub ordinal: u64,
    /// `None` when the chunk holds no known feature, e.g. an appearance
    pub feature: Option<Feature>,
    /// Empty unless validation was requested
    pub issues: Vec<ValidationIssue>,
}

/// Parse a chunk into a feature tree, collecting validation issues if `validate` is set.
pub fn parse_chunk(chunk: &XmlChunk, validate: bool) -> Result<ParsedChunk> {
    let mut parser = ChunkParser::new(validate);
    let mut reader = Reader::from_str(&chunk.xml);
    reader.config_mut().trim_text(true);

    loop {
        let position = reader.buffer_position() as u64;
        match reader.read_event()? {
            Event::Start(e) => parser.start(&e, position, false)?,
            Event::Empty(e) => parser.start(&e, position, true)?,
            Event::End(_) => parser.end(position)?,
            Event::Text(t) => parser.text(&String::from_utf8_lossy(&t)),
            Event::CData(t) => parser.text(&String::from_utf8_lossy(&t)),
            Event::Eof => break,
            _ => {}
        }
    }

    if !parser.stack.is_empty() {
        return Err(Error::Parse(format!("feature {} ends inside an open element", chunk.ordinal)));
    }

    Ok(ParsedChunk {
        ordinal: chunk.ordinal,
        feature: parser.root,
        issues: parser.issues,
    })
}

enum Frame {
    Feature(Feature),
    Geometry(Geometry),
    Coordinates {
        comma_separated: bool,
        dimension: u8,
        text: String,
    },
    Property(String),
    Other,
}

#[derive(Default)]
struct ElementAttrs {
    gml_id: Option<String>,
    href: Option<String>,
    srs_dimension: Option<u8>,
}

impl ElementAttrs {
    fn read(e: &BytesStart<'_>) -> Result<Self> {
        let mut attrs = ElementAttrs::default();
        for attr in e.attributes() {
            let attr = attr.map_err(|err| Error::Parse(format!("malformed attribute: {}", err)))?;
            match attr.key.local_name().as_ref() {
                b"id" => attrs.gml_id = Some(String::from_utf8_lossy(&attr.value).into_owned()),
                b"href" => attrs.href = Some(String::from_utf8_lossy(&attr.value).into_owned()),
                b"srsDimension" => {
                    attrs.srs_dimension = String::from_utf8_lossy(&attr.value)
                        .trim()
                        .parse::<u8>()
                        .ok()
                        .filter(|d| (2..=3).contains(d));
                }
                _ => {}
            }
        }
        Ok(attrs)
    }
}

struct ChunkParser {
    validate: bool,
    stack: Vec<Frame>,
    root: Option<Feature>,
    issues: Vec<ValidationIssue>,
    seen_ids: HashSet<String>,
}

impl ChunkParser {
    fn new(validate: bool) -> Self {
        Self {
            validate,
            stack: Vec::new(),
            root: None,
            issues: Vec::new(),
            seen_ids: HashSet::new(),
        }
    }

    fn start(&mut self, e: &BytesStart<'_>, position: u64, empty: bool) -> Result<()> {
        let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
        let attrs = ElementAttrs::read(e)?;

        if let Some(id) = &attrs.gml_id {
            if !self.seen_ids.insert(id.clone()) {
                self.issue(format!("duplicate gml:id '{}'", id), position);
            }
        }

        let frame = if let Some(kind) = FeatureKind::from_element(&name) {
            Frame::Feature(Feature::new(kind, name, attrs.gml_id))
        } else if let Some(kind) = GeometryKind::from_element(&name) {
            let mut geometry = Geometry::new(kind, attrs.gml_id);
            geometry.dimension = attrs.srs_dimension.unwrap_or_else(|| self.inherited_dimension());
            Frame::Geometry(geometry)
        } else if is_coordinate_element(&name) && self.in_geometry() {
            Frame::Coordinates {
                comma_separated: name == "coordinates",
                dimension: attrs.srs_dimension.unwrap_or_else(|| self.inherited_dimension()),
                text: String::new(),
            }
        } else if name.starts_with(|c: char| c.is_ascii_lowercase()) {
            if let Some(href) = &attrs.href {
                self.add_reference(&name, normalize_href(href));
            }
            Frame::Property(name)
        } else {
            Frame::Other
        };

        if empty {
            self.close(frame, position)
        } else {
            self.stack.push(frame);
            Ok(())
        }
    }

    fn end(&mut self, position: u64) -> Result<()> {
        let frame = self
            .stack
            .pop()
            .ok_or_else(|| Error::Parse("unbalanced end tag".into()))?;
        self.close(frame, position)
    }

    fn text(&mut self, content: &str) {
        if let Some(Frame::Coordinates { text, .. }) = self.stack.last_mut() {
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(content);
        }
    }

    fn close(&mut self, frame: Frame, position: u64) -> Result<()> {
        match frame {
            Frame::Feature(feature) => self.attach_feature(feature),
            Frame::Geometry(mut geometry) => {
                if geometry.kind == GeometryKind::LinearRing {
                    self.check_ring(&geometry, position);
                }
                geometry.role = match self.stack.last() {
                    Some(Frame::Property(name)) => Some(name.clone()),
                    _ => None,
                };
                self.attach_geometry(geometry);
            }
            Frame::Coordinates {
                comma_separated,
                dimension,
                text,
            } => self.apply_coordinates(&text, comma_separated, dimension, position)?,
            Frame::Property(_) | Frame::Other => {}
        }
        Ok(())
    }

    fn attach_feature(&mut self, feature: Feature) {
        for frame in self.stack.iter_mut().rev() {
            if let Frame::Feature(parent) = frame {
                parent.children.push(feature);
                return;
            }
        }
        if self.root.is_none() {
            self.root = Some(feature);
        }
    }

    fn attach_geometry(&mut self, geometry: Geometry) {
        for frame in self.stack.iter_mut().rev() {
            match frame {
                Frame::Geometry(parent) => {
                    parent.children.push(geometry);
                    return;
                }
                Frame::Feature(feature) => {
                    feature.geometries.push(geometry);
                    return;
                }
                _ => {}
            }
        }
        tracing::trace!("Dropping geometry outside of any feature");
    }

    /// Handle an `xlink:href` found on property `name`.
    fn add_reference(&mut self, name: &str, target: &str) {
        if target.is_empty() {
            return;
        }

        let in_geometry = matches!(
            self.stack.iter().rev().find(|f| !matches!(f, Frame::Property(_))),
            Some(Frame::Geometry(_))
        );

        if in_geometry || is_geometry_property(name) {
            let mut placeholder = Geometry::reference(target);
            placeholder.role = Some(name.to_string());
            placeholder.dimension = self.inherited_dimension();
            self.attach_geometry(placeholder);
        } else if let Some(feature) = self.nearest_feature_mut() {
            feature.references.push(FeatureReference {
                role: name.to_string(),
                target_gml_id: target.to_string(),
            });
        }
    }

    fn apply_coordinates(&mut self, text: &str, comma_separated: bool, dimension: u8, position: u64) -> Result<()> {
        let normalized;
        let text = if comma_separated {
            normalized = text.replace(',', " ");
            normalized.as_str()
        } else {
            text
        };

        let mut values = Vec::new();
        for token in text.split_whitespace() {
            match token.parse::<f64>() {
                Ok(v) if v.is_finite() => values.push(v),
                _ if self.validate => {
                    self.issue(format!("'{}' is not a valid coordinate", token), position);
                }
                _ => return Err(Error::Parse(format!("invalid coordinate '{}'", token))),
            }
        }

        let dim = usize::from(dimension);
        if values.len() % dim != 0 {
            self.issue(
                format!("{} ordinates cannot form {}D points", values.len(), dim),
                position,
            );
            values.truncate(values.len() - values.len() % dim);
        }

        let points = values
            .chunks(dim)
            .map(|c| [c[0], c[1], if dim == 3 { c[2] } else { 0.0 }]);

        for frame in self.stack.iter_mut().rev() {
            if let Frame::Geometry(geometry) = frame {
                geometry.coordinates.extend(points);
                geometry.dimension = dimension;
                break;
            }
        }
        Ok(())
    }

    fn check_ring(&mut self, ring: &Geometry, position: u64) {
        let points = &ring.coordinates;
        if points.len() < 4 {
            self.issue(
                format!("LinearRing has {} point(s), at least 4 are required", points.len()),
                position,
            );
        } else if points.first() != points.last() {
            self.issue("LinearRing is not closed".to_string(), position);
        }
    }

    fn issue(&mut self, message: String, position: u64) {
        if !self.validate {
            return;
        }
        let gml_id = self.current_feature_id();
        self.issues.push(ValidationIssue {
            gml_id,
            message,
            position,
        });
    }

    fn current_feature_id(&self) -> Option<String> {
        self.stack.iter().rev().find_map(|frame| match frame {
            Frame::Feature(feature) => feature.gml_id.clone(),
            _ => None,
        })
    }

    fn nearest_feature_mut(&mut self) -> Option<&mut Feature> {
        self.stack.iter_mut().rev().find_map(|frame| match frame {
            Frame::Feature(feature) => Some(feature),
            _ => None,
        })
    }

    fn in_geometry(&self) -> bool {
        self.stack.iter().any(|f| matches!(f, Frame::Geometry(_)))
    }

    fn inherited_dimension(&self) -> u8 {
        self.stack
            .iter()
            .rev()
            .find_map(|frame| match frame {
                Frame::Geometry(geometry) => Some(geometry.dimension),
                _ => None,
            })
            .unwrap_or(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(xml: &str) -> XmlChunk {
        XmlChunk {
            ordinal: 1,
            xml: xml.to_string(),
        }
    }

    const BUILDING: &str = r##"<bldg:Building gml:id="b1">
  <bldg:lod2Solid>
    <gml:Solid gml:id="solid1">
      <gml:exterior><gml:CompositeSurface>
        <gml:surfaceMember xlink:href="#roof_poly"/>
        <gml:surfaceMember>
          <gml:Polygon gml:id="wall_poly"><gml:exterior><gml:LinearRing>
            <gml:posList srsDimension="3">0 0 0 10 0 0 10 0 5 0 0 0</gml:posList>
          </gml:LinearRing></gml:exterior></gml:Polygon>
        </gml:surfaceMember>
      </gml:CompositeSurface></gml:exterior>
    </gml:Solid>
  </bldg:lod2Solid>
  <bldg:boundedBy>
    <bldg:RoofSurface gml:id="roof1">
      <bldg:lod2MultiSurface><gml:MultiSurface><gml:surfaceMember>
        <gml:Polygon gml:id="roof_poly"><gml:exterior><gml:LinearRing>
          <gml:pos>0 0 5</gml:pos><gml:pos>10 0 5</gml:pos><gml:pos>10 10 5</gml:pos><gml:pos>0 0 5</gml:pos>
        </gml:LinearRing></gml:exterior></gml:Polygon>
      </gml:surfaceMember></gml:MultiSurface></bldg:lod2MultiSurface>
    </bldg:RoofSurface>
  </bldg:boundedBy>
  <bldg:address><core:Address><core:xalAddress>Somewhere 1</core:xalAddress></core:Address></bldg:address>
</bldg:Building>"##;

    #[test]
    fn test_builds_feature_tree() {
        let parsed = parse_chunk(&chunk(BUILDING), true).unwrap();
        assert!(parsed.issues.is_empty(), "{:?}", parsed.issues);
        let building = parsed.feature.unwrap();

        assert_eq!(building.kind, FeatureKind::Building);
        assert_eq!(building.gml_id.as_deref(), Some("b1"));
        assert_eq!(building.geometries.len(), 1);

        let solid = &building.geometries[0];
        assert_eq!(solid.kind, GeometryKind::Solid);
        assert_eq!(solid.role.as_deref(), Some("lod2Solid"));
        let composite = &solid.children[0];
        assert_eq!(composite.children.len(), 2);
        assert!(composite.children[0].is_reference());
        assert_eq!(composite.children[0].href.as_deref(), Some("roof_poly"));

        let ring = &composite.children[1].children[0];
        assert_eq!(ring.kind, GeometryKind::LinearRing);
        assert_eq!(ring.coordinates.len(), 4);

        assert_eq!(building.children.len(), 1);
        let roof = &building.children[0];
        assert_eq!(roof.kind, FeatureKind::ThematicSurface);
        assert_eq!(roof.class_name, "RoofSurface");
        let roof_ring = &roof.geometries[0].children[0].children[0];
        assert_eq!(roof_ring.coordinates[2], [10.0, 10.0, 5.0]);
    }

    #[test]
    fn test_feature_reference_keeps_role() {
        let xml = r##"<grp:CityObjectGroup gml:id="g1">
  <grp:groupMember xlink:href="#b1"/>
  <grp:groupMember xlink:href="b2"/>
</grp:CityObjectGroup>"##;
        let group = parse_chunk(&chunk(xml), false).unwrap().feature.unwrap();
        assert_eq!(group.kind, FeatureKind::CityObjectGroup);
        assert_eq!(group.references.len(), 2);
        assert_eq!(group.references[0].role, "groupMember");
        assert_eq!(group.references[1].target_gml_id, "b2");
        assert!(group.geometries.is_empty());
    }

    #[test]
    fn test_validation_issues() {
        let xml = r#"<Building gml:id="b1">
  <lod1MultiSurface><gml:MultiSurface>
    <gml:surfaceMember><gml:Polygon gml:id="p"><gml:exterior><gml:LinearRing>
      <gml:posList>0 0 0 1 1 1 x</gml:posList>
    </gml:LinearRing></gml:exterior></gml:Polygon></gml:surfaceMember>
    <gml:surfaceMember><gml:Polygon gml:id="p"/></gml:surfaceMember>
  </gml:MultiSurface></lod1MultiSurface>
</Building>"#;
        let parsed = parse_chunk(&chunk(xml), true).unwrap();
        let messages: Vec<_> = parsed.issues.iter().map(|i| i.message.as_str()).collect();
        assert!(messages.iter().any(|m| m.contains("not a valid coordinate")));
        assert!(messages.iter().any(|m| m.contains("at least 4")));
        assert!(messages.iter().any(|m| m.contains("duplicate gml:id")));
        assert!(parsed.issues.iter().all(|i| i.gml_id.as_deref() == Some("b1")));
    }

    #[test]
    fn test_invalid_coordinate_without_validation_is_fatal() {
        let xml = "<Building><lod0Point><gml:Point><gml:pos>1 2 abc</gml:pos></gml:Point></lod0Point></Building>";
        assert!(matches!(parse_chunk(&chunk(xml), false), Err(Error::Parse(_))));
    }

    #[test]
    fn test_gml2_coordinates_and_two_dimensions() {
        let xml = r#"<LandUse gml:id="l1"><lod0MultiSurface><gml:MultiSurface srsDimension="2"><gml:surfaceMember><gml:Polygon><gml:exterior><gml:LinearRing>
<gml:coordinates>0,0 5,0 5,5 0,0</gml:coordinates>
</gml:LinearRing></gml:exterior></gml:Polygon></gml:surfaceMember></gml:MultiSurface></lod0MultiSurface></LandUse>"#;
        let parsed = parse_chunk(&chunk(xml), true).unwrap();
        assert!(parsed.issues.is_empty());
        let land_use = parsed.feature.unwrap();
        let ring = &land_use.geometries[0].children[0].children[0];
        assert_eq!(ring.dimension, 2);
        assert_eq!(ring.coordinates[1], [5.0, 0.0, 0.0]);
    }

    #[test]
    fn test_non_feature_chunk() {
        let parsed = parse_chunk(&chunk("<app:Appearance><app:theme>rgb</app:theme></app:Appearance>"), false).unwrap();
        assert!(parsed.feature.is_none());
    }
}

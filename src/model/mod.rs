//! Data model shared by the pipeline stages
//!
//! - `Feature` / `Geometry`: parsed feature trees handed from the reader pool
//!   to the import pool
//! - `UnresolvedReference`: XLinks waiting in spill tables for the resolver

pub mod feature;
pub mod kinds;
pub mod xlink;

pub use feature::{normalize_href, Feature, FeatureReference, Geometry};
pub use kinds::{FeatureKind, GeometryKind};
pub use xlink::{ReferenceKind, ReferencingColumn, UnresolvedReference};

//! CityGML feature source
//!
//! [`CityGmlReader`] streams a document and cuts it into per-feature XML
//! chunks; [`parse_chunk`] turns one chunk into a [`Feature`](crate::Feature)
//! tree, optionally collecting structural [`ValidationIssue`]s.

pub mod parser;
pub mod reader;
pub mod validation;

pub use parser::{parse_chunk, ParsedChunk};
pub use reader::{CityGmlReader, XmlChunk};
pub use validation::{validate_file, validate_files, ValidationIssue, ValidationReport};

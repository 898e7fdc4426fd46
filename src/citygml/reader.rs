//! Streaming chunk reader
//!
//! Splits a CityGML document into one XML fragment per feature member of the
//! root element, without ever holding more than one member in memory.

use crate::model::FeatureKind;
use crate::{Error, Result};
use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::Event;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Raw XML of one top-level feature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlChunk {
    /// 1-based position within the file
    pub ordinal: u64,
    pub xml: String,
}

/// Member properties whose children are top-level features
const MEMBER_ELEMENTS: &[&str] = &["cityObjectMember", "featureMember", "featureMembers", "member"];

fn is_member(local_name: &[u8]) -> bool {
    MEMBER_ELEMENTS.iter().any(|m| m.as_bytes() == local_name)
}

/// Forward-only reader yielding [`XmlChunk`]s. Not restartable.
pub struct CityGmlReader<R: BufRead> {
    reader: Reader<R>,
    buf: Vec<u8>,
    depth: usize,
    /// Depth of the member element currently open, if any
    member_depth: Option<usize>,
    /// Fragment being captured and the depth of its root element
    capture: Option<(Writer<Vec<u8>>, usize)>,
    ordinal: u64,
    finished: bool,
}

impl CityGmlReader<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<'a> CityGmlReader<&'a [u8]> {
    pub fn from_str(xml: &'a str) -> Self {
        Self::new(xml.as_bytes())
    }
}

impl<R: BufRead> CityGmlReader<R> {
    pub fn new(input: R) -> Self {
        let mut reader = Reader::from_reader(input);
        reader.config_mut().trim_text(true);
        Self {
            reader,
            buf: Vec::new(),
            depth: 0,
            member_depth: None,
            capture: None,
            ordinal: 0,
            finished: false,
        }
    }

    /// Chunks handed out so far
    pub fn chunks_read(&self) -> u64 {
        self.ordinal
    }

    /// Read up to the next feature. `Ok(None)` at the end of the document.
    pub fn next_chunk(&mut self) -> Result<Option<XmlChunk>> {
        if self.finished {
            return Ok(None);
        }

        loop {
            self.buf.clear();
            let event = match self.reader.read_event_into(&mut self.buf) {
                Ok(event) => event,
                Err(e) => {
                    self.finished = true;
                    return Err(e.into());
                }
            };

            match event {
                Event::Start(e) => {
                    self.depth += 1;
                    if let Some((writer, _)) = self.capture.as_mut() {
                        writer.write_event(Event::Start(e))?;
                    } else if self.depth == 1 && FeatureKind::from_element(&String::from_utf8_lossy(e.local_name().as_ref())).is_some() {
                        // the document itself is a single feature
                        let mut writer = Writer::new(Vec::new());
                        writer.write_event(Event::Start(e))?;
                        self.capture = Some((writer, self.depth));
                    } else if self.depth == 2 && is_member(e.local_name().as_ref()) {
                        self.member_depth = Some(self.depth);
                    } else if self.member_depth == Some(self.depth - 1) {
                        let mut writer = Writer::new(Vec::new());
                        writer.write_event(Event::Start(e))?;
                        self.capture = Some((writer, self.depth));
                    }
                }
                Event::Empty(e) => {
                    if let Some((writer, _)) = self.capture.as_mut() {
                        writer.write_event(Event::Empty(e))?;
                    } else if self.member_depth == Some(self.depth) {
                        let mut writer = Writer::new(Vec::new());
                        writer.write_event(Event::Empty(e))?;
                        return self.emit(writer).map(Some);
                    }
                    // empty members only carry an xlink:href, nothing to import
                }
                Event::End(e) => {
                    let closing = self.depth;
                    self.depth = self.depth.saturating_sub(1);

                    if let Some((writer, capture_depth)) = self.capture.as_mut() {
                        writer.write_event(Event::End(e))?;
                        if *capture_depth == closing {
                            if let Some((writer, _)) = self.capture.take() {
                                return self.emit(writer).map(Some);
                            }
                        }
                    } else if self.member_depth == Some(closing) {
                        self.member_depth = None;
                    }
                }
                Event::Text(t) => {
                    if let Some((writer, _)) = self.capture.as_mut() {
                        writer.write_event(Event::Text(t))?;
                    }
                }
                Event::CData(t) => {
                    if let Some((writer, _)) = self.capture.as_mut() {
                        writer.write_event(Event::CData(t))?;
                    }
                }
                Event::Eof => {
                    self.finished = true;
                    if self.depth != 0 || self.capture.is_some() {
                        return Err(Error::Parse(format!(
                            "unexpected end of document inside an open element (depth {})",
                            self.depth
                        )));
                    }
                    return Ok(None);
                }
                _ => {}
            }
        }
    }

    fn emit(&mut self, writer: Writer<Vec<u8>>) -> Result<XmlChunk> {
        self.ordinal += 1;
        let xml = String::from_utf8(writer.into_inner())
            .map_err(|e| Error::Parse(format!("feature {} is not valid UTF-8: {}", self.ordinal, e)))?;
        Ok(XmlChunk {
            ordinal: self.ordinal,
            xml,
        })
    }
}

impl<R: BufRead> Iterator for CityGmlReader<R> {
    type Item = Result<XmlChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_chunk() {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => None,
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

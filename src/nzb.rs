//! NZB manifest parsing.
//!
//! An NZB file is an XML listing of logical files, each carrying a subject
//! line (with the output filename in quotes), the newsgroups it was posted
//! to, and the message-ids of its yEnc segments. NZBs in the wild are
//! frequently ISO-8859-1 rather than UTF-8, so the parser goes through the
//! document's declared encoding instead of assuming UTF-8.
//!
//! The parsed manifest is immutable input for the job driver.

use quick_xml::Reader;
use quick_xml::events::Event;

use crate::error::{Error, Result};

/// One segment: a single Usenet article holding one yEnc part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Declared article size in bytes
    pub bytes: u64,
    /// 1-based sequence number within the file
    pub number: u32,
    /// Message-id, without angle brackets
    pub message_id: String,
}

/// One logical file of the manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NzbFile {
    /// Subject line of the posting; contains the quoted filename
    pub subject: String,
    /// Newsgroups the file was posted to, in manifest order
    pub groups: Vec<String>,
    /// Segments in manifest order
    pub segments: Vec<Segment>,
}

impl NzbFile {
    /// Extract the filename from the subject line.
    ///
    /// Usenet subjects carry the filename in double quotes, e.g.
    /// `Some.Release [01/50] - "Some.Release.part01.rar" yEnc (1/100)`.
    /// Returns `None` when no non-empty quoted token is present.
    pub fn filename(&self) -> Option<&str> {
        let start = self.subject.find('"')?;
        let rest = &self.subject[start + 1..];
        let end = rest.find('"')?;
        let name = &rest[..end];
        (!name.is_empty()).then_some(name)
    }

    /// Total declared size of all segments.
    pub fn total_bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.bytes).sum()
    }
}

/// A parsed NZB manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Nzb {
    /// Logical files in manifest order
    pub files: Vec<NzbFile>,
}

/// Parse an NZB document.
///
/// # Errors
///
/// Returns [`Error::InvalidNzb`] for malformed XML, an empty manifest, or
/// a file with no segments.
pub fn parse(content: &[u8]) -> Result<Nzb> {
    let mut reader = Reader::from_reader(content);
    reader.config_mut().trim_text(true);

    let mut nzb = Nzb::default();
    let mut current: Option<NzbFile> = None;
    let mut in_group = false;
    let mut segment_attrs: Option<(u64, u32)> = None;
    let mut text = String::new();
    let mut buf = Vec::new();

    let bad = |e: &dyn std::fmt::Display| Error::InvalidNzb(format!("could not parse NZB XML: {e}"));

    loop {
        let event = reader.read_event_into(&mut buf).map_err(|e| bad(&e))?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let empty = matches!(&event, Event::Empty(_));
                match e.local_name().as_ref() {
                    b"file" => {
                        let mut file = NzbFile::default();
                        for attr in e.attributes() {
                            let attr = attr.map_err(|e| bad(&e))?;
                            if attr.key.local_name().as_ref() == b"subject" {
                                file.subject = attr
                                    .decode_and_unescape_value(reader.decoder())
                                    .map_err(|e| bad(&e))?
                                    .into_owned();
                            }
                        }
                        if empty {
                            nzb.files.push(file);
                        } else {
                            current = Some(file);
                        }
                    }
                    b"group" if !empty => {
                        in_group = true;
                        text.clear();
                    }
                    b"segment" => {
                        let mut bytes = 0u64;
                        let mut number = 0u32;
                        for attr in e.attributes() {
                            let attr = attr.map_err(|e| bad(&e))?;
                            let value = attr
                                .decode_and_unescape_value(reader.decoder())
                                .map_err(|e| bad(&e))?;
                            match attr.key.local_name().as_ref() {
                                b"bytes" => bytes = value.parse().unwrap_or(0),
                                b"number" => number = value.parse().unwrap_or(0),
                                _ => {}
                            }
                        }
                        if !empty {
                            segment_attrs = Some((bytes, number));
                            text.clear();
                        }
                    }
                    _ => {}
                }
            }
            Event::Text(ref t) => {
                if in_group || segment_attrs.is_some() {
                    let decoded = reader.decoder().decode(t).map_err(|e| bad(&e))?;
                    text.push_str(&decoded);
                }
            }
            Event::End(ref e) => match e.local_name().as_ref() {
                b"file" => {
                    if let Some(file) = current.take() {
                        nzb.files.push(file);
                    }
                }
                b"group" => {
                    in_group = false;
                    if let Some(file) = current.as_mut() {
                        let group = text.trim().to_owned();
                        if !group.is_empty() {
                            file.groups.push(group);
                        }
                    }
                }
                b"segment" => {
                    if let (Some((bytes, number)), Some(file)) =
                        (segment_attrs.take(), current.as_mut())
                    {
                        let message_id = text.trim().to_owned();
                        if !message_id.is_empty() {
                            file.segments.push(Segment {
                                bytes,
                                number,
                                message_id,
                            });
                        }
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    validate(&nzb)?;
    Ok(nzb)
}

fn validate(nzb: &Nzb) -> Result<()> {
    if nzb.files.is_empty() {
        return Err(Error::InvalidNzb("no files contained".into()));
    }
    for file in &nzb.files {
        if file.segments.is_empty() {
            return Err(Error::InvalidNzb(format!(
                "zero segment file: {:?}",
                file.subject
            )));
        }
    }
    Ok(())
}

//! Streaming yEnc decoder.
//!
//! yEnc maps each payload byte to `byte + 42 (mod 256)` and escapes the few
//! critical characters with `=` followed by `byte + 64`. An encoded part is
//! framed by an `=ybegin` header line (plus an `=ypart` line for multipart
//! posts) and an `=yend` footer carrying the declared size and CRC32.
//!
//! [`Decoder`] scans an article body for the header, exposes the parsed
//! [`Part`] metadata up front (the caller needs `begin` before it can place
//! the payload), and yields decoded bytes lazily through [`std::io::Read`].
//! When the footer is reached the decoder verifies the byte count and CRC
//! and surfaces any mismatch as a [`DecodeError`].

use std::fmt;
use std::io::{self, BufRead, Read};

use thiserror::Error;

/// Metadata parsed from the `=ybegin` (and optional `=ypart`) header lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    /// Filename embedded in the header (may contain spaces)
    pub filename: String,
    /// 0-based byte offset of this part's payload in the target file
    pub begin: u64,
    /// Payload size of this part in bytes
    pub size: u64,
    /// Declared size of the complete target file
    pub file_size: u64,
    /// Part number, 1-based (0 when single-part)
    pub number: u32,
    /// Total number of parts (0 when the header does not declare it)
    pub total: u32,
    multipart: bool,
}

impl Part {
    /// Whether this part is one piece of a multipart post.
    pub fn is_multipart(&self) -> bool {
        self.multipart
    }
}

/// A fully decoded part: metadata plus payload bytes.
#[derive(Debug, Clone)]
pub struct Decoded {
    /// Parsed header metadata
    pub part: Part,
    /// Decoded payload
    pub data: Vec<u8>,
}

/// Errors produced while locating, parsing, or verifying a yEnc part.
///
/// Everything except [`DecodeError::Read`] is a content error: the bytes
/// arrived intact but do not form a valid part. The distinction matters to
/// the fetch path, which keeps a connection alive on content errors.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// No `=ybegin` line was found before the stream ended
    #[error("could not find yEnc header")]
    HeaderNotFound,

    /// The stream ended inside the header, body, or footer
    #[error("unexpected end of yEnc stream")]
    UnexpectedEof,

    /// A header line could not be parsed
    #[error("malformed yEnc header: {0}")]
    MalformedHeader(String),

    /// The footer line could not be parsed
    #[error("malformed yEnc footer: {0}")]
    MalformedFooter(String),

    /// Decoded byte count does not match the footer's declared size
    #[error("decoded {actual} bytes, footer declares {declared}")]
    SizeMismatch {
        /// Size declared in the `=yend` footer
        declared: u64,
        /// Number of bytes actually decoded
        actual: u64,
    },

    /// Running CRC32 does not match the footer
    #[error("crc32 mismatch: computed {computed:08x}, expected {expected:08x}")]
    CrcMismatch {
        /// CRC declared in the footer
        expected: u32,
        /// CRC computed over the decoded bytes
        computed: u32,
    },

    /// The underlying reader failed
    #[error("read error: {0}")]
    Read(#[from] io::Error),
}

impl DecodeError {
    fn into_io(self) -> io::Error {
        match self {
            DecodeError::Read(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

#[derive(Debug, Default)]
struct Footer {
    size: u64,
    crc: u32,
    pcrc: u32,
}

/// Streaming decoder over a reader positioned anywhere before a yEnc part.
///
/// Construction scans forward to the `=ybegin` line and parses the header;
/// the payload is then available through [`Read`]. The final read that hits
/// the `=yend` footer validates size and CRC before reporting end-of-stream.
pub struct Decoder<R> {
    reader: R,
    part: Part,
    crc: crc32fast::Hasher,
    decoded: u64,
    done: bool,
}

impl<R: BufRead> Decoder<R> {
    /// Scan `reader` for a yEnc header and parse it.
    ///
    /// Bytes before the `=ybegin` line are discarded. Returns
    /// [`DecodeError::HeaderNotFound`] if the stream ends first.
    pub fn new(mut reader: R) -> Result<Self, DecodeError> {
        find_header(&mut reader)?;
        let part = parse_header(&mut reader)?;
        Ok(Decoder {
            reader,
            part,
            crc: crc32fast::Hasher::new(),
            decoded: 0,
            done: false,
        })
    }

    /// Header metadata for this part.
    pub fn part(&self) -> &Part {
        &self.part
    }

    /// Decode the entire payload into memory and verify the footer.
    pub fn read_to_vec(mut self) -> Result<Decoded, DecodeError> {
        let mut data = Vec::with_capacity(self.part.size as usize);
        let mut buf = [0u8; 8192];
        loop {
            let n = self.fill(&mut buf)?;
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
        }
        Ok(Decoded {
            part: self.part,
            data,
        })
    }

    fn next_byte(&mut self) -> Result<Option<u8>, DecodeError> {
        let buf = self.reader.fill_buf()?;
        match buf.first().copied() {
            Some(b) => {
                self.reader.consume(1);
                Ok(Some(b))
            }
            None => Ok(None),
        }
    }

    /// Core decode step: fill `buf` with decoded bytes.
    ///
    /// Returns 0 exactly once, after the footer has been parsed and
    /// verified. The escape state lives across calls, so an `=` split from
    /// its follow-up byte by a buffer boundary decodes correctly.
    fn fill(&mut self, buf: &mut [u8]) -> Result<usize, DecodeError> {
        if self.done {
            return Ok(0);
        }
        let mut n = 0;
        while n < buf.len() {
            let tok = self.next_byte()?.ok_or(DecodeError::UnexpectedEof)?;
            if tok == b'\n' {
                continue;
            }
            let out = if tok == b'=' {
                let esc = self.next_byte()?.ok_or(DecodeError::UnexpectedEof)?;
                if esc == b'y' {
                    // footer reached; account for what this call produced
                    self.crc.update(&buf[..n]);
                    self.finish()?;
                    self.done = true;
                    return Ok(n);
                }
                esc.wrapping_sub(64).wrapping_sub(42)
            } else {
                tok.wrapping_sub(42)
            };
            buf[n] = out;
            n += 1;
            self.decoded += 1;
        }
        self.crc.update(&buf[..n]);
        Ok(n)
    }

    /// Parse the `=yend` footer and verify size and CRC.
    fn finish(&mut self) -> Result<(), DecodeError> {
        let footer = self.parse_footer()?;
        if footer.size != self.decoded {
            return Err(DecodeError::SizeMismatch {
                declared: footer.size,
                actual: self.decoded,
            });
        }
        // A multipart footer carries the part CRC in pcrc32; a zero crc32
        // on a single-part post means the poster left it out.
        let expected = if self.part.multipart || footer.crc == 0 {
            footer.pcrc
        } else {
            footer.crc
        };
        let computed = self.crc.clone().finalize();
        if expected != computed {
            return Err(DecodeError::CrcMismatch { expected, computed });
        }
        Ok(())
    }

    fn parse_footer(&mut self) -> Result<Footer, DecodeError> {
        // we have consumed "=y"; skip the rest of the keyword
        loop {
            match self.next_byte()? {
                Some(b' ') => break,
                Some(b'\n') | None => return Err(DecodeError::UnexpectedEof),
                Some(_) => continue,
            }
        }
        // the footer line may legitimately end at EOF without a newline
        let mut line = Vec::new();
        loop {
            match self.next_byte()? {
                Some(b'\n') | None => break,
                Some(b) => line.push(b),
            }
        }
        let line = String::from_utf8_lossy(&line);

        let mut footer = Footer::default();
        for tok in line.split_ascii_whitespace() {
            let Some((key, value)) = tok.split_once('=') else {
                return Err(DecodeError::MalformedFooter(line.clone().into_owned()));
            };
            let res = match key {
                "size" => value.parse().map(|v| footer.size = v).is_ok(),
                "pcrc32" => u32::from_str_radix(value, 16)
                    .map(|v| footer.pcrc = v)
                    .is_ok(),
                "crc32" => u32::from_str_radix(value, 16)
                    .map(|v| footer.crc = v)
                    .is_ok(),
                // part/total in the footer carry nothing we need
                _ => true,
            };
            if !res {
                return Err(DecodeError::MalformedFooter(line.clone().into_owned()));
            }
        }
        Ok(footer)
    }
}

impl<R: BufRead> Read for Decoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.fill(buf).map_err(DecodeError::into_io)
    }
}

impl<R> fmt::Debug for Decoder<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decoder")
            .field("part", &self.part)
            .field("decoded", &self.decoded)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

/// Decode a complete article body held in memory.
///
/// Convenience wrapper used by the fetch path, which always has the
/// dot-unstuffed body buffered before decoding.
pub fn decode(body: &[u8]) -> Result<Decoded, DecodeError> {
    Decoder::new(body)?.read_to_vec()
}

/// Scan for the literal `=ybegin ` prefix at the start of a line.
///
/// Non-matching bytes are discarded up to the next newline. The naive
/// restart-on-mismatch is enough here because the pattern can only match at
/// a line start.
fn find_header<R: BufRead>(reader: &mut R) -> Result<(), DecodeError> {
    const NEEDLE: &[u8] = b"=ybegin ";
    let mut i = 0;
    let mut at_line_start = true;
    loop {
        if i == NEEDLE.len() {
            return Ok(());
        }
        let buf = reader.fill_buf().map_err(DecodeError::Read)?;
        let Some(&c) = buf.first() else {
            return Err(DecodeError::HeaderNotFound);
        };
        reader.consume(1);
        if at_line_start || i > 0 {
            if NEEDLE[i] == c {
                i += 1;
                continue;
            }
            i = 0;
            at_line_start = c == b'\n';
        } else if c == b'\n' {
            at_line_start = true;
        }
    }
}

fn read_line<R: BufRead>(reader: &mut R) -> Result<String, DecodeError> {
    let mut line = Vec::new();
    reader.read_until(b'\n', &mut line)?;
    match line.pop() {
        Some(b'\n') => Ok(String::from_utf8_lossy(&line).into_owned()),
        // header lines must be newline-terminated; EOF here is truncation
        _ => Err(DecodeError::UnexpectedEof),
    }
}

fn parse_header<R: BufRead>(reader: &mut R) -> Result<Part, DecodeError> {
    let mut part = Part {
        filename: String::new(),
        begin: 0,
        size: 0,
        file_size: 0,
        number: 0,
        total: 0,
        multipart: false,
    };

    let dataline = read_line(reader)?;
    parse_dataline(&dataline, &mut part)?;
    part.file_size = part.size;

    // single-part posts have no =ypart line
    if part.number == 0 && part.total == 0 {
        return Ok(part);
    }

    let partline = read_line(reader)?;
    let end = parse_partline(&partline, &mut part)?;
    part.size = end.saturating_sub(part.begin);
    part.multipart = true;
    Ok(part)
}

/// Parse the `key=value` tokens of the `=ybegin` line.
///
/// `name=` consumes the rest of the line, so filenames may contain spaces
/// and `=` characters.
fn parse_dataline(line: &str, part: &mut Part) -> Result<(), DecodeError> {
    let malformed = || DecodeError::MalformedHeader(line.to_owned());
    let mut rest = line;
    loop {
        let (key, tail) = rest.split_once('=').ok_or_else(malformed)?;
        if key == "name" {
            part.filename = tail.to_owned();
            return Ok(());
        }
        let (value, tail) = tail.split_once(' ').unwrap_or((tail, ""));
        match key {
            // line length is noise; every decoder ignores it
            "line" => {}
            "size" => part.size = value.parse().map_err(|_| malformed())?,
            "part" => part.number = value.parse().map_err(|_| malformed())?,
            "total" => part.total = value.parse().map_err(|_| malformed())?,
            _ => return Err(malformed()),
        }
        if tail.is_empty() {
            // ran out of tokens without seeing name=
            return Err(malformed());
        }
        rest = tail;
    }
}

/// Parse `=ypart begin=<n> end=<n>`; returns the 1-based inclusive `end`.
fn parse_partline(line: &str, part: &mut Part) -> Result<u64, DecodeError> {
    let malformed = || DecodeError::MalformedHeader(line.to_owned());
    let rest = line.strip_prefix("=ypart ").ok_or_else(malformed)?;
    let mut end = 0u64;
    for tok in rest.split_ascii_whitespace() {
        let (key, value) = tok.split_once('=').ok_or_else(malformed)?;
        match key {
            "begin" => {
                let begin: u64 = value.parse().map_err(|_| malformed())?;
                // header offsets are 1-based
                part.begin = begin.saturating_sub(1);
            }
            "end" => end = value.parse().map_err(|_| malformed())?,
            _ => return Err(malformed()),
        }
    }
    Ok(end)
}

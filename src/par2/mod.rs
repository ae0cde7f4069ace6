//! PAR2 recovery metadata: packet parsing, volume selection, verification.
//!
//! A PAR2 stream is a sequence of typed packets, each framed by the magic
//! `PAR2\0PKT`, a little-endian length, an MD5 over the packet contents, a
//! 16-byte recovery-set id, and a 16-byte type tag. The reader tolerates
//! corruption by resynchronising on the magic and dropping any packet whose
//! MD5 does not check out.
//!
//! Three packet types carry everything verification needs:
//! - *Main*: the slice length and the file ids of the recovery set
//! - *FileDesc*: per-file name, full MD5, first-16KiB MD5, and length
//! - *IFSC*: per-file slice MD5s, one per block
//!
//! Packets for the same file id merge into a single [`FileEntry`]; the
//! first set id seen fixes the set and a conflicting one is fatal.

mod select;
mod verify;

pub use select::select_volumes;
pub use verify::{FileMatch, MatchStatus, VerifyOutcome, verify};

use std::collections::HashMap;

use thiserror::Error;

/// 16-byte file identifier used throughout the PAR2 format.
pub type FileId = [u8; 16];

const MAGIC: &[u8; 8] = b"PAR2\0PKT";

/// magic + length + packet md5 + set id + type tag
const HEADER_LEN: usize = 8 + 8 + 16 + 16 + 16;

const TYPE_MAIN: &[u8; 16] = b"PAR 2.0\0Main\0\0\0\0";
const TYPE_FILE_DESC: &[u8; 16] = b"PAR 2.0\0FileDesc";
const TYPE_IFSC: &[u8; 16] = b"PAR 2.0\0IFSC\0\0\0\0";

/// file id + full md5 + 16k md5 + length, before the padded filename
const FILE_DESC_FIXED: usize = 16 + 16 + 16 + 8;

/// Errors from parsing a PAR2 packet stream.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Par2Error {
    /// Packets from two different recovery sets in one stream
    #[error("mismatched recovery set id in packet stream")]
    SetIdMismatch,
}

/// One file of the recovery set, merged from FileDesc and IFSC packets.
#[derive(Debug, Clone, Default)]
pub struct FileEntry {
    /// Filename as recorded in the FileDesc packet
    pub name: String,
    /// File length in bytes
    pub length: u64,
    md5: [u8; 16],
    md5_16k: [u8; 16],
    slice_md5s: Vec<[u8; 16]>,
}

#[derive(Debug, Clone, Copy)]
struct SliceRef {
    file_id: FileId,
    block: usize,
}

/// A parsed recovery set.
#[derive(Debug, Default)]
pub struct Fileset {
    set_id: [u8; 16],
    seen_set_id: bool,
    slice_len: u64,
    files: HashMap<FileId, FileEntry>,
    slice_index: HashMap<[u8; 16], SliceRef>,
}

impl Fileset {
    /// Parse every recognised packet out of `data`.
    ///
    /// Unknown packet types are skipped, corrupt packets are dropped after
    /// a resync, and missing information simply leaves the fileset
    /// incomplete; check [`Fileset::can_verify`] before verifying.
    pub fn parse(data: &[u8]) -> Result<Self, Par2Error> {
        let mut fset = Fileset::default();
        let mut pos = 0;

        while let Some(start) = find_magic(data, pos) {
            pos = start;
            if pos + HEADER_LEN > data.len() {
                break;
            }
            let packet_len = u64::from_le_bytes(
                data[pos + 8..pos + 16].try_into().unwrap_or([0; 8]),
            ) as usize;

            // A corrupt length field would make us skip real packets, so
            // sanity-check it before trusting it as a stride.
            if packet_len < HEADER_LEN || pos + packet_len > data.len() {
                pos += MAGIC.len();
                continue;
            }

            let hash = &data[pos + 16..pos + 32];
            let set_id: [u8; 16] = data[pos + 32..pos + 48].try_into().unwrap_or_default();
            let type_tag = &data[pos + 48..pos + 64];
            let body = &data[pos + 64..pos + packet_len];

            // packet MD5 covers set id, type tag, and body
            let mut ctx = md5::Context::new();
            ctx.consume(set_id);
            ctx.consume(type_tag);
            ctx.consume(body);
            if ctx.compute().0 != hash {
                pos += MAGIC.len();
                continue;
            }

            if !fset.seen_set_id {
                fset.set_id = set_id;
                fset.seen_set_id = true;
            } else if fset.set_id != set_id {
                return Err(Par2Error::SetIdMismatch);
            }

            if type_tag == TYPE_MAIN {
                fset.read_main(body);
            } else if type_tag == TYPE_FILE_DESC {
                fset.read_file_desc(body);
            } else if type_tag == TYPE_IFSC {
                fset.read_ifsc(body);
            }

            pos += packet_len;
        }

        Ok(fset)
    }

    fn read_main(&mut self, body: &[u8]) {
        if body.len() < 12 {
            return;
        }
        self.slice_len = u64::from_le_bytes(body[0..8].try_into().unwrap_or([0; 8]));
        let declared = u32::from_le_bytes(body[8..12].try_into().unwrap_or([0; 4])) as usize;
        let available = (body.len() - 12) / 16;
        for i in 0..declared.min(available) {
            let id: FileId = body[12 + i * 16..28 + i * 16].try_into().unwrap_or_default();
            self.files.entry(id).or_default();
        }
    }

    fn read_file_desc(&mut self, body: &[u8]) {
        if body.len() < FILE_DESC_FIXED {
            return;
        }
        let id: FileId = body[0..16].try_into().unwrap_or_default();
        let md5: [u8; 16] = body[16..32].try_into().unwrap_or_default();
        let md5_16k: [u8; 16] = body[32..48].try_into().unwrap_or_default();
        let length = u64::from_le_bytes(body[48..56].try_into().unwrap_or([0; 8]));
        let name = extract_name(&body[FILE_DESC_FIXED..]);

        // An entry discovered through Main or IFSC has no description yet;
        // fill it in without clobbering slice checksums. A second FileDesc
        // for a described entry is redundant and ignored.
        let entry = self.files.entry(id).or_default();
        if entry.name.is_empty() {
            entry.name = name;
            entry.md5 = md5;
            entry.md5_16k = md5_16k;
            entry.length = length;
        }
    }

    fn read_ifsc(&mut self, body: &[u8]) {
        if body.len() < 16 {
            return;
        }
        let id: FileId = body[0..16].try_into().unwrap_or_default();
        let entry = self.files.entry(id).or_default();
        if entry.slice_md5s.is_empty() {
            // each checksum pair is a slice MD5 followed by a CRC we ignore
            entry.slice_md5s = body[16..]
                .chunks_exact(20)
                .map(|pair| pair[0..16].try_into().unwrap_or_default())
                .collect();
        }
        for (block, md5) in entry.slice_md5s.iter().enumerate() {
            self.slice_index
                .insert(*md5, SliceRef { file_id: id, block });
        }
    }

    /// Whether enough metadata is present to verify files on disk.
    ///
    /// Requires a non-zero slice length and, for every known file id, both
    /// a name and a non-empty slice checksum vector.
    pub fn can_verify(&self) -> bool {
        self.slice_len != 0
            && !self.files.is_empty()
            && self
                .files
                .values()
                .all(|f| !f.name.is_empty() && !f.slice_md5s.is_empty())
    }

    /// Slice (block) length of the recovery set in bytes.
    pub fn slice_len(&self) -> u64 {
        self.slice_len
    }

    /// Iterate over the files of the recovery set.
    pub fn files(&self) -> impl Iterator<Item = &FileEntry> {
        self.files.values()
    }

    /// Number of slices covering `entry`.
    fn num_blocks(&self, entry: &FileEntry) -> usize {
        if self.slice_len == 0 {
            return 0;
        }
        entry.length.div_ceil(self.slice_len) as usize
    }
}

fn find_magic(data: &[u8], start: usize) -> Option<usize> {
    if start + MAGIC.len() > data.len() {
        return None;
    }
    data[start..]
        .windows(MAGIC.len())
        .position(|w| w == MAGIC)
        .map(|off| start + off)
}

/// Filenames are null-terminated and padded to a 4-byte boundary.
fn extract_name(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

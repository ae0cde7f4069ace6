//! Verification of on-disk files against a PAR2 recovery set.
//!
//! Each candidate path gets two chances: an MD5 over the whole file for an
//! exact match, then a slice-aligned scan against the set's slice-MD5 index
//! for a partial one. Because payloads arrive through yEnc with positioned
//! writes, corruption shows up as holes at block granularity, which is
//! exactly what the slice scan detects.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::warn;

use super::{FileId, Fileset};

/// How a candidate path (or an absent file) relates to a recovery-set entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchStatus {
    /// Full-file MD5 matched; the file is complete
    Intact,
    /// Some slices matched; the rest must be recovered
    Partial {
        /// Number of blocks the recovery data has to supply
        blocks_missing: usize,
    },
    /// No candidate path produced any data for this entry
    Missing,
}

/// Result for a single recovery-set entry.
#[derive(Debug, Clone)]
pub struct FileMatch {
    /// Canonical filename from the recovery set; a caller may rename a
    /// matched path to this
    pub name: String,
    /// The path attributed to this entry, when one matched
    pub path: Option<PathBuf>,
    /// Completeness of the entry
    pub status: MatchStatus,
}

/// Outcome of verifying a directory of candidates.
#[derive(Debug, Default)]
pub struct VerifyOutcome {
    /// Per-entry results, matched paths first, missing entries last
    pub matches: Vec<FileMatch>,
    /// Total recovery blocks required to make every entry whole
    pub blocks_needed: usize,
}

impl VerifyOutcome {
    /// Whether every entry of the recovery set verified intact.
    pub fn is_complete(&self) -> bool {
        self.matches
            .iter()
            .all(|m| m.status == MatchStatus::Intact)
    }
}

/// Fixed-size bitmap over a file's block numbers.
#[derive(Debug)]
struct BlockSet {
    words: Vec<u64>,
    len: usize,
}

impl BlockSet {
    fn new(len: usize) -> Self {
        BlockSet {
            words: vec![0; len.div_ceil(64)],
            len,
        }
    }

    fn set(&mut self, i: usize) {
        if i < self.len {
            self.words[i / 64] |= 1 << (i % 64);
        }
    }

    fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

/// Verify `paths` against `fileset`.
///
/// Returns one [`FileMatch`] per recovery-set entry that a path matched
/// (fully or partially) plus one `Missing` entry for every file no path
/// accounted for, along with the summed block deficit. Paths that match
/// nothing in the set are ignored; paths that cannot be read are logged
/// and skipped. A fileset that is not verifiable yields an empty outcome.
pub fn verify(fileset: &Fileset, paths: &[PathBuf]) -> VerifyOutcome {
    if !fileset.can_verify() {
        warn!("recovery set is incomplete, skipping verification");
        return VerifyOutcome::default();
    }

    // entries are consumed as they match so each is attributed once
    let mut unmatched: std::collections::HashMap<[u8; 16], FileId> = fileset
        .files
        .iter()
        .map(|(id, entry)| (entry.md5, *id))
        .collect();

    let mut outcome = VerifyOutcome::default();

    for path in paths {
        let Some((file_id, status)) = verify_file(fileset, &unmatched, path) else {
            continue;
        };
        let entry = &fileset.files[&file_id];
        unmatched.remove(&entry.md5);
        if let MatchStatus::Partial { blocks_missing } = status {
            outcome.blocks_needed += blocks_missing;
        }
        outcome.matches.push(FileMatch {
            name: entry.name.clone(),
            path: Some(path.clone()),
            status,
        });
    }

    for file_id in unmatched.values() {
        let entry = &fileset.files[file_id];
        outcome.blocks_needed += fileset.num_blocks(entry);
        outcome.matches.push(FileMatch {
            name: entry.name.clone(),
            path: None,
            status: MatchStatus::Missing,
        });
    }

    outcome
}

/// Check one path: full-file MD5 first, slice scan second.
///
/// Returns the recovery-set entry the path belongs to, or `None` when the
/// path is unreadable or matches nothing in the set.
fn verify_file(
    fileset: &Fileset,
    unmatched: &std::collections::HashMap<[u8; 16], FileId>,
    path: &Path,
) -> Option<(FileId, MatchStatus)> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot open candidate file");
            return None;
        }
    };

    match full_file_md5(&mut file) {
        Ok(md5) => {
            if let Some(&id) = unmatched.get(&md5) {
                return Some((id, MatchStatus::Intact));
            }
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot hash candidate file");
            return None;
        }
    }

    // Not an exact match: walk slice-aligned windows and attribute the
    // path to the first entry any window hits. Stray hits against other
    // entries (identical blocks across files) are ignored.
    if let Err(e) = file.seek(SeekFrom::Start(0)) {
        warn!(path = %path.display(), error = %e, "cannot rewind candidate file");
        return None;
    }

    let slice_len = fileset.slice_len as usize;
    let mut buf = vec![0u8; slice_len];
    let mut claimed: Option<FileId> = None;
    let mut hits = BlockSet::new(0);

    loop {
        let n = match read_slice(&mut file, &mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "read error during slice scan");
                break;
            }
        };
        let md5 = md5::compute(&buf[..n]).0;
        if let Some(slice) = fileset.slice_index.get(&md5) {
            match claimed {
                None => {
                    let entry = &fileset.files[&slice.file_id];
                    hits = BlockSet::new(fileset.num_blocks(entry));
                    claimed = Some(slice.file_id);
                }
                Some(id) if id != slice.file_id => continue,
                Some(_) => {}
            }
            hits.set(slice.block);
        }
        if n < slice_len {
            break;
        }
    }

    let file_id = claimed?;
    let entry = &fileset.files[&file_id];
    let blocks_missing = fileset.num_blocks(entry) - hits.count();
    Some((file_id, MatchStatus::Partial { blocks_missing }))
}

fn full_file_md5(file: &mut File) -> std::io::Result<[u8; 16]> {
    let mut ctx = md5::Context::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        ctx.consume(&buf[..n]);
    }
    Ok(ctx.compute().0)
}

/// Read up to one slice, short only at end of file.
fn read_slice(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

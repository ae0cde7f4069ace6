//! Per-file fan-in reassembly.
//!
//! A [`FileAssembler`] owns one output file under its temporary
//! `<name>.gonztemp` path. Any number of segment tasks write decoded
//! payloads into non-overlapping byte ranges through positioned writes:
//! the file handle is shared, each write carries its own offset, and no
//! lock guards the data path. Only the completion countdown is mutex
//! protected: every segment attempt, successful or not, calls
//! [`FileAssembler::done`] exactly once, and the final call renames the
//! temp file to its real name and releases the job's wait group. Segments
//! that never produced bytes simply leave holes in the sparse file.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Extension of in-progress output files.
const TEMP_SUFFIX: &str = ".gonztemp";

/// Scoped wait primitive for a wave of file downloads.
///
/// Each assembler holds a [`WaitGuard`]; [`WaitGroup::wait`] returns once
/// every guard has been dropped by its assembler's completion.
pub struct WaitGroup {
    tx: mpsc::Sender<()>,
    rx: mpsc::Receiver<()>,
}

/// Completion token held by an assembler until its file finalises.
#[derive(Debug)]
pub struct WaitGuard {
    _tx: mpsc::Sender<()>,
}

impl WaitGroup {
    /// Create an empty wait group.
    pub fn new() -> WaitGroup {
        // the channel never carries messages; membership is sender clones
        let (tx, rx) = mpsc::channel(1);
        WaitGroup { tx, rx }
    }

    /// Register one member.
    pub fn guard(&self) -> WaitGuard {
        WaitGuard {
            _tx: self.tx.clone(),
        }
    }

    /// Wait until every guard has been dropped.
    pub async fn wait(mut self) {
        drop(self.tx);
        while self.rx.recv().await.is_some() {}
    }
}

impl Default for WaitGroup {
    fn default() -> Self {
        WaitGroup::new()
    }
}

#[derive(Debug)]
struct Completion {
    parts_left: usize,
    guard: Option<WaitGuard>,
}

/// Offset-addressed writer for one logical output file.
#[derive(Debug)]
pub struct FileAssembler {
    file: File,
    name: String,
    temp_path: PathBuf,
    final_path: PathBuf,
    allocated: AtomicBool,
    completion: Mutex<Completion>,
}

impl FileAssembler {
    /// Create the temp file for `filename` in `dir`, expecting `parts`
    /// segment attempts.
    ///
    /// # Errors
    ///
    /// [`Error::FileExists`] when the final output already exists; the
    /// caller skips the logical file. I/O errors from creating the temp
    /// file pass through.
    pub fn create(
        dir: &Path,
        filename: &str,
        parts: usize,
        wait_group: &WaitGroup,
    ) -> Result<FileAssembler> {
        let final_path = dir.join(filename);
        if final_path.exists() {
            return Err(Error::FileExists(final_path));
        }

        let temp_path = dir.join(format!("{filename}{TEMP_SUFFIX}"));
        let file = File::create(&temp_path)?;

        Ok(FileAssembler {
            file,
            name: filename.to_owned(),
            temp_path,
            final_path,
            allocated: AtomicBool::new(false),
            completion: Mutex::new(Completion {
                parts_left: parts,
                guard: Some(wait_group.guard()),
            }),
        })
    }

    /// Write one decoded segment at its byte offset.
    ///
    /// The first write pre-sizes the temp file to `file_size` so dropped
    /// segments become holes in a sparse file instead of truncation.
    pub fn write_at(&self, data: &[u8], offset: u64, file_size: u64) -> std::io::Result<()> {
        if file_size > 0 && !self.allocated.swap(true, Ordering::Relaxed) {
            self.file.set_len(file_size)?;
        }
        self.write_span(offset, data)
    }

    /// Positioned write into the temp file, `pwrite` semantics: the shared
    /// handle's cursor is never moved, so writers need no lock.
    #[cfg(unix)]
    fn write_span(&self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.write_all_at(data, offset)
    }

    /// Positioned write into the temp file.
    ///
    /// Windows has no single-call pwrite-the-lot equivalent, so drive
    /// `seek_write` until the whole span is down.
    #[cfg(windows)]
    fn write_span(&self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        use std::os::windows::fs::FileExt;
        let mut done = 0;
        while done < data.len() {
            match self.file.seek_write(&data[done..], offset + done as u64)? {
                0 => return Err(std::io::ErrorKind::WriteZero.into()),
                n => done += n,
            }
        }
        Ok(())
    }

    /// Record one finished segment attempt.
    ///
    /// Must be called exactly once per expected segment, for failures as
    /// well as successes. The call that brings the countdown to zero
    /// renames the temp file into place and drops the wait-group guard.
    pub fn done(&self) {
        let mut completion = match self.completion.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        completion.parts_left = completion.parts_left.saturating_sub(1);
        if completion.parts_left > 0 {
            return;
        }
        if completion.guard.is_none() {
            // finalisation already ran; an extra done() is a caller bug
            // but must not rename twice
            return;
        }

        match std::fs::rename(&self.temp_path, &self.final_path) {
            Ok(()) => info!(file = %self.name, "finished downloading file"),
            Err(e) => {
                warn!(file = %self.name, error = %e, "could not rename completed file")
            }
        }
        completion.guard = None;
    }
}

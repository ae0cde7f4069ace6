//! Job driver: runs one NZB manifest end to end.
//!
//! A job partitions the manifest into data files and PAR2 recovery
//! material, fans every segment of the first wave (data plus PAR2 marker
//! files) out through the connection pool, and waits for all reassemblers
//! to finalise. In PAR-aware mode it then verifies the downloaded data
//! against the recovery set, knapsack-selects the cheapest recovery
//! volumes covering the block deficit, and fetches only those.
//!
//! Failures stay contained: a bad segment logs and leaves a hole, a bad
//! file skips that file, and only transport collapse aborts the job.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::{debug, info, warn};

use crate::assemble::{FileAssembler, WaitGroup};
use crate::error::{Error, Result};
use crate::nntp::Pool;
use crate::nzb::{Nzb, NzbFile};
use crate::par2::{self, Fileset};
use crate::yenc;

/// Recovery volumes encode their block count in the filename
/// (`name.vol07+08.par2` provides 8 blocks); the bare `name.par2` is the
/// marker file carrying verification metadata.
#[allow(clippy::expect_used)]
static PAR_FILENAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\.vol\d+\+(\d+))?\.par2$").expect("hard-coded pattern compiles")
});

/// PAR2 handling mode for a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ParMode {
    /// Treat PAR2 files as ordinary data
    #[default]
    Off,
    /// Fetch markers, post-verify, and fetch volumes covering the deficit
    Auto,
    /// Fetch markers plus at least this many recovery blocks up front
    Blocks(usize),
}

/// Per-run options for the job driver.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobOptions {
    /// PAR2 handling mode
    pub par: ParMode,
}

/// One recovery volume and the manifest file that carries it.
struct ParVolume {
    blocks: usize,
    file: NzbFile,
}

/// A PAR2 marker with its associated recovery volumes.
struct ParSet {
    marker: NzbFile,
    volumes: Vec<ParVolume>,
}

/// Owns the pool and options for a sequence of NZB jobs.
pub struct JobContext {
    pool: Arc<Pool>,
    options: JobOptions,
}

impl JobContext {
    /// Build a context around an existing pool.
    pub fn new(pool: Arc<Pool>, options: JobOptions) -> JobContext {
        JobContext { pool, options }
    }

    /// Download one manifest into `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error for conditions that sink the whole job: the
    /// working directory cannot be created, the pool has gone fatal, or a
    /// PAR2 marker contains packets from conflicting recovery sets.
    /// Per-segment and per-file failures are logged and absorbed.
    pub async fn run(&self, mut nzb: Nzb, dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dir).await?;

        let parsets = if self.options.par != ParMode::Off {
            filter_pars(&mut nzb)
        } else {
            Vec::new()
        };

        let wait = WaitGroup::new();
        let mut data_paths = Vec::new();
        for file in &nzb.files {
            if let Some(name) = file.filename() {
                data_paths.push(dir.join(name));
            }
            self.spawn_file(dir, file.clone(), &wait);
        }
        for set in &parsets {
            self.spawn_file(dir, set.marker.clone(), &wait);
        }
        if let ParMode::Blocks(blocks) = self.options.par {
            self.queue_volumes_upfront(dir, &parsets, blocks, &wait);
        }
        wait.wait().await;

        // every segment already logged its own failure; a fatal pool is
        // the one condition worth failing the whole job over
        if let Some(err) = self.pool.fatal() {
            return Err(err.into());
        }

        if self.options.par == ParMode::Auto {
            self.verify_and_recover(dir, &parsets, &data_paths).await?;
        }
        Ok(())
    }

    /// `--par N`: pick ≥N blocks worth of volumes before anything has
    /// been verified.
    fn queue_volumes_upfront(
        &self,
        dir: &Path,
        parsets: &[ParSet],
        blocks: usize,
        wait: &WaitGroup,
    ) {
        for set in parsets {
            let counts: Vec<usize> = set.volumes.iter().map(|v| v.blocks).collect();
            for index in par2::select_volumes(&counts, blocks) {
                self.spawn_file(dir, set.volumes[index].file.clone(), wait);
            }
        }
    }

    /// Post-verify pass: check the data files against each marker's
    /// recovery set and fetch volumes covering the block deficit.
    async fn verify_and_recover(
        &self,
        dir: &Path,
        parsets: &[ParSet],
        data_paths: &[PathBuf],
    ) -> Result<()> {
        let wait = WaitGroup::new();
        for set in parsets {
            let Some(marker_name) = set.marker.filename() else {
                continue;
            };
            let marker_path = dir.join(marker_name);
            let bytes = match tokio::fs::read(&marker_path).await {
                Ok(b) => b,
                Err(e) => {
                    warn!(path = %marker_path.display(), error = %e, "cannot read PAR2 marker");
                    continue;
                }
            };
            let fileset = Fileset::parse(&bytes)?;
            if !fileset.can_verify() {
                warn!(path = %marker_path.display(), "marker lacks verification metadata");
                continue;
            }

            // hashing a whole dataset is CPU work, keep it off the runtime
            let paths = data_paths.to_vec();
            let outcome =
                tokio::task::spawn_blocking(move || par2::verify(&fileset, &paths))
                    .await
                    .map_err(|e| Error::Io(std::io::Error::other(e)))?;

            if outcome.blocks_needed == 0 {
                info!(marker = marker_name, "all files verified intact");
                continue;
            }
            let counts: Vec<usize> = set.volumes.iter().map(|v| v.blocks).collect();
            let chosen = par2::select_volumes(&counts, outcome.blocks_needed);
            info!(
                marker = marker_name,
                blocks_needed = outcome.blocks_needed,
                volumes = chosen.len(),
                "fetching recovery volumes"
            );
            for index in chosen {
                self.spawn_file(dir, set.volumes[index].file.clone(), &wait);
            }
        }
        wait.wait().await;
        Ok(())
    }

    /// Start downloading one logical file: one task per segment, all
    /// funneled into a shared reassembler.
    fn spawn_file(&self, dir: &Path, file: NzbFile, wait: &WaitGroup) {
        let Some(filename) = file.filename().map(str::to_owned) else {
            warn!(subject = %file.subject, "no filename in subject, skipping file");
            return;
        };
        let Some(group) = file.groups.first().cloned() else {
            warn!(file = %filename, "no groups listed, skipping file");
            return;
        };

        let assembler = match FileAssembler::create(dir, &filename, file.segments.len(), wait) {
            Ok(a) => Arc::new(a),
            Err(Error::FileExists(path)) => {
                info!(path = %path.display(), "output already exists, skipping");
                return;
            }
            Err(e) => {
                warn!(file = %filename, error = %e, "cannot create output file, skipping");
                return;
            }
        };

        debug!(file = %filename, segments = file.segments.len(), group = %group, "queueing file");
        for segment in file.segments {
            let pool = Arc::clone(&self.pool);
            let assembler = Arc::clone(&assembler);
            let group = group.clone();
            tokio::spawn(async move {
                if let Err(e) =
                    fetch_segment(&pool, &group, &segment.message_id, &assembler).await
                {
                    warn!(message_id = %segment.message_id, error = %e, "segment failed");
                }
                // failures still count down so the file finalises
                assembler.done();
            });
        }
    }
}

/// Fetch, decode, and place one segment.
///
/// The error classification happens here: protocol and decode failures
/// hand the slot back, transport failures retire it.
async fn fetch_segment(
    pool: &Pool,
    group: &str,
    message_id: &str,
    assembler: &Arc<FileAssembler>,
) -> Result<()> {
    let slot = pool.acquire().await?;
    let body = match slot.fetch_body(group, message_id).await {
        Ok(body) => {
            pool.release(slot);
            body
        }
        Err(e) => {
            let err = Error::Nntp(e);
            if err.retires_connection() {
                pool.retire(slot);
            } else {
                pool.release(slot);
            }
            return Err(err);
        }
    };

    // yEnc decode plus the positioned write are blocking work
    let assembler = Arc::clone(assembler);
    tokio::task::spawn_blocking(move || -> Result<()> {
        let decoded = yenc::decode(&body)?;
        assembler.write_at(&decoded.data, decoded.part.begin, decoded.part.file_size)?;
        Ok(())
    })
    .await
    .map_err(|e| Error::Io(std::io::Error::other(e)))?
}

/// Split PAR2 material out of the manifest.
///
/// Recovery volumes attach to their marker by filename prefix: the marker
/// `release.par2` owns `release.vol00+01.par2`, `release.vol01+02.par2`,
/// and so on. Volumes without a marker are dropped along with the rest of
/// the PAR2 files; the remaining manifest holds only data files.
fn filter_pars(nzb: &mut Nzb) -> Vec<ParSet> {
    let files = std::mem::take(&mut nzb.files);
    let mut data = Vec::new();
    let mut markers = Vec::new();
    let mut volumes: HashMap<String, Vec<ParVolume>> = HashMap::new();

    for file in files {
        let Some(name) = file.filename().map(str::to_owned) else {
            data.push(file);
            continue;
        };
        let Some(caps) = PAR_FILENAME.captures(&name) else {
            data.push(file);
            continue;
        };
        match caps.get(1) {
            Some(_) => {
                let Ok(blocks) = caps[2].parse::<usize>() else {
                    data.push(file);
                    continue;
                };
                let full = caps.get(0).map(|m| m.as_str().len()).unwrap_or(0);
                let prefix = name[..name.len() - full].to_owned();
                volumes
                    .entry(prefix)
                    .or_default()
                    .push(ParVolume { blocks, file });
            }
            None => markers.push(file),
        }
    }

    nzb.files = data;
    markers
        .into_iter()
        .map(|marker| {
            // the regex guarantees the name ends with ".par2" in some case
            let key = marker
                .filename()
                .map(|n| n[..n.len() - ".par2".len()].to_owned())
                .unwrap_or_default();
            ParSet {
                volumes: volumes.remove(&key).unwrap_or_default(),
                marker,
            }
        })
        .collect()
}

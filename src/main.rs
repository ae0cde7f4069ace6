//! gonzbee CLI: download Usenet binaries from NZB manifests.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use gonzbee::Config;
use gonzbee::diag;
use gonzbee::job::{JobContext, JobOptions, ParMode};
use gonzbee::nntp::{Pool, PoolConfig};
use gonzbee::nzb;

#[derive(Parser)]
#[command(
    name = "gonzbee",
    version,
    about = "Usenet binary retriever: fetches, decodes, and reassembles the files in NZB manifests"
)]
struct Cli {
    /// Remove each NZB file after a successful run
    #[arg(long)]
    rm: bool,

    /// Save output into this directory instead of one named after the NZB
    #[arg(short = 'd', long = "dir", value_name = "DIR")]
    dir: Option<PathBuf>,

    /// PAR2 handling: bare --par verifies after download and fetches the
    /// recovery volumes covering the damage; --par=N fetches at least N
    /// recovery blocks up front
    #[arg(long, value_name = "BLOCKS", num_args = 0..=1, require_equals = true)]
    par: Option<Option<usize>>,

    /// Serve a diagnostic HTTP endpoint on this address
    #[arg(long, value_name = "ADDR")]
    prof: Option<SocketAddr>,

    /// NZB files to download
    #[arg(value_name = "NZB")]
    nzbs: Vec<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if cli.nzbs.is_empty() {
        eprintln!("no NZB files given");
        std::process::exit(1);
    }

    let config = match Config::load_or_create() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let pool = Arc::new(Pool::new(config.server(), PoolConfig::default()));

    if let Some(addr) = cli.prof {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move {
            if let Err(e) = diag::serve(addr, pool).await {
                error!(error = %e, "diagnostics endpoint failed");
            }
        });
    }

    let par = match cli.par {
        None => ParMode::Off,
        Some(None) => ParMode::Auto,
        Some(Some(blocks)) => ParMode::Blocks(blocks),
    };
    let ctx = JobContext::new(pool, JobOptions { par });

    // one bad NZB never aborts the rest of the run
    for path in &cli.nzbs {
        if let Err(e) = run_one(&ctx, path, cli.dir.as_deref()).await {
            error!(nzb = %path.display(), error = %e, "download failed");
            continue;
        }
        if cli.rm
            && let Err(e) = std::fs::remove_file(path)
        {
            error!(nzb = %path.display(), error = %e, "could not remove NZB file");
        }
    }
}

async fn run_one(ctx: &JobContext, path: &Path, save_dir: Option<&Path>) -> gonzbee::Result<()> {
    let content = tokio::fs::read(path).await?;
    let manifest = nzb::parse(&content)?;
    let dir = match save_dir {
        Some(dir) => dir.to_path_buf(),
        None => strip_nzb_extension(path),
    };
    ctx.run(manifest, &dir).await
}

/// `foo/bar.nzb` downloads into `foo/bar/`.
fn strip_nzb_extension(path: &Path) -> PathBuf {
    match path.extension() {
        Some(ext) if ext.eq_ignore_ascii_case("nzb") => path.with_extension(""),
        _ => path.to_path_buf(),
    }
}

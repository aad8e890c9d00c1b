//! Worker process for the tomopar pool.
//!
//! Reads framed requests on stdin and answers on stdout. Logs go to stderr.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tomopar-worker")]
#[command(version, about = "tomopar pool worker (started by the pool, not by hand)", long_about = None)]
struct Args {
    /// Directory holding the shared memory segments
    #[arg(long)]
    shm_dir: PathBuf,

    /// Slot of this worker within the pool
    #[arg(long, default_value_t = 0)]
    index: usize,
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tomopar=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let span = tracing::info_span!("worker", index = args.index, pid = std::process::id());
    let _guard = span.enter();

    let stdin = std::io::stdin().lock();
    let stdout = std::io::stdout().lock();
    match tomopar::worker::serve(&args.shm_dir, stdin, stdout) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "worker exiting");
            ExitCode::FAILURE
        }
    }
}

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use pmem_pool::{Pool, MIN_POOL};
use tracing_subscriber::EnvFilter;

mod check;
mod scenario;

/// Create a pool and verify the persistent mutex inside it.
///
/// Exits with status 0 when every check passes and 1 otherwise.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Where to create the pool file. It must not exist yet.
    path: PathBuf,
    /// Worker threads per scenario.
    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u32).range(1..=1024))]
    threads: u32,
    /// Lock operations per worker thread.
    #[arg(long, default_value_t = 200, value_parser = clap::value_parser!(u32).range(1..=1_000_000))]
    ops: u32,
    /// Layout name recorded in the pool header.
    #[arg(long, default_value = "cpp")]
    layout: String,
    /// Size of the pool file in bytes.
    #[arg(long, default_value_t = MIN_POOL)]
    pool_size: u64,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match run(&args) {
        Ok(()) => {
            tracing::info!(path = %args.path.display(), "all checks passed");
            ExitCode::SUCCESS
        }
        Err(err) => {
            tracing::error!(path = %args.path.display(), %err, "check run failed");
            eprintln!("pmem-check: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<(), check::Failure> {
    let pool = Pool::create(&args.path, &args.layout, args.pool_size)?;
    tracing::debug!(run_id = pool.run_id(), size = pool.size(), "created pool");

    let load = scenario::Workload {
        threads: args.threads,
        ops: args.ops,
    };
    scenario::run(&pool, &load)?;

    pool.close()?;
    Ok(())
}

//! gpumem stress test
//!
//! Hammers the class allocator from many threads on a simulated device,
//! checks that live suballocations never overlap, and prints usage stats.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p gpumem-stress -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `--device <NAME>`: Simulated device: discrete, rebar, integrated (default: discrete)
//! - `--frames <N>`: Frames to simulate (default: 120)
//! - `--allocs-per-frame <N>`: Allocations per frame (default: 512)
//! - `--max-size <BYTES>`: Largest request size (default: 4194304)
//! - `--frames-in-flight <N>`: Frames before a freed handle is reused (default: 2)
//! - `--seed <N>`: Random seed (default: 42)
//! - `--release-empty`: Give empty chunks back immediately
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod stress;

use tracing_subscriber::EnvFilter;

use crate::stress::StressConfig;

fn main() -> anyhow::Result<()> {
    if std::env::args().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,gpumem=debug,gpumem_stress=trace")),
        )
        .init();

    let config = StressConfig::from_args()?;
    tracing::info!("Running stress test: {:?}", config);

    let report = stress::run(&config)?;
    tracing::info!(
        "Done: {} allocations, {} frees, peak {} live",
        report.allocations,
        report.frees,
        report.peak_live
    );
    tracing::info!("Peak usage: {}", report.peak_stats.summary());
    Ok(())
}

fn print_help() {
    eprintln!(
        "gpumem stress test

USAGE:
    cargo run -p gpumem-stress -- [OPTIONS]

OPTIONS:
    --device <NAME>           Simulated device: discrete, rebar, integrated
                              Default: discrete
    --frames <N>              Frames to simulate (default: 120)
    --allocs-per-frame <N>    Allocations per frame (default: 512)
    --max-size <BYTES>        Largest request size (default: 4194304)
    --frames-in-flight <N>    Frames before a freed handle is reused (default: 2)
    --seed <N>                Random seed (default: 42)
    --release-empty           Give empty chunks back immediately
    -h, --help                Print this help message

EXAMPLES:
    # Default run
    cargo run -p gpumem-stress

    # Large requests on a resizable-BAR device
    cargo run -p gpumem-stress -- --device rebar --max-size 67108864

ENVIRONMENT VARIABLES:
    RUST_LOG                  Set log level (e.g., info, debug, trace)"
    );
}

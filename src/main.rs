use std::path::PathBuf;

use anyhow::Context;
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser};
use tracing::info;
use tracing_subscriber::EnvFilter;

use topgram::{DirectorySource, Pipeline, PipelineConfig};

/// Find the k byte n-grams that occur in the most files below a directory.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Directory (or single file) to scan recursively
    directory: PathBuf,

    /// Length of the n-grams to report (at least 3)
    n: usize,

    /// Number of n-grams to report
    k: usize,

    /// Over-retention factor for intermediate passes (at least 1.0).
    /// Values above 1.0 can keep a prefix that only occurs at the end of
    /// files, which makes the next pass fail with "all counts for prefix
    /// ... are zero"
    overage: f64,

    /// Reader/counter worker pairs
    n_threads: usize,

    /// 0 = warnings, 1 = progress, 2 = debug, 3 = trace; RUST_LOG overrides
    verbosity: u8,

    /// Write every pass's results instead of only the last
    #[arg(action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    save_intermediate: bool,

    /// Results go to `<prefix>.<L>.txt`
    output_file_prefix: PathBuf,

    /// Bitsets merged into the counts per flush
    #[arg(long, default_value_t = 8)]
    group_size: usize,

    /// Bytes read from a file per chunk
    #[arg(long, default_value_t = 64 * 1024)]
    chunk_size: usize,
}

fn init_tracing(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(match verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbosity);

    let config = PipelineConfig {
        n: args.n,
        k: args.k,
        overage: args.overage,
        threads: args.n_threads,
        save_intermediate: args.save_intermediate,
        output_prefix: Some(args.output_file_prefix),
        group_size: args.group_size,
        chunk_size: args.chunk_size,
        ..PipelineConfig::default()
    };

    let source = DirectorySource::new(&[&args.directory]);
    let pipeline = Pipeline::new(config, source).context("invalid arguments")?;
    let passes = pipeline
        .run()
        .with_context(|| format!("failed to extract n-grams from {}", args.directory.display()))?;

    for pass in &passes {
        if let Some(path) = &pass.output {
            info!(ngram_len = pass.ngram_len, path = %path.display(), "results written");
        }
    }
    Ok(())
}

//! # pairwise
//!
//! `pairwise` aligns every chromosome of a target genome against every
//! chromosome of a query genome with lastz, then chains, nets and projects
//! the alignments of each target chromosome into a single MAF file, running
//! only the steps whose outputs are missing or older than their inputs.
mod config;
mod driver;
mod error;
mod external;
mod freshness;
mod kent;
mod lastz;
mod progress_reporter;
mod scheduler;
mod species;
mod structures;

use std::{path::PathBuf, sync::Arc, time::Instant};

use clap::Parser;
use tracing::{info, level_filters::LevelFilter};

use crate::{
    config::{RunContextBuilder, ToolConfig},
    scheduler::WorkerPools,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Comma-separated target species, e.g. oryza_sativa
    #[clap(env = "TARGET")]
    target: String,
    /// Comma-separated query species; pairs of a species with itself are skipped
    #[clap(env = "QUERY")]
    query: String,
    /// Number of concurrent alignment (and integration) workers
    #[clap(short, long, default_value_t = num_cpus::get())]
    jobs: usize,
    /// Faster, less sensitive lastz parameters
    #[clap(long)]
    quick: bool,
    /// Print what would run without running it
    #[clap(short = 'n', long)]
    dry_run: bool,
    /// More logging; repeat for more
    #[clap(short, long, parse(from_occurrences), conflicts_with = "quiet")]
    verbose: u64,
    /// Less logging; repeat for none
    #[clap(short, long, parse(from_occurrences))]
    quiet: u64,
    /// Log alignment progress of each pair every 10 seconds
    #[clap(long)]
    progress: bool,
    /// Extra JSON config merged over ~/.pairwise.json and ./.pairwise.json
    #[clap(long)]
    config: Option<PathBuf>,
    /// Genome database release directory; defaults to {db.root}/release-{db.version}
    #[clap(long)]
    db_prefix: Option<PathBuf>,
    /// Root of the {target}/{query} output tree
    #[clap(long, default_value = "pairwise")]
    outdir: PathBuf,
}

fn log_level(verbose: u64, quiet: u64) -> LevelFilter {
    match (verbose, quiet) {
        (_, 1) => LevelFilter::ERROR,
        (_, q) if q >= 2 => LevelFilter::OFF,
        (0, _) => LevelFilter::WARN,
        (1, _) => LevelFilter::INFO,
        (2, _) => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

fn main() -> anyhow::Result<()> {
    let now = Instant::now();
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(log_level(args.verbose, args.quiet))
        .with_writer(std::io::stderr)
        .init();
    let tools = ToolConfig::load(args.config.as_deref())?;
    let db_prefix = match args.db_prefix {
        Some(p) => p,
        None => tools.db_prefix()?,
    };
    let ctx = RunContextBuilder::default()
        .dry_run(args.dry_run)
        .quick(args.quick)
        .jobs(args.jobs.max(1))
        .show_progress(args.progress)
        .outdir(args.outdir)
        .db_prefix(db_prefix)
        .tools(tools)
        .build()?;
    let pools = WorkerPools::new(ctx.jobs)?;
    let targets = driver::parse_species_list(&args.target);
    let queries = driver::parse_species_list(&args.query);
    let reports = driver::run(Arc::new(ctx), &pools, &targets, &queries)?;
    let summary = driver::summarize(&reports);
    info!("total elapsed time: {:?}", now.elapsed());
    summary
}

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

use crate::bench::EngineSelection;

#[derive(Parser)]
#[command(name = "gatecheck")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Evaluate and benchmark admission-control policies against Kubernetes manifests")]
#[command(
    long_about = "Loads constraint templates, constraints and Kubernetes objects from files or \
directories, evaluates every matching constraint against every object, and measures review \
latency distributions, throughput and allocations, with optional baseline regression gating."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Output in JSON format where applicable
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Benchmark policy evaluation over a batch of documents
    Bench {
        /// Files or directories holding templates, constraints and objects
        #[arg(value_name = "FILENAMES")]
        filenames: Vec<PathBuf>,

        /// OCI references to ingest (repeatable)
        #[arg(long = "image", value_name = "REF")]
        images: Vec<String>,

        /// Engine(s) to benchmark
        #[arg(long, value_enum, default_value = "rules")]
        engine: EngineArg,

        /// Measured repetitions over the object set
        #[arg(long, default_value_t = 100)]
        iterations: usize,

        /// Discarded repetitions before measurement
        #[arg(long, default_value_t = 10)]
        warmup: usize,

        /// Worker count; 0 selects one worker per logical CPU
        #[arg(long, default_value_t = 1)]
        concurrency: usize,

        /// Collect per-constraint evaluation statistics
        #[arg(long)]
        gather_stats: bool,

        /// Estimate allocations over the measured phase
        #[arg(long)]
        memory: bool,

        /// Prior result set to compare against (.json/.yaml)
        #[arg(long, value_name = "PATH")]
        baseline: Option<PathBuf>,

        /// Persist this run's results (.json/.yaml)
        #[arg(long, value_name = "PATH")]
        save: Option<PathBuf>,

        /// Regression percentage threshold (10 = 10%)
        #[arg(long, default_value_t = 10.0)]
        threshold: f64,

        /// Absolute latency growth below which percentage regressions are
        /// ignored (e.g. "100µs"; 0 disables)
        #[arg(long, value_parser = parse_duration_arg, default_value = "0ns")]
        min_threshold: Duration,
    },

    /// Evaluate the policies once and print the violations
    Test {
        /// Files or directories holding templates, constraints and objects
        #[arg(value_name = "FILENAMES")]
        filenames: Vec<PathBuf>,

        /// OCI references to ingest (repeatable)
        #[arg(long = "image", value_name = "REF")]
        images: Vec<String>,

        /// Engine(s) to evaluate with
        #[arg(long, value_enum, default_value = "rules")]
        engine: EngineArg,

        /// Print per-constraint evaluation statistics
        #[arg(long)]
        gather_stats: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EngineArg {
    /// The general rule engine
    Rules,
    /// The constrained expression engine
    Expr,
    /// Every registered engine
    All,
}

impl From<EngineArg> for EngineSelection {
    fn from(arg: EngineArg) -> Self {
        match arg {
            EngineArg::Rules => Self::Rules,
            EngineArg::Expr => Self::Expr,
            EngineArg::All => Self::All,
        }
    }
}

fn parse_duration_arg(s: &str) -> Result<Duration, String> {
    crate::bench::stats::parse_duration(s)
}

impl Cli {
    /// Initialize logging based on verbosity level
    pub fn init_logging(&self) {
        if self.quiet {
            return;
        }

        let level = match self.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        };

        env_logger::Builder::from_default_env()
            .filter_level(level)
            .init();
    }
}

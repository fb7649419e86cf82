//! # Gatecheck
//!
//! A policy evaluation harness for Kubernetes admission control. Gatecheck
//! compiles declarative policies (constraint templates and constraints),
//! evaluates them against Kubernetes resource manifests, and measures how
//! fast it does so.
//!
//! ## Features
//!
//! - **Constraint client**: register templates and constraints, feed the
//!   referential cache, and review objects through one thread-safe surface
//! - **Two engines**: a general rule engine with referential-data access,
//!   and a constrained expression engine without it
//! - **Referential policies**: cross-object checks ("another Service
//!   already uses this selector") through a concurrent inventory cache
//! - **Benchmarking**: latency percentiles, throughput, allocation
//!   estimates, and baseline regression gating with dual thresholds
//!
//! ## Example
//!
//! ```rust,no_run
//! use gatecheck::client::{Client, ReviewOpts};
//! use gatecheck::policy::{Constraint, Template};
//! use gatecheck::target::ReviewRequest;
//!
//! # fn main() -> gatecheck::Result<()> {
//! # let template_doc = serde_json::json!({});
//! # let constraint_doc = serde_json::json!({});
//! # let pod = serde_json::json!({});
//! let client = Client::builder().build();
//! client.add_template(Template::from_document(&template_doc)?)?;
//! client.add_constraint(Constraint::from_document(&constraint_doc)?)?;
//! let responses = client.review(&ReviewRequest::for_object(pod), &ReviewOpts::default())?;
//! for violation in responses.violations() {
//!     println!("{}: {}", violation.constraint_identity(), violation.message);
//! }
//! # Ok(())
//! # }
//! ```

pub mod bench;
pub mod cli;
pub mod client;
pub mod drivers;
pub mod error;
pub mod handlers;
pub mod ingest;
pub mod inventory;
pub mod policy;
pub mod report;
pub mod target;

// Re-export commonly used types and functions
pub use client::{Client, Responses, ReviewOpts, Violation};
pub use error::{Error, Result};
pub use handlers::CommandStatus;
pub use policy::{Constraint, Template};
pub use target::ReviewRequest;
use cli::Commands;

/// The current version of the CLI tool
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Dispatch a parsed CLI command.
pub fn run_command(command: Commands, json: bool) -> Result<CommandStatus> {
    match command {
        Commands::Bench {
            filenames,
            images,
            engine,
            iterations,
            warmup,
            concurrency,
            gather_stats,
            memory,
            baseline,
            save,
            threshold,
            min_threshold,
        } => {
            let config = bench::BenchConfig {
                filenames,
                images,
                engine: engine.into(),
                iterations,
                warmup,
                concurrency,
                gather_stats,
                memory,
                baseline,
                save,
                threshold_pct: threshold,
                min_threshold,
                progress: !json,
            };
            handlers::handle_bench(config, json)
        }
        Commands::Test {
            filenames,
            images,
            engine,
            gather_stats,
        } => handlers::handle_test(filenames, images, engine.into(), gather_stats, json),
    }
}

//! The benchmark harness.
//!
//! Drives the constraint client with a measured workload: categorize the
//! input batch, build one client per engine under test, load policies and
//! referential data, run warmup and measured review iterations (optionally
//! across a worker pool), and reduce the samples to a latency distribution,
//! throughput, and optional allocation estimates. A saved baseline turns
//! the run into a regression gate.

pub mod alloc;
pub mod baseline;
pub mod stats;
mod workers;

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};

use crate::client::{Client, ReviewOpts};
use crate::drivers::{Driver, EXPR_ENGINE_NAME, RULE_ENGINE_NAME};
use crate::error::{Error, Result};
use crate::ingest::{self, DocumentBatch, NoBundleSource};
use crate::target::ReviewRequest;

pub use baseline::{
    BenchResults, Comparison, ComparisonThresholds, EngineReport, MemoryStats,
    SetupBreakdown,
};
pub use stats::LatencyStats;

/// Below this many measured iterations the P99 is statistically shaky and
/// the harness says so.
pub const RELIABLE_ITERATIONS: usize = 1000;

/// Which engines a run exercises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineSelection {
    #[default]
    Rules,
    Expr,
    All,
}

impl EngineSelection {
    /// Engine names in run order.
    pub fn engines(self) -> Vec<&'static str> {
        match self {
            Self::Rules => vec![RULE_ENGINE_NAME],
            Self::Expr => vec![EXPR_ENGINE_NAME],
            Self::All => vec![RULE_ENGINE_NAME, EXPR_ENGINE_NAME],
        }
    }
}

/// Benchmark run configuration.
#[derive(Debug, Clone)]
pub struct BenchConfig {
    pub filenames: Vec<PathBuf>,
    pub images: Vec<String>,
    pub engine: EngineSelection,
    /// Measured repetitions over the object set.
    pub iterations: usize,
    /// Discarded repetitions before measurement.
    pub warmup: usize,
    /// Worker count; 0 selects the machine's logical CPU count.
    pub concurrency: usize,
    pub gather_stats: bool,
    pub memory: bool,
    pub baseline: Option<PathBuf>,
    pub save: Option<PathBuf>,
    /// Regression percentage threshold.
    pub threshold_pct: f64,
    /// Absolute floor under which percentage regressions are ignored.
    pub min_threshold: Duration,
    /// Show a progress bar during the measured phase.
    pub progress: bool,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            filenames: Vec::new(),
            images: Vec::new(),
            engine: EngineSelection::default(),
            iterations: 100,
            warmup: 10,
            concurrency: 1,
            gather_stats: false,
            memory: false,
            baseline: None,
            save: None,
            threshold_pct: 10.0,
            min_threshold: Duration::ZERO,
            progress: false,
        }
    }
}

impl BenchConfig {
    fn effective_concurrency(&self) -> usize {
        if self.concurrency == 0 {
            num_cpus::get()
        } else {
            self.concurrency
        }
    }
}

/// What a benchmark run produced.
#[derive(Debug)]
pub struct BenchOutcome {
    pub results: BenchResults,
    /// Present when a baseline comparison was requested.
    pub comparison: Option<Comparison>,
}

impl BenchOutcome {
    /// False when a requested comparison detected a regression.
    pub fn passed(&self) -> bool {
        self.comparison.as_ref().is_none_or(Comparison::passed)
    }
}

/// Run the configured benchmark.
pub fn run(config: &BenchConfig) -> Result<BenchOutcome> {
    if config.iterations == 0 {
        return Err(Error::invalid("iterations must be at least 1"));
    }

    let mut batch = ingest::load_batch(&config.filenames)?;
    if !config.images.is_empty() {
        ingest::load_images(&NoBundleSource, &config.images, &mut batch)?;
    }
    if batch.is_empty() {
        return Err(Error::invalid("no input documents were loaded"));
    }
    log::info!(
        "loaded {} template(s), {} constraint(s), {} object(s)",
        batch.templates.len(),
        batch.constraints.len(),
        batch.objects.len()
    );

    if config.iterations < RELIABLE_ITERATIONS {
        log::warn!(
            "only {} measured iterations; P99 figures below {} iterations are unreliable",
            config.iterations,
            RELIABLE_ITERATIONS
        );
    }

    let mut engines = Vec::new();
    for engine in config.engine.engines() {
        engines.push(run_engine(engine, &batch, config)?);
    }
    let results = BenchResults {
        created_at: Utc::now(),
        engines,
    };

    if let Some(path) = &config.save {
        baseline::save(&results, path)?;
        log::info!("saved results to {}", path.display());
    }

    let comparison = match &config.baseline {
        Some(path) => {
            let base = baseline::load(path)?;
            Some(baseline::compare(
                &results,
                &base,
                ComparisonThresholds {
                    percent: config.threshold_pct,
                    min_duration: config.min_threshold,
                },
            ))
        }
        None => None,
    };

    Ok(BenchOutcome {
        results,
        comparison,
    })
}

fn run_engine(
    engine: &'static str,
    batch: &DocumentBatch,
    config: &BenchConfig,
) -> Result<EngineReport> {
    log::info!("benchmarking engine {engine}");

    let started = Instant::now();
    let client = Client::builder()
        .with_drivers(vec![Driver::from_engine_name(engine)])
        .build();
    let client_build = started.elapsed();

    // Templates: incompatible ones are skipped, malformed ones are counted
    // as failures; neither aborts the run.
    let started = Instant::now();
    let mut templates_loaded = 0usize;
    let mut templates_skipped = 0usize;
    let mut templates_failed = 0usize;
    let mut unavailable_kinds: HashSet<String> = HashSet::new();
    for template in &batch.templates {
        match client.add_template(template.clone()) {
            Ok(_) => templates_loaded += 1,
            Err(e) if e.is_template_skip() => {
                log::debug!("skipping template '{}': {e}", template.kind);
                unavailable_kinds.insert(template.kind.clone());
                templates_skipped += 1;
            }
            Err(e) => {
                log::warn!("failed to load template '{}': {e}", template.kind);
                unavailable_kinds.insert(template.kind.clone());
                templates_failed += 1;
            }
        }
    }
    let template_compile = started.elapsed();

    let started = Instant::now();
    let mut constraints_loaded = 0usize;
    let mut constraints_skipped = 0usize;
    for constraint in &batch.constraints {
        if unavailable_kinds.contains(&constraint.kind) {
            constraints_skipped += 1;
            continue;
        }
        match client.add_constraint(constraint.clone()) {
            Ok(_) => constraints_loaded += 1,
            Err(e) => {
                log::warn!("failed to load constraint {}: {e}", constraint.identity());
                constraints_skipped += 1;
            }
        }
    }
    let constraint_load = started.elapsed();

    // Referential data only helps engines that can read it.
    let started = Instant::now();
    let referential_data = client.supports_referential_data();
    if referential_data {
        for object in &batch.objects {
            if let Err(e) = client.add_data(object) {
                log::debug!("not caching object: {e}");
            }
        }
    }
    let data_load = started.elapsed();

    let requests = build_requests(batch);
    if requests.is_empty() {
        return Err(Error::invalid(
            "the input batch contains no review objects",
        ));
    }

    let opts = ReviewOpts {
        gather_stats: config.gather_stats,
        ..Default::default()
    };

    // One counted pass, so runs across engines can be compared for
    // agreement, then warmup.
    let mut violations = 0usize;
    for request in &requests {
        violations += client.review(request, &opts)?.total_violations();
    }
    for _ in 0..config.warmup {
        for request in &requests {
            client.review(request, &opts)?;
        }
    }

    let concurrency = config.effective_concurrency();
    let total_reviews = config.iterations * requests.len();

    let memory_before = (config.memory && alloc::is_installed()).then(alloc::snapshot);
    if config.memory && !alloc::is_installed() {
        log::warn!("allocation counters are not installed; memory stats will be omitted");
    }

    let measure_start = Instant::now();
    let mut samples = if concurrency > 1 {
        workers::run_concurrent(&client, &requests, config.iterations, concurrency, &opts)?
    } else {
        run_sequential(&client, &requests, config, &opts, total_reviews)?
    };
    let wall = measure_start.elapsed();

    let memory = memory_before.map(|before| {
        let (bytes, count) = alloc::snapshot().since(&before);
        MemoryStats {
            total_allocated: bytes,
            allocations: count,
            bytes_per_review: bytes / total_reviews.max(1) as u64,
            allocations_per_review: count as f64 / total_reviews.max(1) as f64,
        }
    });

    let latency = LatencyStats::compute(&mut samples);
    let throughput = stats::throughput(samples.len(), wall);
    log::info!(
        "engine {engine}: {} reviews in {:?} ({throughput:.1} reviews/s)",
        samples.len(),
        wall
    );

    Ok(EngineReport {
        engine: engine.to_string(),
        templates_loaded,
        templates_skipped,
        templates_failed,
        constraints_loaded,
        constraints_skipped,
        objects: requests.len(),
        iterations: config.iterations,
        warmup_iterations: config.warmup,
        concurrency,
        referential_data,
        violations,
        setup: SetupBreakdown {
            client_build,
            template_compile,
            constraint_load,
            data_load,
        },
        latency,
        throughput,
        memory,
    })
}

fn run_sequential(
    client: &Client,
    requests: &[ReviewRequest],
    config: &BenchConfig,
    opts: &ReviewOpts,
    total_reviews: usize,
) -> Result<Vec<Duration>> {
    let bar = if config.progress {
        let bar = ProgressBar::new(total_reviews as u64);
        bar.set_style(
            ProgressStyle::with_template("{bar:30} {pos}/{len} reviews ({eta})")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        Some(bar)
    } else {
        None
    };

    let mut samples = Vec::with_capacity(total_reviews);
    for _ in 0..config.iterations {
        for request in requests {
            let started = Instant::now();
            client.review(request, opts)?;
            samples.push(started.elapsed());
            if let Some(bar) = &bar {
                bar.inc(1);
            }
        }
    }
    if let Some(bar) = bar {
        bar.finish_and_clear();
    }
    Ok(samples)
}

/// Build one review request per object, attaching the object's Namespace
/// when the batch carries it.
fn build_requests(batch: &DocumentBatch) -> Vec<ReviewRequest> {
    batch
        .objects
        .iter()
        .map(|object| {
            let mut request = ReviewRequest::for_object(object.clone());
            if let Some(ns) = object
                .pointer("/metadata/namespace")
                .and_then(serde_json::Value::as_str)
            {
                if let Some(ns_object) = batch.namespace_object(ns) {
                    request = request.with_namespace_object(ns_object.clone());
                }
            }
            request
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    const POLICY_SET: &str = r#"
apiVersion: templates.gatekeeper.sh/v1
kind: ConstraintTemplate
metadata:
  name: k8srequiredlabels
spec:
  crd:
    spec:
      names:
        kind: K8sRequiredLabels
      validation:
        openAPIV3Schema:
          type: object
          properties:
            labels:
              type: array
              items:
                type: string
  targets:
    - target: admission.k8s.gatekeeper.sh
      code:
        - engine: Rules
          source: |
            for label in params.labels {
              deny "missing required labels: ${label}" when not object.metadata.labels[label]
            }
        - engine: Expr
          source:
            validations:
              - expression: has(object.metadata.labels["team"])
                message: "missing required labels: team"
---
apiVersion: constraints.gatekeeper.sh/v1beta1
kind: K8sRequiredLabels
metadata:
  name: require-team
spec:
  parameters:
    labels: ["team"]
---
apiVersion: v1
kind: Pod
metadata:
  name: unlabeled
  namespace: default
---
apiVersion: v1
kind: Pod
metadata:
  name: labeled
  namespace: default
  labels:
    team: core
"#;

    fn write_policy_set(dir: &Path) -> PathBuf {
        let path = dir.join("policies.yaml");
        std::fs::write(&path, POLICY_SET).unwrap();
        path
    }

    fn quick_config(path: PathBuf) -> BenchConfig {
        BenchConfig {
            filenames: vec![path],
            iterations: 3,
            warmup: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_run_rules_engine() {
        let dir = tempfile::tempdir().unwrap();
        let config = quick_config(write_policy_set(dir.path()));
        let outcome = run(&config).unwrap();
        assert!(outcome.passed());
        assert_eq!(outcome.results.engines.len(), 1);

        let report = &outcome.results.engines[0];
        assert_eq!(report.engine, RULE_ENGINE_NAME);
        assert_eq!(report.templates_loaded, 1);
        assert_eq!(report.constraints_loaded, 1);
        assert_eq!(report.objects, 2);
        // Exactly the unlabeled pod violates.
        assert_eq!(report.violations, 1);
        assert!(report.referential_data);
        assert!(report.throughput > 0.0);
        assert!(report.latency.max >= report.latency.min);
        assert!(report.memory.is_none());
    }

    #[test]
    fn test_engines_agree_on_violations() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = quick_config(write_policy_set(dir.path()));
        config.engine = EngineSelection::All;
        let outcome = run(&config).unwrap();
        assert_eq!(outcome.results.engines.len(), 2);
        let rules = outcome.results.engine(RULE_ENGINE_NAME).unwrap();
        let expr = outcome.results.engine(EXPR_ENGINE_NAME).unwrap();
        assert_eq!(rules.violations, expr.violations);
        assert!(!expr.referential_data);
    }

    #[test]
    fn test_concurrent_run_collects_full_sample() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = quick_config(write_policy_set(dir.path()));
        config.concurrency = 4;
        config.iterations = 10;
        let outcome = run(&config).unwrap();
        let report = &outcome.results.engines[0];
        assert_eq!(report.concurrency, 4);
        assert!(report.throughput > 0.0);
    }

    #[test]
    fn test_save_compare_round_trip_passes() {
        let dir = tempfile::tempdir().unwrap();
        let policy = write_policy_set(dir.path());
        let baseline_path = dir.path().join("baseline.json");

        let mut config = quick_config(policy.clone());
        config.save = Some(baseline_path.clone());
        run(&config).unwrap();

        // Compare a fresh run against the saved baseline with a generous
        // absolute floor; micro-benchmarks of the same work should pass.
        let mut config = quick_config(policy);
        config.baseline = Some(baseline_path);
        config.threshold_pct = 500.0;
        config.min_threshold = Duration::from_secs(1);
        let outcome = run(&config).unwrap();
        assert!(outcome.comparison.is_some());
        assert!(outcome.passed());
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let config = BenchConfig {
            iterations: 0,
            ..Default::default()
        };
        assert!(matches!(run(&config), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_empty_batch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = quick_config(dir.path().to_path_buf());
        assert!(run(&config).is_err());
    }

    #[test]
    fn test_image_ingestion_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = quick_config(write_policy_set(dir.path()));
        config.images = vec!["ghcr.io/example/policies:v1".to_string()];
        let err = run(&config).unwrap_err();
        assert!(matches!(err, Error::IoFailure { .. }));
    }
}

//! Benchmark result persistence and regression comparison.
//!
//! Results are saved as JSON or YAML, chosen by file extension. Latency
//! fields are written as human-readable duration strings and byte counts
//! are humanized, keeping saved baselines diff-friendly.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bench::stats::{LatencyStats, bytes_string, delta_percent, duration_string};
use crate::error::{Error, Result};

/// Durations of the independent setup phases.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupBreakdown {
    #[serde(with = "duration_string")]
    pub client_build: Duration,
    #[serde(with = "duration_string")]
    pub template_compile: Duration,
    #[serde(with = "duration_string")]
    pub constraint_load: Duration,
    #[serde(with = "duration_string")]
    pub data_load: Duration,
}

/// Allocation estimates over the measured phase.
///
/// These are estimates from global allocator counters; anything else
/// allocating concurrently perturbs them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    #[serde(with = "bytes_string")]
    pub total_allocated: u64,
    pub allocations: u64,
    #[serde(with = "bytes_string")]
    pub bytes_per_review: u64,
    pub allocations_per_review: f64,
}

/// Results for one engine in one benchmark run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineReport {
    pub engine: String,
    pub templates_loaded: usize,
    pub templates_skipped: usize,
    pub templates_failed: usize,
    pub constraints_loaded: usize,
    pub constraints_skipped: usize,
    pub objects: usize,
    pub iterations: usize,
    pub warmup_iterations: usize,
    pub concurrency: usize,
    /// Whether this engine evaluated with referential data loaded.
    pub referential_data: bool,
    /// Violations produced by one full pass over the objects.
    pub violations: usize,
    pub setup: SetupBreakdown,
    pub latency: LatencyStats,
    /// Reviews per second over the measured phase.
    pub throughput: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryStats>,
}

/// A full benchmark run, persistable as a baseline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchResults {
    pub created_at: DateTime<Utc>,
    pub engines: Vec<EngineReport>,
}

impl BenchResults {
    pub fn engine(&self, name: &str) -> Option<&EngineReport> {
        self.engines.iter().find(|e| e.engine == name)
    }
}

/// Persist results to `path`, format chosen by extension.
pub fn save(results: &BenchResults, path: &Path) -> Result<()> {
    let serialized = match extension(path)? {
        Format::Json => serde_json::to_string_pretty(results)
            .map_err(|e| Error::io(path, e))?,
        Format::Yaml => serde_yaml::to_string(results).map_err(|e| Error::io(path, e))?,
    };
    std::fs::write(path, serialized).map_err(|e| Error::io(path, e))
}

/// Load previously saved results from `path`.
pub fn load(path: &Path) -> Result<BenchResults> {
    let content = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    match extension(path)? {
        Format::Json => serde_json::from_str(&content).map_err(|e| Error::io(path, e)),
        Format::Yaml => serde_yaml::from_str(&content).map_err(|e| Error::io(path, e)),
    }
}

enum Format {
    Json,
    Yaml,
}

fn extension(path: &Path) -> Result<Format> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => Ok(Format::Json),
        Some("yaml") | Some("yml") => Ok(Format::Yaml),
        other => Err(Error::IoFailure {
            path: path.to_path_buf(),
            reason: format!(
                "unsupported baseline extension {:?}; use .json, .yaml or .yml",
                other.unwrap_or("")
            ),
        }),
    }
}

/// Regression thresholds.
///
/// A latency metric regresses only when it exceeds the percentage
/// threshold AND its absolute growth reaches `min_duration`; the dual
/// criterion keeps small-baseline noise from failing runs. A zero
/// `min_duration` disables the absolute criterion.
#[derive(Debug, Clone, Copy)]
pub struct ComparisonThresholds {
    pub percent: f64,
    pub min_duration: Duration,
}

impl Default for ComparisonThresholds {
    fn default() -> Self {
        Self {
            percent: 10.0,
            min_duration: Duration::ZERO,
        }
    }
}

/// Verdict for one metric of one engine.
#[derive(Debug, Clone)]
pub struct MetricVerdict {
    pub metric: String,
    pub baseline_display: String,
    pub current_display: String,
    pub delta_pct: f64,
    pub passed: bool,
}

/// All verdicts for one engine.
#[derive(Debug, Clone)]
pub struct EngineComparison {
    pub engine: String,
    pub verdicts: Vec<MetricVerdict>,
}

impl EngineComparison {
    pub fn passed(&self) -> bool {
        self.verdicts.iter().all(|v| v.passed)
    }
}

/// The full comparison of a run against a baseline.
#[derive(Debug, Clone, Default)]
pub struct Comparison {
    pub engines: Vec<EngineComparison>,
    /// Engines present in the current run but absent from the baseline.
    pub unmatched_engines: Vec<String>,
}

impl Comparison {
    /// Overall pass: every metric of every matched engine passed.
    pub fn passed(&self) -> bool {
        self.engines.iter().all(EngineComparison::passed)
    }
}

/// Compare a current run against a saved baseline.
pub fn compare(
    current: &BenchResults,
    baseline: &BenchResults,
    thresholds: ComparisonThresholds,
) -> Comparison {
    let mut comparison = Comparison::default();

    for engine in &current.engines {
        let Some(base) = baseline.engine(&engine.engine) else {
            log::warn!(
                "engine '{}' is not present in the baseline; skipping comparison",
                engine.engine
            );
            comparison.unmatched_engines.push(engine.engine.clone());
            continue;
        };

        let mut verdicts = Vec::new();
        for (&(label, current_d), (_, baseline_d)) in
            engine.latency.metrics().iter().zip(base.latency.metrics())
        {
            verdicts.push(latency_verdict(label, baseline_d, current_d, thresholds));
        }

        // Throughput: a drop is the regression.
        let delta = delta_percent(base.throughput, engine.throughput);
        verdicts.push(MetricVerdict {
            metric: "throughput".to_string(),
            baseline_display: format!("{:.1} reviews/s", base.throughput),
            current_display: format!("{:.1} reviews/s", engine.throughput),
            delta_pct: delta,
            passed: -delta <= thresholds.percent,
        });

        // Memory is latency-like (higher = worse) but has no duration-typed
        // absolute criterion; the percentage threshold alone governs.
        if let (Some(cur), Some(base_mem)) = (&engine.memory, &base.memory) {
            let delta = delta_percent(
                base_mem.total_allocated as f64,
                cur.total_allocated as f64,
            );
            verdicts.push(MetricVerdict {
                metric: "memory".to_string(),
                baseline_display: crate::bench::stats::format_bytes(base_mem.total_allocated),
                current_display: crate::bench::stats::format_bytes(cur.total_allocated),
                delta_pct: delta,
                passed: delta <= thresholds.percent,
            });
        }

        comparison.engines.push(EngineComparison {
            engine: engine.engine.clone(),
            verdicts,
        });
    }

    comparison
}

fn latency_verdict(
    label: &str,
    baseline: Duration,
    current: Duration,
    thresholds: ComparisonThresholds,
) -> MetricVerdict {
    let delta = delta_percent(baseline.as_nanos() as f64, current.as_nanos() as f64);
    let abs_growth = current.saturating_sub(baseline);
    let over_percent = delta > thresholds.percent;
    let over_absolute =
        thresholds.min_duration.is_zero() || abs_growth >= thresholds.min_duration;
    MetricVerdict {
        metric: label.to_string(),
        baseline_display: crate::bench::stats::format_duration(baseline),
        current_display: crate::bench::stats::format_duration(current),
        delta_pct: delta,
        passed: !(over_percent && over_absolute),
    }
}

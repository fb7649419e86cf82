//! Human- and machine-readable output for the CLI.

use colored::Colorize;
use prettytable::{Table, format, row};

use crate::bench::stats::{format_bytes, format_duration};
use crate::bench::{BenchResults, Comparison};
use crate::client::Responses;

/// Print benchmark results; JSON mode emits the serialized results only.
pub fn print_results(results: &BenchResults, json: bool) {
    if json {
        match serde_json::to_string_pretty(results) {
            Ok(s) => println!("{s}"),
            Err(e) => eprintln!("failed to serialize results: {e}"),
        }
        return;
    }

    for engine in &results.engines {
        println!();
        println!("{}", format!("=== engine: {} ===", engine.engine).bold());
        println!(
            "  templates: {} loaded, {} skipped, {} failed",
            engine.templates_loaded, engine.templates_skipped, engine.templates_failed
        );
        println!(
            "  constraints: {} loaded, {} skipped",
            engine.constraints_loaded, engine.constraints_skipped
        );
        println!(
            "  objects: {}   referential data: {}   violations/pass: {}",
            engine.objects,
            if engine.referential_data { "loaded" } else { "unsupported" },
            engine.violations
        );
        println!(
            "  setup: client {} / templates {} / constraints {} / data {}",
            format_duration(engine.setup.client_build),
            format_duration(engine.setup.template_compile),
            format_duration(engine.setup.constraint_load),
            format_duration(engine.setup.data_load),
        );

        let mut table = Table::new();
        table.set_format(*format::consts::FORMAT_CLEAN);
        table.add_row(row![
            "iterations",
            "concurrency",
            "min",
            "mean",
            "P50",
            "P95",
            "P99",
            "max",
            "reviews/s"
        ]);
        table.add_row(row![
            engine.iterations,
            engine.concurrency,
            format_duration(engine.latency.min),
            format_duration(engine.latency.mean),
            format_duration(engine.latency.p50),
            format_duration(engine.latency.p95),
            format_duration(engine.latency.p99),
            format_duration(engine.latency.max),
            format!("{:.1}", engine.throughput)
        ]);
        table.printstd();

        if let Some(memory) = &engine.memory {
            println!(
                "  memory: {} total, {} allocations ({} / {:.1} allocs per review)",
                format_bytes(memory.total_allocated),
                memory.allocations,
                format_bytes(memory.bytes_per_review),
                memory.allocations_per_review
            );
        }
    }
}

/// Print per-metric comparison lines and the overall verdict.
pub fn print_comparison(comparison: &Comparison) {
    for engine in &comparison.engines {
        println!();
        println!(
            "{}",
            format!("=== baseline comparison: {} ===", engine.engine).bold()
        );
        for verdict in &engine.verdicts {
            let status = if verdict.passed {
                "PASS".green()
            } else {
                "FAIL".red()
            };
            println!(
                "  [{status}] {:<11} {} -> {} ({:+.1}%)",
                verdict.metric, verdict.baseline_display, verdict.current_display,
                verdict.delta_pct
            );
        }
    }
    for engine in &comparison.unmatched_engines {
        println!(
            "  {} engine '{engine}' has no baseline entry; skipped",
            "note:".yellow()
        );
    }
    println!();
    if comparison.passed() {
        println!("{}", "no regressions detected".green().bold());
    } else {
        println!("{}", "regression detected".red().bold());
    }
}

/// Print one-shot evaluation results, grouped by reviewed object.
pub fn print_reviews(engine: &str, reviews: &[(String, Responses)], gather_stats: bool) {
    println!("{}", format!("=== engine: {engine} ===").bold());
    let mut total = 0usize;
    for (object, responses) in reviews {
        for violation in responses.violations() {
            total += 1;
            let action = match violation.enforcement_action.as_str() {
                "deny" => violation.enforcement_action.as_str().red(),
                "warn" => violation.enforcement_action.as_str().yellow(),
                other => other.normal(),
            };
            let marker = if violation.is_error() {
                " (evaluation error)".dimmed()
            } else {
                "".normal()
            };
            println!(
                "[{action}] {object}: {}: {}{marker}",
                violation.constraint_identity(),
                violation.message
            );
        }
        if gather_stats {
            for target in responses.by_target.values() {
                for entry in &target.stats {
                    println!(
                        "  {} {}/{}: {} ({} evaluations)",
                        "stat".dimmed(),
                        entry.constraint_kind,
                        entry.constraint_name,
                        format_duration(entry.duration),
                        entry.evaluations
                    );
                }
            }
        }
    }
    if total == 0 {
        println!("{}", "no violations".green());
    } else {
        println!("{total} violation(s)");
    }
}

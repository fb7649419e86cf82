//! Command handlers.

use std::path::PathBuf;

use serde_json::json;

use crate::bench::{self, BenchConfig, EngineSelection};
use crate::client::{Client, ReviewOpts};
use crate::error::Result;
use crate::ingest::{self, NoBundleSource};
use crate::report;
use crate::target::{ObjectRef, ReviewRequest};

/// What a finished command tells the process about its exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// Exit 0.
    Success,
    /// Exit 1: a regression was detected or violations were found.
    Failure,
}

/// Run the benchmark and report results (and the baseline comparison when
/// one was requested).
pub fn handle_bench(config: BenchConfig, json: bool) -> Result<CommandStatus> {
    let outcome = bench::run(&config)?;
    report::print_results(&outcome.results, json);
    if let Some(comparison) = &outcome.comparison {
        if !json {
            report::print_comparison(comparison);
        }
        if !comparison.passed() {
            return Ok(CommandStatus::Failure);
        }
    }
    Ok(CommandStatus::Success)
}

/// Evaluate the batch once per selected engine and print violations.
///
/// Fails the process when any deny-action violation was produced.
pub fn handle_test(
    filenames: Vec<PathBuf>,
    images: Vec<String>,
    engines: EngineSelection,
    gather_stats: bool,
    json: bool,
) -> Result<CommandStatus> {
    let mut batch = ingest::load_batch(&filenames)?;
    if !images.is_empty() {
        ingest::load_images(&NoBundleSource, &images, &mut batch)?;
    }

    let opts = ReviewOpts {
        gather_stats,
        ..Default::default()
    };

    let mut any_deny = false;
    let mut json_violations = Vec::new();

    for engine in engines.engines() {
        let client = Client::builder()
            .with_drivers(vec![crate::drivers::Driver::from_engine_name(engine)])
            .build();

        for template in &batch.templates {
            match client.add_template(template.clone()) {
                Ok(_) => {}
                Err(e) if e.is_template_skip() => {
                    log::warn!("skipping template '{}': {e}", template.kind);
                }
                Err(e) => return Err(e),
            }
        }
        for constraint in &batch.constraints {
            match client.add_constraint(constraint.clone()) {
                Ok(_) => {}
                Err(crate::error::Error::MissingTemplate { kind }) => {
                    log::warn!(
                        "skipping constraint {}: template '{kind}' was not loaded",
                        constraint.identity()
                    );
                }
                Err(e) => return Err(e),
            }
        }
        if client.supports_referential_data() {
            for object in &batch.objects {
                if let Err(e) = client.add_data(object) {
                    log::debug!("not caching object: {e}");
                }
            }
        }

        let mut reviews = Vec::with_capacity(batch.objects.len());
        for object in &batch.objects {
            let identity = ObjectRef::from_object(object)
                .map(|r| {
                    if r.namespace.is_empty() {
                        format!("{} {}", r.kind, r.name)
                    } else {
                        format!("{} {}/{}", r.kind, r.namespace, r.name)
                    }
                })
                .unwrap_or_else(|| "<unknown object>".to_string());

            let mut request = ReviewRequest::for_object(object.clone());
            if let Some(ns) = object
                .pointer("/metadata/namespace")
                .and_then(serde_json::Value::as_str)
            {
                if let Some(ns_object) = batch.namespace_object(ns) {
                    request = request.with_namespace_object(ns_object.clone());
                }
            }

            let responses = client.review(&request, &opts)?;
            any_deny |= responses.has_deny_violations();
            if json {
                for v in responses.violations() {
                    json_violations.push(json!({
                        "engine": engine,
                        "object": identity,
                        "constraint": v.constraint_identity(),
                        "enforcementAction": v.enforcement_action.as_str(),
                        "message": v.message,
                        "error": v.is_error(),
                    }));
                }
            }
            reviews.push((identity, responses));
        }

        if !json {
            report::print_reviews(engine, &reviews, gather_stats);
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&json_violations).unwrap_or_default());
    }

    Ok(if any_deny {
        CommandStatus::Failure
    } else {
        CommandStatus::Success
    })
}

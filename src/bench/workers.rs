//! Concurrent review execution.
//!
//! (iteration × object) pairs are queued onto a bounded channel and drained
//! by a fixed pool of workers. The first fatal error flips a shared
//! cancellation token; the other workers observe it and return promptly.
//! Per-worker latency samples are merged at the end; sample order is
//! irrelevant to the percentile math.

use std::time::{Duration, Instant};

use crossbeam::channel;
use parking_lot::Mutex;

use crate::client::{Client, ReviewOpts};
use crate::drivers::CancelToken;
use crate::error::{Error, Result};
use crate::target::ReviewRequest;

/// Queue depth; workers usually keep up, this just bounds memory.
const TASK_QUEUE_DEPTH: usize = 4096;

/// Run `iterations` passes over `requests` with `workers` threads and
/// return the merged per-review latencies.
pub fn run_concurrent(
    client: &Client,
    requests: &[ReviewRequest],
    iterations: usize,
    workers: usize,
    base_opts: &ReviewOpts,
) -> Result<Vec<Duration>> {
    let (task_tx, task_rx) = channel::bounded::<usize>(TASK_QUEUE_DEPTH);
    let cancel = CancelToken::new();
    let first_error: Mutex<Option<Error>> = Mutex::new(None);

    let samples = std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let task_rx = task_rx.clone();
            let cancel = cancel.clone();
            let first_error = &first_error;
            let mut opts = base_opts.clone();
            opts.cancel = Some(cancel.clone());

            handles.push(scope.spawn(move || {
                log::trace!("bench worker {worker_id} started");
                let mut local = Vec::new();
                while let Ok(idx) = task_rx.recv() {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let started = Instant::now();
                    match client.review(&requests[idx], &opts) {
                        Ok(responses) if responses.cancelled => break,
                        Ok(_) => local.push(started.elapsed()),
                        Err(e) => {
                            let mut slot = first_error.lock();
                            if slot.is_none() {
                                *slot = Some(e);
                            }
                            cancel.cancel();
                            break;
                        }
                    }
                }
                log::trace!(
                    "bench worker {worker_id} finished ({} samples)",
                    local.len()
                );
                local
            }));
        }
        drop(task_rx);

        'feed: for _ in 0..iterations {
            for idx in 0..requests.len() {
                if cancel.is_cancelled() {
                    break 'feed;
                }
                // Send fails only once every worker has exited.
                if task_tx.send(idx).is_err() {
                    break 'feed;
                }
            }
        }
        drop(task_tx);

        let mut merged = Vec::with_capacity(iterations * requests.len());
        for handle in handles {
            match handle.join() {
                Ok(local) => merged.extend(local),
                Err(_) => {
                    let mut slot = first_error.lock();
                    if slot.is_none() {
                        *slot = Some(Error::EvaluationFailure {
                            constraint: "<unknown>".to_string(),
                            reason: "a benchmark worker panicked".to_string(),
                        });
                    }
                }
            }
        }
        merged
    });

    if let Some(error) = first_error.into_inner() {
        return Err(error);
    }
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Constraint, Template};
    use serde_json::json;

    fn deny_client(budget: Option<u64>) -> Client {
        let builder = Client::builder();
        let builder = match budget {
            Some(b) => builder.with_cost_budget(b),
            None => builder,
        };
        let client = builder.build();
        client
            .add_template(
                Template::from_document(&json!({
                    "kind": "ConstraintTemplate",
                    "metadata": {"name": "k8salwaysdeny"},
                    "spec": {
                        "crd": {"spec": {"names": {"kind": "K8sAlwaysDeny"}}},
                        "targets": [{"code": [{"engine": "Rules", "source": "deny \"no\""}]}]
                    }
                }))
                .unwrap(),
            )
            .unwrap();
        client
            .add_constraint(
                Constraint::from_document(
                    &json!({"kind": "K8sAlwaysDeny", "metadata": {"name": "no"}}),
                )
                .unwrap(),
            )
            .unwrap();
        client
    }

    fn requests(n: usize) -> Vec<ReviewRequest> {
        (0..n)
            .map(|i| {
                ReviewRequest::for_object(json!({
                    "apiVersion": "v1", "kind": "Pod",
                    "metadata": {"name": format!("pod-{i}"), "namespace": "default"}
                }))
            })
            .collect()
    }

    #[test]
    fn test_collects_all_samples() {
        let client = deny_client(None);
        let requests = requests(5);
        let samples =
            run_concurrent(&client, &requests, 8, 4, &ReviewOpts::default()).unwrap();
        assert_eq!(samples.len(), 8 * 5);
    }

    #[test]
    fn test_single_worker_matches_workload() {
        let client = deny_client(None);
        let requests = requests(3);
        let samples =
            run_concurrent(&client, &requests, 2, 1, &ReviewOpts::default()).unwrap();
        assert_eq!(samples.len(), 6);
    }

    #[test]
    fn test_fatal_error_cancels_pool() {
        // A zero budget makes every review fail with BudgetExhausted.
        let client = deny_client(Some(0));
        let requests = requests(4);
        let err = run_concurrent(&client, &requests, 100, 4, &ReviewOpts::default())
            .unwrap_err();
        assert!(matches!(err, Error::BudgetExhausted { .. }));
    }
}

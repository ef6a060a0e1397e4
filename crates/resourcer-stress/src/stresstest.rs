use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use resourcer_service::config::Config as ResourcerConfig;

use crate::workloads::{WorkloadsConfig, prepare_payload, process_payload};

pub async fn perform_stresstest(
    service_config: ResourcerConfig,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    // initialize workloads, every one with its own handlers
    let workloads: Vec<_> = workloads
        .workloads
        .into_iter()
        .enumerate()
        .map(|(i, workload)| {
            let handler_config = service_config.handler(&format!("workload-{i}"));
            let payload = prepare_payload(handler_config, workload.payload);
            (workload.concurrency, Arc::new(payload))
        })
        .collect();

    // warmup: run each workload once to make sure the caches are populated
    {
        let start = Instant::now();

        let futures = workloads.iter().map(|(_, workload)| {
            let workload = Arc::clone(workload);
            tokio::spawn(async move {
                process_payload(&workload).await;
            })
        });

        let _results = futures::future::join_all(futures).await;

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for (concurrency, workload) in workloads.into_iter() {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let fetches_before = workload.fetch_count();

        let task = tokio::spawn(async move {
            let task_durations = Arc::new(Mutex::new(DDSketch::default()));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let workload = Arc::clone(&workload);
                        let task_durations = Arc::clone(&task_durations);
                        let task_start = Instant::now();

                        let hub = sentry::Hub::new_from_top(sentry::Hub::current());
                        let ctx = sentry::TransactionContext::new("stresstest", "stresstest");
                        let transaction = hub.start_transaction(ctx);

                        let future = async move {
                            process_payload(&workload).await;

                            transaction.finish();

                            task_durations.lock().unwrap().add(task_start.elapsed().as_secs_f64());

                            drop(permit);
                        };
                        let future = future.bind_hub(hub);

                        tokio::spawn(future);
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the permits, we wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let task_durations: DDSketch = {
                let mut task_durations = task_durations.lock().unwrap();
                std::mem::take(&mut task_durations)
            };
            let fetches = workload.fetch_count() - fetches_before;

            (concurrency, task_durations, fetches)
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let (concurrency, task_durations, fetches) = task?;

        let ops = task_durations.count();
        let ops_ps = ops as f32 / duration.as_secs_f32();
        println!("Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s");
        println!("  fetches: {fetches}");
        if ops == 0 {
            continue;
        }

        let quantile = |q| {
            let secs = task_durations.quantile(q).ok().flatten().unwrap_or_default();
            Duration::from_secs_f64(secs)
        };
        let avg = Duration::from_secs_f64(task_durations.sum().unwrap_or_default() / ops as f64);
        let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }

    Ok(())
}

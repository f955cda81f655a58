use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use sketches_ddsketch::DDSketch;
use tokio::task::JoinSet;

use lazycache::Cache;
use lazycache::config::Config;

use crate::workloads::{
    FileObject, ParsedWorkload, WorkloadsConfig, prepare_workload, process_workload,
};

/// Latencies and failures observed while running one workload.
struct WorkloadReport {
    concurrency: usize,
    latencies: DDSketch,
    failed: usize,
    duration: Duration,
}

impl fmt::Display for WorkloadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ops = self.latencies.count();
        let ops_per_sec = ops as f64 / self.duration.as_secs_f64();
        write!(
            f,
            "concurrency {}: {ops} loads, {} failed, {ops_per_sec:.2} loads/s",
            self.concurrency, self.failed
        )?;
        if ops == 0 {
            return Ok(());
        }

        let secs = |q| self.latencies.quantile(q).ok().flatten().unwrap_or_default();
        let avg = self.latencies.sum().unwrap_or_default() / ops as f64;
        write!(
            f,
            "\n  avg: {:.2?}; p50: {:.2?}; p90: {:.2?}; p99: {:.2?}",
            Duration::from_secs_f64(avg),
            Duration::from_secs_f64(secs(0.5)),
            Duration::from_secs_f64(secs(0.9)),
            Duration::from_secs_f64(secs(0.99)),
        )
    }
}

/// Keeps `concurrency` loads of `workload` in flight until `duration` has passed.
async fn run_workload(
    cache: Arc<Cache<FileObject>>,
    workload: Arc<ParsedWorkload>,
    concurrency: usize,
    duration: Duration,
) -> WorkloadReport {
    let deadline = Instant::now() + duration;
    let mut report = WorkloadReport {
        concurrency,
        latencies: DDSketch::default(),
        failed: 0,
        duration,
    };

    let spawn = |loads: &mut JoinSet<_>| {
        let cache = Arc::clone(&cache);
        let workload = Arc::clone(&workload);
        loads.spawn(async move {
            let start = Instant::now();
            let result = process_workload(&cache, &workload).await;
            (start.elapsed(), result)
        });
    };

    let mut loads = JoinSet::new();
    for _ in 0..concurrency {
        spawn(&mut loads);
    }

    // every finished load is replaced until the deadline, then the remaining ones drain
    while let Some(joined) = loads.join_next().await {
        match joined {
            Ok((elapsed, result)) => {
                report.latencies.add(elapsed.as_secs_f64());
                if let Err(error) = result {
                    let error: &dyn std::error::Error = &error;
                    tracing::warn!(error, "Load failed");
                    report.failed += 1;
                }
            }
            Err(error) => {
                tracing::error!(%error, "Load task panicked");
                report.failed += 1;
            }
        }
        if Instant::now() < deadline {
            spawn(&mut loads);
        }
    }

    report
}

pub async fn perform_stresstest(
    config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    let cache = Cache::new(config.cache, FileObject::open).context("failed to start cache")?;
    let cache = Arc::new(cache);
    tracing::info!(id = cache.id(), "Started cache");

    let mut prepared = Vec::with_capacity(workloads.workloads.len());
    for (i, workload) in workloads.workloads.iter().enumerate() {
        let parsed = prepare_workload(workload)
            .with_context(|| format!("failed to prepare workload {i}"))?;
        prepared.push((workload.concurrency, Arc::new(parsed)));
    }

    // load every key once, so that the measured runs start from a warm cache
    let start = Instant::now();
    let mut warmup = JoinSet::new();
    for (_, workload) in &prepared {
        for _ in workload.keys() {
            let cache = Arc::clone(&cache);
            let workload = Arc::clone(workload);
            warmup.spawn(async move { process_workload(&cache, &workload).await });
        }
    }
    while let Some(result) = warmup.join_next().await {
        result.context("warmup task panicked")??;
    }
    let stats = cache.stats().await?;
    println!("Warmup: {:?} ({} entries)\n", start.elapsed(), stats.loaded);

    let runs = prepared.into_iter().map(|(concurrency, workload)| {
        tokio::spawn(run_workload(
            Arc::clone(&cache),
            workload,
            concurrency,
            duration,
        ))
    });
    let reports = futures::future::join_all(runs).await;

    for (i, report) in reports.into_iter().enumerate() {
        let report = report.context("workload panicked")?;
        println!("Workload {i}, {report}");
    }

    let stats = cache.stats().await?;
    println!("\nCache: {} loaded, {} loading", stats.loaded, stats.loading);

    cache.stop().await.context("failed to stop cache")?;
    Ok(())
}

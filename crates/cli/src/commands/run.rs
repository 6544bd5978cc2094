// Demo pipeline command
//
// One TaskManager stage per batch pushes jobs into a shared WorkerPool. The
// pool's transform resolves each job's key through a TtlCache whose loader
// is gated by a RateLimiter, standing in for a rate-limited upstream.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Args;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::output::{print_field, print_table_header, print_table_row, OutputFormat};
use taskline::prelude::*;

/// Pipeline knobs; every flag with an env var can also come from `.env`
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Stages running at once
    #[arg(long, env = "TASKLINE_MAX_CONCURRENCY", default_value_t = 3)]
    pub max_concurrency: usize,

    /// Worker pool size
    #[arg(long, env = "TASKLINE_WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// Number of batches (one stage each)
    #[arg(long, default_value_t = 5)]
    pub batches: u32,

    /// Jobs per batch
    #[arg(long, default_value_t = 20)]
    pub items: u32,

    /// Distinct cache keys the jobs spread over
    #[arg(long, default_value_t = 8)]
    pub keys: u32,

    /// Upstream lookups allowed per window
    #[arg(long, env = "TASKLINE_RATE", default_value_t = 20.0)]
    pub rate: f64,

    /// Rate limiter window in milliseconds
    #[arg(long, env = "TASKLINE_RATE_PER_MS", default_value_t = 1000)]
    pub per_ms: u64,

    /// Cache entry lifetime in milliseconds
    #[arg(long, env = "TASKLINE_CACHE_TTL_MS", default_value_t = 60_000)]
    pub cache_ttl_ms: u64,

    /// Background cache sweep interval in milliseconds (lazy eviction if omitted)
    #[arg(long)]
    pub sweep_ms: Option<u64>,

    /// Simulated upstream latency per lookup in milliseconds
    #[arg(long, default_value_t = 10)]
    pub lookup_ms: u64,

    /// Make every Nth job fail (0 disables)
    #[arg(long, default_value_t = 0)]
    pub fail_every: u32,

    /// Attempts per job before it counts as failed
    #[arg(long, default_value_t = 1)]
    pub attempts: u32,

    /// Keep failed jobs in a dead-letter channel instead of dropping them
    #[arg(long)]
    pub dead_letter: bool,

    /// Upper bound on graceful shutdown in seconds
    #[arg(long, default_value_t = 30)]
    pub shutdown_timeout_secs: u64,
}

/// Effective configuration of every primitive in the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub workers: usize,
    pub batches: u32,
    pub items_per_batch: u32,
    pub keys: u32,
    pub lookup_ms: u64,
    pub fail_every: u32,
    pub manager: TaskManagerConfig,
    pub pool: WorkerPoolConfig,
    pub limiter: RateLimiterConfig,
    pub cache: CacheConfig,
}

impl PipelineConfig {
    pub fn from_args(args: &RunArgs) -> Self {
        let mut cache = CacheConfig::new(Duration::from_millis(args.cache_ttl_ms));
        if let Some(sweep_ms) = args.sweep_ms {
            cache = cache.with_sweep_interval(Duration::from_millis(sweep_ms));
        }

        let retry = if args.attempts > 1 {
            RetryPolicy::exponential()
                .with_max_attempts(args.attempts)
                .with_initial_interval(Duration::from_millis(20))
        } else {
            RetryPolicy::none()
        };

        let failure_policy = if args.dead_letter {
            FailurePolicy::DeadLetter
        } else {
            FailurePolicy::Drop
        };

        Self {
            workers: args.workers,
            batches: args.batches,
            items_per_batch: args.items,
            keys: args.keys.max(1),
            lookup_ms: args.lookup_ms,
            fail_every: args.fail_every,
            manager: TaskManagerConfig::new()
                .with_max_concurrency(args.max_concurrency)
                .with_shutdown_timeout(Duration::from_secs(args.shutdown_timeout_secs)),
            pool: WorkerPoolConfig::new("pipeline")
                .with_failure_policy(failure_policy)
                .with_retry(retry),
            limiter: RateLimiterConfig::new(args.rate, Duration::from_millis(args.per_ms)),
            cache,
        }
    }

    /// Check every component's configuration
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            anyhow::bail!("workers must be at least 1");
        }
        self.manager.validate()?;
        self.pool.validate()?;
        self.limiter.validate()?;
        self.cache.validate()?;
        Ok(())
    }

    fn jobs_for_batch(&self, batch: u32) -> Vec<Job> {
        (0..self.items_per_batch)
            .map(|seq| {
                let index = batch * self.items_per_batch + seq;
                Job {
                    batch,
                    seq,
                    key: format!("key-{}", index % self.keys),
                    fail: self.fail_every > 0 && (index + 1) % self.fail_every == 0,
                }
            })
            .collect()
    }
}

/// Pool input
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub batch: u32,
    pub seq: u32,
    pub key: String,
    #[serde(skip)]
    fail: bool,
}

/// Pool output
#[derive(Debug, Clone, Serialize)]
pub struct Enriched {
    pub batch: u32,
    pub seq: u32,
    pub key: String,
    pub weight: u64,
}

/// Stand-in for an upstream value derived from the key
fn weigh(key: &str) -> u64 {
    key.bytes().map(u64::from).sum()
}

struct Pipeline {
    manager: TaskManager,
    pool: WorkerPool<Job, Enriched>,
    cache: Arc<TtlCache<String, u64>>,
    lookups: Arc<AtomicU64>,
}

impl Pipeline {
    fn build(config: &PipelineConfig) -> Result<Self> {
        config.validate()?;

        let manager = TaskManager::new(config.manager.clone())?;
        let limiter = Arc::new(RateLimiter::new(config.limiter.clone())?);
        let cache = Arc::new(TtlCache::new(config.cache.clone())?);
        let lookups = Arc::new(AtomicU64::new(0));
        let lookup_latency = Duration::from_millis(config.lookup_ms);

        let pool = {
            let cache = Arc::clone(&cache);
            let lookups = Arc::clone(&lookups);

            WorkerPool::new(config.pool.clone(), move |job: Job| {
                let cache = Arc::clone(&cache);
                let limiter = Arc::clone(&limiter);
                let lookups = Arc::clone(&lookups);

                async move {
                    if job.fail {
                        return Err(format!("simulated failure for job {}/{}", job.batch, job.seq));
                    }

                    let weight = cache
                        .get_or_try_insert_with(job.key.clone(), || async {
                            limiter.acquire().await;
                            tokio::time::sleep(lookup_latency).await;
                            lookups.fetch_add(1, Ordering::Relaxed);
                            Ok::<_, String>(weigh(&job.key))
                        })
                        .await?;

                    Ok(Enriched {
                        batch: job.batch,
                        seq: job.seq,
                        key: job.key,
                        weight,
                    })
                }
            })?
        };

        Ok(Self {
            manager,
            pool,
            cache,
            lookups,
        })
    }

    /// Run one stage per batch, then wait for the pool to drain
    async fn execute(&self, config: &PipelineConfig) {
        let stages = (0..config.batches).map(|batch| {
            let jobs = config.jobs_for_batch(batch);
            let input = self.pool.input();

            self.manager.submit(format!("batch-{batch:03}"), move || async move {
                let sent = jobs.len();
                for job in jobs {
                    input.send(job).await?;
                }
                Ok::<_, WorkerPoolError>(json!({ "batch": batch, "sent": sent }))
            })
        });

        for result in futures::future::join_all(stages).await {
            if let Err(e) = result {
                warn!(error = %e, "Stage was not admitted");
            }
        }

        self.pool.join().await;
    }

    /// Stop admitting stages, then stop the workers
    async fn shutdown(&self) {
        if let Err(e) = self.manager.shutdown_with_timeout().await {
            warn!(error = %e, "Stages still running after timeout");
        }
        self.pool.stop().await;
    }
}

/// Failed job as reported
#[derive(Debug, Serialize)]
pub struct FailedJob {
    pub job: Job,
    pub attempts: usize,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CacheSummary {
    pub entries: usize,
    pub lookups: u64,
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub interrupted: bool,
    pub elapsed_ms: u64,
    pub task_stats: TaskStats,
    pub tasks: Vec<TaskRecord>,
    pub pool: PoolStats,
    pub outputs: usize,
    pub total_weight: u64,
    pub dead_letters: Vec<FailedJob>,
    pub cache: CacheSummary,
}

pub async fn run(args: RunArgs, output: OutputFormat, quiet: bool) -> Result<()> {
    let config = PipelineConfig::from_args(&args);
    let pipeline = Pipeline::build(&config).context("Failed to build pipeline")?;

    let mut results = pipeline
        .pool
        .take_output()
        .context("output receiver already taken")?;
    let mut dead_letters = pipeline
        .pool
        .take_dead_letters()
        .context("dead-letter receiver already taken")?;

    let (sweeper_tx, sweeper_rx) = watch::channel(false);
    let sweeper = pipeline.cache.spawn_sweeper(sweeper_rx);

    pipeline.pool.start(config.workers)?;

    info!(
        batches = config.batches,
        items_per_batch = config.items_per_batch,
        workers = config.workers,
        max_concurrency = config.manager.max_concurrency,
        "Starting pipeline"
    );

    let started = Instant::now();
    let interrupted = tokio::select! {
        _ = pipeline.execute(&config) => false,
        _ = tokio::signal::ctrl_c() => {
            warn!("Received shutdown signal, draining");
            true
        }
    };

    pipeline.shutdown().await;
    sweeper_tx.send_replace(true);
    if let Some(handle) = sweeper {
        handle.await.context("cache sweeper panicked")?;
    }
    let elapsed = started.elapsed();

    let mut outputs = 0;
    let mut total_weight = 0;
    while let Ok(processed) = results.try_recv() {
        outputs += 1;
        total_weight += processed.item.weight;
    }

    let mut failed = Vec::new();
    while let Ok(letter) = dead_letters.try_recv() {
        failed.push(FailedJob {
            attempts: letter.attempts(),
            error: letter.last_error().map(str::to_string),
            job: letter.item,
        });
    }

    let mut tasks = pipeline.manager.records();
    tasks.sort_by(|a, b| a.id.cmp(&b.id));

    let report = RunReport {
        interrupted,
        elapsed_ms: elapsed.as_millis() as u64,
        task_stats: pipeline.manager.stats(),
        tasks,
        pool: pipeline.pool.stats(),
        outputs,
        total_weight,
        dead_letters: failed,
        cache: CacheSummary {
            entries: pipeline.cache.len(),
            lookups: pipeline.lookups.load(Ordering::Relaxed),
        },
    };

    info!(
        elapsed_ms = report.elapsed_ms,
        outputs = report.outputs,
        failed = report.pool.failed,
        "Pipeline finished"
    );

    if output.is_text() {
        print_report(&report, quiet);
        Ok(())
    } else {
        output.print_value(&report)
    }
}

fn print_report(report: &RunReport, quiet: bool) {
    if !quiet {
        print_table_header(&[("TASK", 12), ("STATUS", 10), ("DURATION", 10), ("DETAIL", 40)]);
        for task in &report.tasks {
            let duration = task
                .duration
                .map(|d| format!("{}ms", d.as_millis()))
                .unwrap_or_else(|| "-".to_string());
            let detail = match (&task.result, &task.error) {
                (_, Some(error)) => error.clone(),
                (Some(result), None) => result.to_string(),
                (None, None) => "-".to_string(),
            };
            print_table_row(&[
                (&task.id, 12),
                (&task.status.to_string(), 10),
                (&duration, 10),
                (&detail, 40),
            ]);
        }
        println!();
    }

    if report.interrupted {
        print_field("Interrupted", "yes");
    }
    print_field("Elapsed", &format!("{}ms", report.elapsed_ms));
    print_field(
        "Tasks",
        &format!(
            "{} completed, {} failed",
            report.task_stats.completed, report.task_stats.failed
        ),
    );
    print_field(
        "Items",
        &format!(
            "{} received, {} processed, {} failed ({} retried)",
            report.pool.received, report.pool.processed, report.pool.failed, report.pool.retried
        ),
    );
    print_field("Outputs", &report.outputs.to_string());
    print_field("Total weight", &report.total_weight.to_string());
    print_field(
        "Cache",
        &format!(
            "{} entries, {} upstream lookups",
            report.cache.entries, report.cache.lookups
        ),
    );

    if !report.dead_letters.is_empty() {
        print_field("Dead letters", &report.dead_letters.len().to_string());
        if !quiet {
            for failed in &report.dead_letters {
                println!(
                    "  batch {} seq {}: {}",
                    failed.job.batch,
                    failed.job.seq,
                    failed.error.as_deref().unwrap_or("-")
                );
            }
        }
    } else if report.pool.dropped > 0 {
        print_field("Dropped", &report.pool.dropped.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        args: RunArgs,
    }

    fn args(extra: &[&str]) -> RunArgs {
        let argv = std::iter::once("taskline").chain(extra.iter().copied());
        TestCli::parse_from(argv).args
    }

    #[test]
    fn test_config_from_args() {
        let config = PipelineConfig::from_args(&args(&[
            "--max-concurrency",
            "2",
            "--attempts",
            "3",
            "--dead-letter",
            "--sweep-ms",
            "500",
        ]));

        assert_eq!(config.manager.max_concurrency, 2);
        assert_eq!(config.pool.retry.max_attempts, 3);
        assert_eq!(config.pool.failure_policy, FailurePolicy::DeadLetter);
        assert_eq!(config.cache.sweep_interval, Some(Duration::from_millis(500)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_rate_is_rejected() {
        let config = PipelineConfig::from_args(&args(&["--rate", "0"]));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_jobs_spread_over_keys() {
        let config = PipelineConfig::from_args(&args(&[
            "--items", "4", "--keys", "3", "--fail-every", "5",
        ]));

        let jobs = config.jobs_for_batch(1);
        let keys: Vec<_> = jobs.iter().map(|j| j.key.as_str()).collect();
        assert_eq!(keys, vec!["key-1", "key-2", "key-0", "key-1"]);

        // Global index 4 is the fifth job overall
        let failing: Vec<_> = jobs.iter().filter(|j| j.fail).map(|j| j.seq).collect();
        assert_eq!(failing, vec![0]);
    }

    #[tokio::test]
    async fn test_pipeline_end_to_end() {
        let config = PipelineConfig::from_args(&args(&[
            "--batches",
            "3",
            "--items",
            "6",
            "--keys",
            "4",
            "--rate",
            "1000",
            "--lookup-ms",
            "1",
            "--fail-every",
            "6",
            "--dead-letter",
        ]));
        let pipeline = Pipeline::build(&config).unwrap();
        let mut results = pipeline.pool.take_output().unwrap();
        let mut dead = pipeline.pool.take_dead_letters().unwrap();

        pipeline.pool.start(config.workers).unwrap();
        pipeline.execute(&config).await;
        pipeline.shutdown().await;

        let mut outputs = 0;
        while let Ok(processed) = results.try_recv() {
            assert_eq!(processed.item.weight, weigh(&processed.item.key));
            outputs += 1;
        }
        let mut failed = 0;
        while dead.try_recv().is_ok() {
            failed += 1;
        }

        assert_eq!(outputs, 15);
        assert_eq!(failed, 3);
        assert_eq!(pipeline.manager.stats().completed, 3);
        assert_eq!(pipeline.cache.len(), 4);
    }
}

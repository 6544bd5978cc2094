// Effective configuration command

use anyhow::Result;

use super::run::{PipelineConfig, RunArgs};
use crate::output::{print_field, OutputFormat};

pub fn run(args: &RunArgs, output: OutputFormat) -> Result<()> {
    let config = PipelineConfig::from_args(args);
    config.validate()?;

    if !output.is_text() {
        return output.print_value(&config);
    }

    print_field("Batches", &format!("{} x {} jobs", config.batches, config.items_per_batch));
    print_field("Keys", &config.keys.to_string());
    print_field("Concurrency", &config.manager.max_concurrency.to_string());
    print_field(
        "Shutdown",
        &format!("{}s timeout", config.manager.shutdown_timeout.as_secs()),
    );
    print_field("Workers", &config.workers.to_string());
    print_field("Pool", &config.pool.name);
    print_field(
        "Failures",
        &format!(
            "{:?} after {} attempt(s)",
            config.pool.failure_policy, config.pool.retry.max_attempts
        ),
    );
    print_field(
        "Rate",
        &format!(
            "{} per {}ms",
            config.limiter.rate,
            config.limiter.per.as_millis()
        ),
    );
    print_field("Cache TTL", &format!("{}ms", config.cache.ttl.as_millis()));
    print_field(
        "Cache sweep",
        &config
            .cache
            .sweep_interval
            .map(|i| format!("every {}ms", i.as_millis()))
            .unwrap_or_else(|| "lazy".to_string()),
    );

    Ok(())
}

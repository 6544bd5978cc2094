// Taskline CLI
//
// Design Decision: Use clap derive with env fallbacks; .env is loaded first.
// Design Decision: Support text/json/yaml output formats for scripting.
// Design Decision: Logs go to stderr so structured output on stdout stays parseable.

mod commands;
mod output;
mod telemetry;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "taskline")]
#[command(about = "Taskline - run a demo pipeline over the async coordination primitives")]
#[command(version)]
pub struct Cli {
    /// Output format
    #[arg(long, short, global = true, default_value = "text", value_parser = ["text", "json", "yaml"])]
    pub output: String,

    /// Suppress non-essential output
    #[arg(long, short, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run batches through a task manager, worker pool, rate limiter and cache
    Run(commands::run::RunArgs),

    /// Print the effective configuration without running anything
    Config(commands::run::RunArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Missing .env is fine; explicit env vars and flags still apply
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    telemetry::init(telemetry::LogConfig::from_env(cli.quiet));

    let output_format = output::OutputFormat::from_str(&cli.output);

    match cli.command {
        Commands::Run(args) => commands::run::run(args, output_format, cli.quiet).await,
        Commands::Config(args) => commands::config::run(&args, output_format),
    }
}

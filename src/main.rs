use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use loadplane::config::{LoadplaneConfig, LoggingConfig};
use loadplane::engine::{notifier, Engine, EngineSettings, StressTest};
use loadplane::results::{ResultStore, TestStatus};

#[derive(Parser)]
#[command(
    name = "loadplane",
    about = "Control plane that drives chunked HTTP load tests against deployed workloads",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + broadcaster + retention)
    Serve {
        /// Bind address, overrides the config file
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run a load-test plan in the foreground and print its results
    Run {
        /// Plan document (YAML or JSON)
        #[arg(long)]
        plan: PathBuf,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Parse a plan document without running it
    Validate {
        /// Plan document (YAML or JSON)
        #[arg(long)]
        plan: PathBuf,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = LoadplaneConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(bind = %config.server.bind, "Starting loadplane daemon");
            loadplane::serve(config).await?;
        }
        Commands::Run { plan, json } => {
            let bytes = std::fs::read(&plan)
                .with_context(|| format!("failed to read plan: {}", plan.display()))?;

            let store = ResultStore::new();
            let (notifier, completions) = notifier::channel();
            let engine = Engine::new(EngineSettings::from(&config.engine), store.clone(), notifier)?;
            let broadcaster = loadplane::broadcast::Broadcaster::new(store.clone(), 1);
            tokio::spawn(broadcaster.run(completions));

            let mut test = StressTest::new(&bytes, &engine).await?;
            test.initialize().await?;
            let summary = test.execute().await?;
            let entries = store.snapshot(&summary.run_id).await.unwrap_or_default();

            if json {
                let output = serde_json::json!({ "summary": summary, "entries": entries });
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                println!("\nRun {}", summary.run_id);
                println!(
                    "Chunks: {}/{}   Dispatched: {}   Successes: {}   Errors: {}   Elapsed: {} ms{}",
                    summary.chunks_run,
                    summary.chunks_planned,
                    summary.dispatched,
                    summary.successes,
                    summary.errors,
                    summary.elapsed_ms,
                    if summary.cancelled { "   (cancelled)" } else { "" }
                );
                println!();
                println!(
                    "{:<4} | {:<20} | {:<10} | {:>9} | {:>9} | {:>9} | {:>12}",
                    "ID", "Test", "Status", "Completed", "Remaining", "Success", "Avg (ms)"
                );
                println!(
                    "{:-<4}-|-{:-<20}-|-{:-<10}-|-{:-<9}-|-{:-<9}-|-{:-<9}-|-{:-<12}",
                    "", "", "", "", "", "", ""
                );
                for e in &entries {
                    let status = match e.status {
                        TestStatus::Created => "CREATED",
                        TestStatus::Running => "RUNNING",
                        TestStatus::Completed => "COMPLETED",
                    };
                    println!(
                        "{:<4} | {:<20} | {:<10} | {:>9} | {:>9} | {:>9} | {:>12.2}",
                        e.test_id, e.name, status, e.completed, e.remaining, e.success, e.avg_response_time
                    );
                }
                println!();
            }
        }
        Commands::Validate { plan } => {
            let bytes = std::fs::read(&plan)
                .with_context(|| format!("failed to read plan: {}", plan.display()))?;
            let parsed = loadplane::plan::TestPlan::from_slice(&bytes)
                .with_context(|| format!("invalid plan: {}", plan.display()))?;
            println!(
                "Plan OK: {} test(s), {} request(s) against {}:{}",
                parsed.tests.len(),
                parsed.num_requests,
                parsed.host(),
                parsed.server_port
            );
        }
    }

    Ok(())
}

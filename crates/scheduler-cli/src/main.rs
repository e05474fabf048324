//! Local demonstration harness for the latchwork scheduler core.
//!
//! Not a served API — this binary exists so the engine's lifecycle can be
//! watched from a terminal. Follows a `dev-cli` main shape: a
//! `clap::Parser` over a `Subcommand` enum, `anyhow::Result` at the
//! top level, and `console::style` for output, with `tracing-subscriber`
//! installed here and only here (the library crate never installs a global
//! subscriber).

mod jobs;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use console::style;
use scheduler_core::{Engine, EngineConfig, EventBus, MisfirePolicy, PlanSpec, SystemClock};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "latchwork")]
#[command(about = "Demonstration harness for the latchwork job scheduler")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Schedule one one-shot job, run it to completion, and print the
    /// lifecycle events as they happen.
    Demo,

    /// Run the engine continuously against a couple of illustrative jobs
    /// (a steady heartbeat job and a flaky job with retries) until Ctrl+C.
    Run {
        /// Global concurrency cap across all jobs.
        #[arg(long, default_value_t = 2)]
        max_concurrent_runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Demo => run_demo().await,
        Commands::Run { max_concurrent_runs } => run_forever(max_concurrent_runs).await,
    }
}

async fn run_demo() -> Result<()> {
    println!("{}", style("latchwork demo").bold().cyan());

    let bus = EventBus::new();
    let engine = Engine::builder(
        Arc::new(scheduler_core::InMemoryStore::new()),
        bus.clone(),
        Arc::new(SystemClock),
    )
    .build();
    engine.bootstrap().await?;

    let subscriptions = jobs::subscribe_and_print(&bus);

    let job = jobs::hello_world_job();
    let job_id = job.id;
    engine.register_job(job, jobs::hello_world_handler).await?;

    let run_at = chrono::Utc::now() + chrono::Duration::milliseconds(50);
    engine
        .schedule(job_id, PlanSpec::At { run_at }, MisfirePolicy::Skip, 0, None)
        .await?;

    tokio::time::sleep(Duration::from_millis(400)).await;
    engine.shutdown(true, Some(Duration::from_secs(2))).await;
    drop(subscriptions);

    println!("{}", style("demo complete").bold().green());
    Ok(())
}

async fn run_forever(max_concurrent_runs: usize) -> Result<()> {
    println!(
        "{} (max_concurrent_runs={max_concurrent_runs})",
        style("latchwork running — press Ctrl+C to stop").bold().cyan()
    );

    let bus = EventBus::new();
    let config = EngineConfig::builder()
        .max_concurrent_runs(Some(max_concurrent_runs))
        .build();
    let engine = Engine::builder(
        Arc::new(scheduler_core::InMemoryStore::new()),
        bus.clone(),
        Arc::new(SystemClock),
    )
    .config(config.clone())
    .build();
    engine.bootstrap().await?;

    let _subscriptions = jobs::subscribe_and_print(&bus);
    jobs::register_demo_jobs(&engine).await?;

    let tick_engine = engine.clone();
    let poll_interval = config.poll_interval;
    let tick_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll_interval);
        loop {
            ticker.tick().await;
            if tick_engine.is_shutting_down() {
                break;
            }
            if let Err(err) = tick_engine.tick_once().await {
                tracing::warn!(error = %err, "tick failed");
            }
        }
    });

    let stalled_engine = engine.clone();
    let stalled_period = config.stalled_monitor_period();
    let stalled_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(stalled_period);
        loop {
            ticker.tick().await;
            if stalled_engine.is_shutting_down() {
                break;
            }
            if let Err(err) = stalled_engine.check_stalled().await {
                tracing::warn!(error = %err, "stalled-run sweep failed");
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    println!("\n{}", style("shutting down...").bold().yellow());
    engine.shutdown(true, Some(Duration::from_secs(5))).await;
    tick_task.abort();
    stalled_task.abort();

    println!("{}", style("stopped").bold().green());
    Ok(())
}

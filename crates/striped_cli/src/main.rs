//! Striped executor CLI
//!
//! Drives a striped executor through its main workloads and prints a JSON
//! report with the executor metrics.

#![warn(missing_docs)]
#![warn(clippy::all)]

use clap::{Parser, Subcommand};
use color_eyre::Result;
use color_eyre::eyre::WrapErr;
use parking_lot::Mutex;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use striped_core::ExecutorConfig;
use striped_runtime::{MetricsSnapshot, StripedExecutor};
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "striped")]
#[command(about = "Key-partitioned task executor", long_about = None)]
struct Cli {
    /// JSON executor config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Worker threads, overrides the config file
    #[arg(short, long, global = true)]
    workers: Option<usize>,

    /// Log filter, e.g. `striped=debug`
    #[arg(long, global = true, default_value = "striped=info,striped_runtime=info")]
    log: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit numbered tasks on several stripes and check per-stripe order
    Ordered {
        /// Number of stripes
        #[arg(short, long, default_value_t = 4)]
        stripes: usize,
        /// Tasks per stripe
        #[arg(short, long, default_value_t = 100)]
        tasks: usize,
    },
    /// Run one sleeping task per stripe and report the wall-clock time
    Parallel {
        /// Number of stripes
        #[arg(short, long, default_value_t = 2)]
        stripes: usize,
        /// Sleep per task in milliseconds
        #[arg(long, default_value_t = 200)]
        sleep_ms: u64,
    },
    /// Queue work behind a slow task, then stop immediately
    Stop {
        /// Tasks queued behind the slow one
        #[arg(short, long, default_value_t = 10)]
        queued: usize,
    },
}

#[derive(Serialize)]
struct Report {
    command: &'static str,
    elapsed_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    in_order: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    discarded: Option<usize>,
    terminated: bool,
    metrics: MetricsSnapshot,
}

fn load_config(cli: &Cli) -> Result<ExecutorConfig> {
    let mut config = match &cli.config {
        Some(path) => ExecutorConfig::from_json_file(path)
            .wrap_err_with(|| format!("loading config from {}", path.display()))?,
        None => ExecutorConfig::default(),
    };
    if let Some(workers) = cli.workers {
        config = config.with_workers(workers);
    }
    config.validate()?;
    Ok(config)
}

async fn ordered(config: &ExecutorConfig, stripes: usize, tasks: usize) -> Result<Report> {
    let executor = StripedExecutor::<String>::with_config(config)?;
    let log = Arc::new(Mutex::new(Vec::with_capacity(stripes * tasks)));
    let start = Instant::now();

    let mut handles = Vec::with_capacity(stripes * tasks);
    for seq in 0..tasks {
        for stripe in 0..stripes {
            let key = format!("peer-{}", stripe);
            let log = Arc::clone(&log);
            let entry = key.clone();
            handles.push(executor.submit(Some(key), move || {
                log.lock().push((entry, seq));
            })?);
        }
    }
    for handle in handles {
        handle.await?;
    }

    let in_order = {
        let log = log.lock();
        (0..stripes).all(|stripe| {
            let key = format!("peer-{}", stripe);
            log.iter()
                .filter(|(k, _)| *k == key)
                .map(|(_, seq)| *seq)
                .eq(0..tasks)
        })
    };
    let elapsed_ms = start.elapsed().as_millis();

    executor.shutdown();
    let terminated = executor.terminated(config.shutdown_grace()).await;
    info!(stripes, tasks, in_order, "ordered run finished");

    Ok(Report {
        command: "ordered",
        elapsed_ms,
        in_order: Some(in_order),
        discarded: None,
        terminated,
        metrics: executor.metrics(),
    })
}

async fn parallel(config: &ExecutorConfig, stripes: usize, sleep_ms: u64) -> Result<Report> {
    let executor = StripedExecutor::<usize>::with_config(config)?;
    let start = Instant::now();

    let handles = (0..stripes)
        .map(|stripe| {
            executor.submit(Some(stripe), move || {
                std::thread::sleep(Duration::from_millis(sleep_ms));
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    for handle in handles {
        handle.await?;
    }
    let elapsed_ms = start.elapsed().as_millis();

    executor.shutdown();
    let terminated = executor.terminated(config.shutdown_grace()).await;
    info!(stripes, sleep_ms, elapsed_ms, "parallel run finished");

    Ok(Report {
        command: "parallel",
        elapsed_ms,
        in_order: None,
        discarded: None,
        terminated,
        metrics: executor.metrics(),
    })
}

async fn stop(config: &ExecutorConfig, queued: usize) -> Result<Report> {
    let executor = StripedExecutor::<&'static str>::with_config(config)?;
    let start = Instant::now();

    let (started_tx, started_rx) = std::sync::mpsc::channel();
    executor.submit(Some("slow"), move || {
        let _ = started_tx.send(());
        std::thread::sleep(Duration::from_millis(100));
    })?;
    for _ in 0..queued {
        executor.submit(Some("slow"), || ())?;
    }
    started_rx
        .recv_timeout(config.shutdown_grace())
        .wrap_err("slow task never started")?;

    let discarded = executor.shutdown_now();
    debug!(discarded = discarded.len(), "queued work discarded");
    let count = discarded.len();
    drop(discarded);

    let terminated = executor.terminated(config.shutdown_grace()).await;
    info!(queued, discarded = count, "stop run finished");

    Ok(Report {
        command: "stop",
        elapsed_ms: start.elapsed().as_millis(),
        in_order: None,
        discarded: Some(count),
        terminated,
        metrics: executor.metrics(),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(cli.log.as_str())
        .with_writer(std::io::stderr);
    if cli.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let config = load_config(&cli)?;
    debug!(workers = config.workers, "executor config loaded");

    let report = match cli.command {
        Commands::Ordered { stripes, tasks } => ordered(&config, stripes, tasks).await?,
        Commands::Parallel { stripes, sleep_ms } => parallel(&config, stripes, sleep_ms).await?,
        Commands::Stop { queued } => stop(&config, queued).await?,
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

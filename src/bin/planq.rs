//! planq CLI: run a demonstration pipeline on the dispatcher.
//!
//! `planq run` seeds one job per `--jobs`; a splitter fans each job out into
//! numbers, a squarer squares them (optionally failing first attempts), and a
//! collector joins on the job's provenance prefix to report the sum.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, bail};
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use planq::config::Config;
use planq::telemetry::{TelemetryConfig, init_telemetry};
use planq::{Dispatcher, ProvenanceChain, Task, WorkContext, Worker};
use serde_json::json;
use tracing::info;

#[derive(Parser)]
#[command(name = "planq", about = "Provenance-tracking task dispatcher")]
struct Cli {
    /// TOML config file. Environment variables are used when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the fan-out/join demo pipeline
    Run {
        /// Number of independent jobs to seed
        #[arg(long, default_value_t = 2)]
        jobs: u64,
        /// Numbers produced per job
        #[arg(long, default_value_t = 5)]
        fan_out: u64,
        /// Override the configured pool size
        #[arg(long)]
        max_parallel: Option<usize>,
        /// Retries allowed for the squarer
        #[arg(long, default_value_t = 2)]
        retries: u32,
        /// Make the squarer fail the first attempt of every task
        #[arg(long)]
        flaky: bool,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = match cli.config {
        Some(ref path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };

    match cli.command {
        Command::Run {
            jobs,
            fan_out,
            max_parallel,
            retries,
            flaky,
        } => {
            if let Some(n) = max_parallel {
                config.dispatcher.max_parallel = n;
                config.dispatcher.validate()?;
            }
            let _guard = init_telemetry(TelemetryConfig::from_config(&config, "planq"))?;
            cmd_run(config, jobs, fan_out, retries, flaky).await
        }
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn cmd_run(
    config: Config,
    jobs: u64,
    fan_out: u64,
    retries: u32,
    flaky: bool,
) -> anyhow::Result<()> {
    let dispatcher = Dispatcher::new(config.dispatcher);

    let collector = Arc::new(Collector::default());
    let squarer: Arc<dyn Worker> = Arc::new(Squarer {
        retries,
        flaky,
        collector: collector.clone(),
    });
    let splitter: Arc<dyn Worker> = Arc::new(Splitter {
        fan_out,
        squarer,
        collector: collector.clone(),
    });

    let seeds: Vec<_> = (1..=jobs)
        .map(|job| {
            let task = Task::new("job", json!({ "job": job })).with_origin("cli", job);
            (Arc::clone(&splitter), task)
        })
        .collect();
    dispatcher.add_multiple_work(seeds)?;

    let handle = dispatcher.spawn();
    dispatcher.wait_for_completion(false).await;
    dispatcher.stop();
    handle.await.context("dispatcher loop panicked")?;

    let mut sums: Vec<_> = collector.results.lock().drain(..).collect();
    sums.sort();
    for (job, sum) in &sums {
        println!("{job}: sum of squares = {sum}");
    }

    let report = json!({
        "stats": dispatcher.stats(),
        "completed": dispatcher.get_completed_tasks().len(),
        "failed": dispatcher.get_failed_tasks(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    if sums.len() as u64 != jobs {
        bail!("expected {jobs} joined results, got {}", sums.len());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Demo workers
// ---------------------------------------------------------------------------

struct Splitter {
    fan_out: u64,
    squarer: Arc<dyn Worker>,
    collector: Arc<Collector>,
}

impl Worker for Splitter {
    fn name(&self) -> &str {
        "splitter"
    }

    fn pre_consume_work(&self, task: &Task, ctx: &WorkContext<'_>) -> anyhow::Result<()> {
        let children = (1..=self.fan_out)
            .map(|n| (Arc::clone(&self.squarer), ctx.derive("number", json!({ "n": n }))))
            .collect();
        ctx.add_multiple_work(children)?;

        let collector: Arc<dyn Worker> = self.collector.clone();
        ctx.dispatcher()
            .watch(task.provenance().clone(), collector, Some(task));
        Ok(())
    }
}

struct Squarer {
    retries: u32,
    flaky: bool,
    collector: Arc<Collector>,
}

impl Worker for Squarer {
    fn name(&self) -> &str {
        "squarer"
    }

    fn num_retries(&self) -> u32 {
        self.retries
    }

    fn pre_consume_work(&self, task: &Task, ctx: &WorkContext<'_>) -> anyhow::Result<()> {
        if self.flaky && task.retry_count() == 0 {
            bail!("simulated transient failure");
        }
        let n = task.data["n"]
            .as_i64()
            .context("number task without an integer `n`")?;
        ctx.publish(self.collector.clone(), "square", json!({ "value": n * n }))?;
        Ok(())
    }
}

#[derive(Default)]
struct Collector {
    sums: Mutex<HashMap<ProvenanceChain, i64>>,
    results: Mutex<Vec<(String, i64)>>,
}

impl Worker for Collector {
    fn name(&self) -> &str {
        "collector"
    }

    fn pre_consume_work(&self, task: &Task, _ctx: &WorkContext<'_>) -> anyhow::Result<()> {
        let job = task.prefix(1).context("square task without provenance")?;
        let value = task.data["value"].as_i64().unwrap_or_default();
        *self.sums.lock().entry(job).or_default() += value;
        Ok(())
    }

    fn notify(&self, prefix: &ProvenanceChain, ctx: &WorkContext<'_>) -> anyhow::Result<()> {
        let sum = self.sums.lock().remove(prefix).unwrap_or_default();
        info!(job = %prefix, sum, "job joined");
        self.results.lock().push((prefix.to_string(), sum));
        ctx.unwatch(prefix);
        Ok(())
    }
}

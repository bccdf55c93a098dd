//! CLI argument parsing and command dispatch

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gridbench_core::channel::DEFAULT_PORT;
use gridbench_core::{
    Benchmark, ChannelConfig, LocalWorkerConnection, MasterBuilder, RemoteWorker,
    RemoteWorkerConnection, Report, ServiceRegistry, StageRegistry, WorkerConnection,
};

/// gridbench - Distributed benchmarks for cache and data-grid services
#[derive(Parser, Debug)]
#[command(name = "gridbench")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a benchmark as the master
    Master {
        /// Path to the benchmark descriptor (JSON)
        #[arg(short, long)]
        benchmark: PathBuf,

        /// Interface to listen on for workers
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Port to listen on for workers
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Time to wait for the whole fleet to connect (e.g. "5m")
        #[arg(long, value_parser = humantime_duration, default_value = "5m")]
        connect_timeout: Duration,

        /// Run the workers inside this process instead of over TCP
        #[arg(long)]
        local: bool,

        /// Write the reports to this JSON file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Serve a master as one worker of the fleet
    Worker {
        /// Master address, host:port
        #[arg(short, long)]
        master: String,

        /// Requested worker index; any free index when omitted
        #[arg(short, long)]
        index: Option<usize>,

        /// Time to keep retrying the master (e.g. "5m")
        #[arg(long, value_parser = humantime_duration, default_value = "5m")]
        connect_timeout: Duration,
    },
    /// Validate a benchmark descriptor without running it
    Validate {
        /// Path to the benchmark descriptor (JSON)
        #[arg(short, long)]
        benchmark: PathBuf,
    },
}

fn humantime_duration(value: &str) -> std::result::Result<Duration, humantime::DurationError> {
    humantime::parse_duration(value)
}

impl Cli {
    /// Dispatch the selected command
    pub async fn run(&self) -> Result<()> {
        match &self.command {
            Commands::Master {
                benchmark,
                host,
                port,
                connect_timeout,
                local,
                output,
            } => {
                let channel = ChannelConfig::default()
                    .with_host(host.clone())
                    .with_port(*port)
                    .with_connect_timeout(*connect_timeout);
                run_master(benchmark, channel, *local, output.as_deref()).await
            }
            Commands::Worker {
                master,
                index,
                connect_timeout,
            } => {
                let channel = ChannelConfig::default().with_connect_timeout(*connect_timeout);
                run_worker(master, *index, channel).await
            }
            Commands::Validate { benchmark } => {
                let benchmark = load_benchmark(benchmark)?;
                check_stages(&benchmark, &StageRegistry::with_builtin())?;
                println!(
                    "Benchmark is valid: {} stages, {} configurations, {} clusters, {} workers needed",
                    benchmark.scenario.stage_count(),
                    benchmark.configurations.len(),
                    benchmark.clusters.len(),
                    benchmark.max_cluster_size()
                );
                Ok(())
            }
        }
    }
}

fn load_benchmark(path: &Path) -> Result<Benchmark> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read benchmark: {}", path.display()))?;
    let benchmark = Benchmark::from_json(&json)
        .with_context(|| format!("Failed to parse benchmark: {}", path.display()))?;
    benchmark
        .validate()
        .with_context(|| format!("Invalid benchmark: {}", path.display()))?;
    Ok(benchmark)
}

fn check_stages(benchmark: &Benchmark, stages: &StageRegistry) -> Result<()> {
    for (id, description) in benchmark.scenario.stages().iter().enumerate() {
        if !stages.contains(&description.stage_type) {
            anyhow::bail!("Stage {id}: unknown stage type '{}'", description.stage_type);
        }
    }
    Ok(())
}

async fn run_master(
    path: &Path,
    channel: ChannelConfig,
    local: bool,
    output: Option<&Path>,
) -> Result<()> {
    let benchmark = load_benchmark(path)?;
    let fleet_size = benchmark.max_cluster_size();
    let stages = Arc::new(StageRegistry::with_builtin());

    let connection: Box<dyn WorkerConnection> = if local {
        tracing::info!(workers = fleet_size, "Starting local fleet");
        Box::new(LocalWorkerConnection::new(
            fleet_size,
            Arc::clone(&stages),
            Arc::new(ServiceRegistry::with_builtin()),
        ))
    } else {
        let mut connection = RemoteWorkerConnection::bind(channel)
            .await
            .context("Failed to bind master")?;
        tracing::info!(
            workers = fleet_size,
            address = %connection.local_addr()?,
            "Waiting for workers"
        );
        connection
            .establish(fleet_size)
            .await
            .context("Worker fleet incomplete")?;
        Box::new(connection)
    };

    let master = MasterBuilder::new()
        .benchmark(benchmark)
        .stages(stages)
        .connection(connection)
        .build()?;
    let reports = master.run_with_signal_handling().await?;

    print_reports(&reports);
    if let Some(output) = output {
        let file = std::fs::File::create(output)
            .with_context(|| format!("Failed to create output file: {}", output.display()))?;
        serde_json::to_writer_pretty(file, &reports)?;
        println!("Reports written to {}", output.display());
    }

    let aborted = reports.iter().filter(|r| r.is_aborted()).count();
    if aborted > 0 {
        anyhow::bail!("{aborted} of {} runs aborted", reports.len());
    }
    Ok(())
}

async fn run_worker(master: &str, index: Option<usize>, channel: ChannelConfig) -> Result<()> {
    let worker = RemoteWorker::connect(master, index, &channel)
        .await
        .with_context(|| format!("Failed to join master at {master}"))?;
    worker
        .serve(
            Arc::new(StageRegistry::with_builtin()),
            Arc::new(ServiceRegistry::with_builtin()),
        )
        .await?;
    Ok(())
}

fn print_reports(reports: &[Report]) {
    println!("\n{}", "=".repeat(70));
    println!("   Results");
    println!("{}", "=".repeat(70));
    for report in reports {
        println!();
        println!("Configuration {} on {}", report.configuration, report.cluster);
        if let Some(stage) = report.aborted_at {
            println!("  ABORTED at stage {stage}");
        }
        for (name, test) in &report.tests {
            for (iteration, result) in test.iterations.iter().enumerate() {
                let summary = &result.summary;
                println!(
                    "  {name} #{iteration}: {} requests, {} errors, {:.1} req/s over {}",
                    summary.total_requests,
                    summary.total_errors,
                    summary.requests_per_second,
                    humantime::format_duration(Duration::from_millis(
                        summary.duration.as_millis() as u64
                    ))
                );
                for (operation, stats) in &summary.operations {
                    println!(
                        "    {operation:<32} {:>10} req  {:>8.1} req/s  mean {:>10?}  max {:>10?}",
                        stats.requests, stats.throughput, stats.mean, stats.max
                    );
                }
            }
        }
    }
    println!("{}", "=".repeat(70));
}

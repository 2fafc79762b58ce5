//! amgrid-sim — run a container allocator against a simulated resource manager.
//!
//! # Usage
//!
//! ```text
//! amgrid-sim run --any 4 --host node-1=2 --rack /default-rack=1 --ticks 10
//! amgrid-sim run --config allocator.toml --grants-per-tick 2 --json
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use amgrid_allocate::{
    AllocationRequestData, AllocatorListener, ContainerAllocator, HeartbeatOutcome,
};
use amgrid_core::{AllocatorConfig, Container, ContainerStatus};
use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod sim;

use sim::{SimStats, SimulatedResourceManager, Topology};

const DEFAULT_FILTER: &str = "info,amgrid=debug";

#[derive(Parser)]
#[command(
    name = "amgrid-sim",
    about = "Drive a container allocator against a simulated resource manager",
    version
)]
struct Cli {
    /// Emit logs and the summary as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit containers to the default group and run heartbeats.
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Allocator config file (TOML).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of heartbeats to run.
    #[arg(long, default_value = "10")]
    ticks: u32,

    /// Containers to request anywhere.
    #[arg(long, default_value = "0")]
    any: u32,

    /// Containers to request on a host.
    #[arg(long = "host", value_name = "HOST=N", value_parser = parse_named_count)]
    hosts: Vec<(String, u32)>,

    /// Containers to request on a rack.
    #[arg(long = "rack", value_name = "RACK=N", value_parser = parse_named_count)]
    racks: Vec<(String, u32)>,

    /// Most containers the resource manager grants per heartbeat.
    #[arg(long, default_value = "4")]
    grants_per_tick: usize,

    /// Heartbeats a granted container runs before completing.
    #[arg(long, default_value = "3")]
    complete_after: u64,
}

fn parse_named_count(s: &str) -> Result<(String, u32), String> {
    let (name, count) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=N, got {s:?}"))?;
    let count = count
        .trim()
        .parse()
        .map_err(|e| format!("invalid count in {s:?}: {e}"))?;
    Ok((name.trim().to_string(), count))
}

#[derive(Default)]
struct Tally {
    allocated: AtomicUsize,
    completed: AtomicUsize,
}

impl AllocatorListener for Tally {
    fn allocated(&self, containers: &[Container]) {
        for container in containers {
            info!(container = %container.id, host = %container.host, "container allocated");
        }
        self.allocated.fetch_add(containers.len(), Ordering::Relaxed);
    }

    fn completed(&self, statuses: &[ContainerStatus]) {
        self.completed.fetch_add(statuses.len(), Ordering::Relaxed);
    }
}

#[derive(Debug, Serialize)]
struct Summary {
    ticks: u32,
    requested: u64,
    allocated: usize,
    completed: usize,
    garbage_released: usize,
    failed_heartbeats: usize,
    running: usize,
    resource_manager: SimStats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    if cli.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    match cli.command {
        Command::Run(args) => {
            let summary = run(args).await?;
            print_summary(&summary, cli.json)
        }
    }
}

async fn run(args: RunArgs) -> anyhow::Result<Summary> {
    let config = match &args.config {
        Some(path) => AllocatorConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => AllocatorConfig::default(),
    };

    let topology = Topology::from_config(
        &config.racks,
        args.hosts.iter().map(|(host, _)| host.clone()),
    );
    info!(hosts = topology.hosts().len(), "simulated cluster ready");

    let rm = Arc::new(SimulatedResourceManager::new(
        topology,
        args.grants_per_tick,
        args.complete_after,
    ));
    let allocator = ContainerAllocator::from_config(rm.clone(), &config)?;
    let tally = Arc::new(Tally::default());
    allocator.add_listener(tally.clone());

    let mut request = AllocationRequestData::new().with_any(args.any);
    for (host, count) in &args.hosts {
        request.add_host(host.clone(), *count);
    }
    for (rack, count) in &args.racks {
        request.add_rack(rack.clone(), *count);
    }
    let requested = request.validate()?.total();
    allocator.allocate(request)?;
    info!(requested, ticks = args.ticks, "starting simulation");

    let mut garbage = 0;
    let mut failed = 0;
    for _ in 0..args.ticks {
        let completed = tally.completed.load(Ordering::Relaxed) as f32;
        allocator.set_progress(if requested == 0 {
            1.0
        } else {
            completed / requested as f32
        });

        match allocator.heartbeat().await {
            HeartbeatOutcome::Completed(summary) => garbage += summary.garbage,
            HeartbeatOutcome::Failed => failed += 1,
        }
    }

    Ok(Summary {
        ticks: args.ticks,
        requested,
        allocated: tally.allocated.load(Ordering::Relaxed),
        completed: tally.completed.load(Ordering::Relaxed),
        garbage_released: garbage,
        failed_heartbeats: failed,
        running: rm.running(),
        resource_manager: rm.stats(),
    })
}

fn print_summary(summary: &Summary, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    println!("Simulation finished after {} heartbeats", summary.ticks);
    println!("  requested:          {}", summary.requested);
    println!("  allocated:          {}", summary.allocated);
    println!("  completed:          {}", summary.completed);
    println!("  garbage released:   {}", summary.garbage_released);
    println!("  failed heartbeats:  {}", summary.failed_heartbeats);
    println!("  still running:      {}", summary.running);
    println!(
        "  resource manager:   {} granted, {} completed, {} released",
        summary.resource_manager.granted,
        summary.resource_manager.completed,
        summary.resource_manager.released
    );
    Ok(())
}

//! arc-speed CLI - batch runs, synthetic benchmarks and the network roles
//!
//! Usage:
//!   arc-speed run --stops <csv> --datagrams <csv> [--tasks N] [--worker URL]...
//!   arc-speed generate --stops <csv> [--count N] [--tasks N] [--worker URL]...
//!   arc-speed worker [--port P] [--master URL]
//!   arc-speed master [--port P] [--stops <csv>]
//!
//! `run` and `generate` act as an in-process master; remote workers given
//! with `--worker` receive tasks round-robin and fall back to local
//! computation when they fail.

use std::fs::OpenOptions;
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_speed::remote::{master_router, probe_workers, register_with_master, serve, worker_router};
use arc_speed::synthetic::SyntheticBatch;
use arc_speed::{ingest, EngineConfig, GlobalResult, HttpWorker, LocalWorker, SpeedEngine, StopId};
use clap::{Parser, Subcommand};
use log::{info, warn};

#[derive(Parser)]
#[command(name = "arc-speed")]
#[command(about = "Distributed per-arc bus speed inference", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON engine configuration (missing keys use defaults)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect arcs in a datagram file and compute speeds
    Run {
        /// Stop CSV file
        #[arg(long)]
        stops: PathBuf,

        /// Datagram CSV file
        #[arg(long)]
        datagrams: PathBuf,

        /// Number of tasks to split the batch into
        #[arg(short, long, default_value = "4")]
        tasks: usize,

        /// Read at most this many datagram lines (0 = all)
        #[arg(long, default_value = "0")]
        max_count: usize,

        /// Remote worker base URL (repeatable)
        #[arg(short, long)]
        worker: Vec<String>,

        /// Append a result row to this CSV file
        #[arg(long)]
        results_csv: Option<PathBuf>,

        /// Also benchmark these arcs, as FROM:TO (repeatable)
        #[arg(long, value_parser = parse_arc)]
        arc: Vec<(StopId, StopId)>,
    },

    /// Process a batch of generated arc crossings
    Generate {
        /// Stop CSV file
        #[arg(long)]
        stops: PathBuf,

        /// Number of crossings to generate
        #[arg(short = 'n', long, default_value = "100000")]
        count: usize,

        /// RNG seed
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Number of tasks to split the batch into
        #[arg(short, long, default_value = "4")]
        tasks: usize,

        /// Remote worker base URL (repeatable)
        #[arg(short, long)]
        worker: Vec<String>,

        /// Append a result row to this CSV file
        #[arg(long)]
        results_csv: Option<PathBuf>,
    },

    /// Serve tasks for a master
    Worker {
        #[arg(short, long, default_value = "7001")]
        port: u16,

        /// Master base URL to register with on startup
        #[arg(long)]
        master: Option<String>,

        /// URL the master should use to reach this worker
        #[arg(long)]
        advertise: Option<String>,
    },

    /// Serve the master endpoint
    Master {
        #[arg(short, long, default_value = "7000")]
        port: u16,

        /// Stop CSV file to load on startup
        #[arg(long)]
        stops: Option<PathBuf>,
    },
}

fn parse_arc(raw: &str) -> Result<(StopId, StopId), String> {
    let (from, to) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected FROM:TO, got '{}'", raw))?;
    let from = from.trim().parse().map_err(|e| format!("bad stop id '{}': {}", from, e))?;
    let to = to.trim().parse().map_err(|e| format!("bad stop id '{}': {}", to, e))?;
    Ok((from, to))
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| writeln!(buf, "[{:5}] {}", record.level(), record.args()))
        .init();

    let cli = Cli::parse();

    let outcome = load_config(cli.config.as_deref()).and_then(|config| match cli.command {
        Commands::Run {
            stops,
            datagrams,
            tasks,
            max_count,
            worker,
            results_csv,
            arc,
        } => run_file(
            config,
            &stops,
            &datagrams,
            tasks,
            max_count,
            &worker,
            results_csv.as_deref(),
            &arc,
        ),
        Commands::Generate {
            stops,
            count,
            seed,
            tasks,
            worker,
            results_csv,
        } => run_generated(config, &stops, count, seed, tasks, &worker, results_csv.as_deref()),
        Commands::Worker {
            port,
            master,
            advertise,
        } => run_worker(config, port, master, advertise),
        Commands::Master { port, stops } => run_master(config, port, stops.as_deref()),
    });

    if let Err(e) = outcome {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn load_config(path: Option<&Path>) -> arc_speed::Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::from_json_file(path),
        None => Ok(EngineConfig::default()),
    }
}

/// Build an engine with stops loaded and remote workers registered.
fn build_engine(config: EngineConfig, stops: &Path, workers: &[String]) -> arc_speed::Result<SpeedEngine> {
    let timeout = Duration::from_secs(config.remote_timeout_secs);
    let engine = SpeedEngine::new(config)?;
    engine.set_stops(&ingest::load_stops(stops)?);

    let proxies = workers
        .iter()
        .map(|url| HttpWorker::new(url, timeout))
        .collect::<arc_speed::Result<Vec<_>>>()?;

    if !proxies.is_empty() {
        // Probe on a throwaway runtime; dispatch later happens off-runtime.
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| arc_speed::EngineError::ThreadPool(e.to_string()))?;
        let healthy = rt.block_on(probe_workers(&proxies));
        for (proxy, ok) in proxies.iter().zip(healthy) {
            if !ok {
                warn!("Worker {} is not answering; its tasks will run locally", proxy.url());
            }
        }
    }
    for proxy in proxies {
        engine.register_worker(Arc::new(proxy));
    }

    Ok(engine)
}

#[allow(clippy::too_many_arguments)]
fn run_file(
    config: EngineConfig,
    stops: &Path,
    datagrams: &Path,
    tasks: usize,
    max_count: usize,
    workers: &[String],
    results_csv: Option<&Path>,
    arcs: &[(StopId, StopId)],
) -> arc_speed::Result<()> {
    let engine = build_engine(config, stops, workers)?;
    let max_count = (max_count > 0).then_some(max_count);
    let result = engine.calculate_average_speed(datagrams, max_count, tasks)?;
    print_result(&result);

    if !arcs.is_empty() {
        let pings = ingest::load_datagrams(datagrams, max_count)?;
        println!("\nPer-arc benchmark:");
        for bench in engine.benchmark_arcs(&pings, arcs)? {
            println!(
                "  {:>6} -> {:<6} {:>8.2} km/h ({} trips)",
                bench.from_stop_id, bench.to_stop_id, bench.avg_speed_kmh, bench.trips
            );
        }
    }

    if let Some(path) = results_csv {
        append_result_row(path, &result)?;
    }
    Ok(())
}

fn run_generated(
    config: EngineConfig,
    stops: &Path,
    count: usize,
    seed: u64,
    tasks: usize,
    workers: &[String],
    results_csv: Option<&Path>,
) -> arc_speed::Result<()> {
    let engine = build_engine(config, stops, workers)?;

    let start = Instant::now();
    let events = SyntheticBatch {
        count,
        seed,
        base_timestamp_ms: chrono::Utc::now().timestamp_millis(),
    }
    .generate(&engine.stops()?);
    info!("Generated {} crossings in {:?}", events.len(), start.elapsed());

    let result = engine.process_datagrams(events, tasks);
    print_result(&result);

    if let Some(path) = results_csv {
        append_result_row(path, &result)?;
    }
    Ok(())
}

fn run_worker(config: EngineConfig, port: u16, master: Option<String>, advertise: Option<String>) -> arc_speed::Result<()> {
    let rt = tokio::runtime::Runtime::new().map_err(|e| arc_speed::EngineError::ThreadPool(e.to_string()))?;
    let worker = Arc::new(LocalWorker::new(config.quality.max_speed_kmh));
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let self_url = advertise.unwrap_or_else(|| format!("http://127.0.0.1:{}", port));
    let timeout = Duration::from_secs(config.remote_timeout_secs);

    rt.block_on(async move {
        let server = tokio::spawn(serve(worker_router(worker), addr));
        if let Some(master) = master {
            register_with_master(&master, &self_url, timeout).await?;
        }
        server
            .await
            .map_err(|e| arc_speed::EngineError::ThreadPool(e.to_string()))?
    })
}

fn run_master(config: EngineConfig, port: u16, stops: Option<&Path>) -> arc_speed::Result<()> {
    let engine = Arc::new(SpeedEngine::new(config)?);
    if let Some(path) = stops {
        engine.set_stops(&ingest::load_stops(path)?);
    }

    let rt = tokio::runtime::Runtime::new().map_err(|e| arc_speed::EngineError::ThreadPool(e.to_string()))?;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    rt.block_on(serve(master_router(engine), addr))
}

fn print_result(result: &GlobalResult) {
    println!("\n{}", "=".repeat(60));
    println!("RESULT");
    println!("{}", "=".repeat(60));
    println!("  Events:            {}", result.total_events);
    println!("  Unique arcs:       {}", result.total_unique_arcs);
    println!("  Tasks:             {}", result.task_count);
    println!("  Pool threads:      {}", result.worker_count);
    println!("  Remote workers:    {}", result.active_workers);
    println!("  Fallback tasks:    {}", result.fallback_tasks);
    println!("  Avg speed:         {:.2} km/h", result.global_avg_speed_kmh);
    println!("  Load:              {} ms", result.load_time_ms);
    println!("  Separation:        {} ms", result.separation_time_ms);
    println!("  Distribution:      {} ms", result.distribution_time_ms);
    println!("  Consolidation:     {} ms", result.consolidation_time_ms);
    println!("  Total processing:  {} ms", result.total_processing_time_ms);
    println!("  Throughput:        {:.0} events/s", result.throughput_eps());
}

const RESULTS_HEADER: &str = "timestamp,datagram_count,workers,total_time_ms,load_time_ms,separation_time_ms,distribution_time_ms,consolidation_time_ms,avg_speed_kmh,throughput_dps,total_arcs,tasks";

fn append_result_row(path: &Path, result: &GlobalResult) -> arc_speed::Result<()> {
    let io_err = |e| arc_speed::EngineError::io(path, e);
    let is_new = !path.exists();
    let mut file = OpenOptions::new().create(true).append(true).open(path).map_err(io_err)?;

    if is_new {
        writeln!(file, "{}", RESULTS_HEADER).map_err(io_err)?;
    }
    writeln!(
        file,
        "{},{},{},{},{},{},{},{},{:.4},{:.2},{},{}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        result.total_events,
        result.active_workers,
        result.total_processing_time_ms,
        result.load_time_ms,
        result.separation_time_ms,
        result.distribution_time_ms,
        result.consolidation_time_ms,
        result.global_avg_speed_kmh,
        result.throughput_eps(),
        result.total_unique_arcs,
        result.task_count
    )
    .map_err(io_err)?;

    info!("Appended result row to {}", path.display());
    Ok(())
}

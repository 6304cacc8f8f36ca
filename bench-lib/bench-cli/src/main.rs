use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, bail};
use bench_lib::{
    BenchConfig, BenchMode, BenchResult, Device, GpuId, Interconnect, SegmentId,
    ServerControl, ServerOpts, ShmFabric, TransferListBuilder, run_benchmark, serve,
};
use clap::{Args, Parser, Subcommand};
use tracing::info;

#[derive(Parser)]
#[command(name = "segbench", about = "Interconnect segment transfer benchmark")]
struct Cli {
    #[command(flatten)]
    logging: logging_lib::LoggingOpts,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Expose a receive segment and block until interrupted.
    Serve(ServeOpts),
    /// Run the benchmark client against a served segment.
    Bench(BenchOpts),
    /// Run a server thread and the client in one process.
    Loopback(BenchOpts),
}

#[derive(Args)]
struct ServeOpts {
    /// Interconnect adapter number.
    #[arg(long, default_value_t = 0)]
    adapter: u32,

    /// Id of the segment to publish.
    #[arg(long)]
    segment_id: u32,

    /// Segment size in bytes.
    #[arg(long)]
    size: usize,

    /// Put the receive buffer on this GPU instead of host memory.
    #[arg(long)]
    gpu: Option<u8>,
}

#[derive(Args)]
struct BenchOpts {
    /// Interconnect adapter number.
    #[arg(long, default_value_t = 0)]
    adapter: u32,

    /// Id of the server's segment.
    #[arg(long)]
    segment_id: u32,

    /// Id for the client's local segment. Defaults to the server's id + 1.
    #[arg(long)]
    local_segment_id: Option<u32>,

    /// Segment size in bytes.
    #[arg(long)]
    size: usize,

    /// Transfer strategy to benchmark.
    #[arg(long, default_value_t = BenchMode::DmaPush)]
    mode: BenchMode,

    /// Number of repetitions.
    #[arg(long, default_value_t = 10)]
    runs: usize,

    /// Split the transfer into this many scatter/gather entries.
    #[arg(long)]
    split: Option<usize>,

    /// Put the local buffer on this GPU instead of host memory.
    #[arg(long)]
    gpu: Option<u8>,

    /// Print the result as JSON instead of a text report.
    #[arg(long)]
    json: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging_lib::init(&cli.logging)?;
    match cli.command {
        Command::Serve(opts) => cmd_serve(opts),
        Command::Bench(opts) => cmd_bench(opts),
        Command::Loopback(opts) => cmd_loopback(opts),
    }
}

fn device_of(gpu: Option<u8>) -> Device {
    match gpu {
        Some(id) => Device::Gpu(GpuId(id)),
        None => Device::Host,
    }
}

fn cmd_serve(opts: ServeOpts) -> anyhow::Result<()> {
    let io: Arc<dyn Interconnect> = ShmFabric::open()?;
    let control = ServerControl::new();
    let server_opts = ServerOpts {
        adapter: opts.adapter,
        device: device_of(opts.gpu),
        segment_id: SegmentId(opts.segment_id),
        segment_size: opts.size,
    };

    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    let server = {
        let io = io.clone();
        let control = control.clone();
        thread::Builder::new()
            .name("segbench-server".to_string())
            .spawn(move || {
                let result = serve(io, None, &server_opts, &control);
                let _ = done_tx.send(());
                result
            })
            .context("spawning server thread")?
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building signal runtime")?;
    runtime.block_on(async {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => signal.context("waiting for shutdown signal"),
            _ = done_rx => Ok(()),
        }
    })?;
    control.stop();

    server
        .join()
        .map_err(|_| anyhow::anyhow!("server thread panicked"))?
        .context("server failed")
}

fn cmd_bench(opts: BenchOpts) -> anyhow::Result<()> {
    let io: Arc<dyn Interconnect> = ShmFabric::open()?;
    run_client(io, &opts)
}

fn cmd_loopback(opts: BenchOpts) -> anyhow::Result<()> {
    if opts.gpu.is_some() {
        bail!("loopback mode only supports host buffers");
    }
    let io: Arc<dyn Interconnect> = ShmFabric::open()?;
    let control = ServerControl::new();
    let server_opts = ServerOpts {
        adapter: opts.adapter,
        device: Device::Host,
        segment_id: SegmentId(opts.segment_id),
        segment_size: opts.size,
    };

    let server = {
        let io = io.clone();
        let control = control.clone();
        thread::Builder::new()
            .name("segbench-server".to_string())
            .spawn(move || serve(io, None, &server_opts, &control))
            .context("spawning server thread")?
    };
    wait_for_segment(&io, opts.adapter, SegmentId(opts.segment_id))?;

    let result = run_client(io, &opts);

    control.stop();
    server
        .join()
        .map_err(|_| anyhow::anyhow!("server thread panicked"))?
        .context("server failed")?;
    result
}

/// Poll until the server publishes its segment.
fn wait_for_segment(
    io: &Arc<dyn Interconnect>,
    adapter: u32,
    id: SegmentId,
) -> anyhow::Result<()> {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match io.connect_segment(adapter, id) {
            Ok(remote) => {
                io.disconnect_segment(remote)?;
                return Ok(());
            }
            Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(1)),
            Err(error) => {
                return Err(error).context("server segment never became available");
            }
        }
    }
}

fn run_client(io: Arc<dyn Interconnect>, opts: &BenchOpts) -> anyhow::Result<()> {
    let local_id = opts.local_segment_id.unwrap_or(opts.segment_id + 1);
    let mut builder = TransferListBuilder::new(
        io,
        opts.adapter,
        SegmentId(local_id),
        SegmentId(opts.segment_id),
        opts.size,
    )
    .device(device_of(opts.gpu));
    if let Some(chunks) = opts.split {
        builder = builder.split(chunks);
    }
    let list = builder.build().context("building transfer list")?;

    let config = BenchConfig { mode: opts.mode, runs: opts.runs, list };
    let result = run_benchmark(&config).context("running benchmark")?;
    report(opts.mode, &result, opts.json)?;

    if result.success_count == 0 {
        bail!("benchmark failed: no successful repetitions");
    }
    if !result.buffer_matches {
        bail!("local and remote buffers differ after transfer");
    }
    info!("Benchmark finished");
    Ok(())
}

fn report(mode: BenchMode, result: &BenchResult, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    println!("Benchmark: {mode}");
    println!(
        "  runs: {}  ok: {}  buffer match: {}",
        result.run_times_us.len(),
        result.success_count,
        if result.buffer_matches { "yes" } else { "no" },
    );
    println!(
        "  total: {} bytes in {} µs ({:.2} MB/s)",
        result.total_bytes,
        result.total_runtime_us,
        result.throughput_mbps(),
    );

    let runs = result.run_times_us.len().max(1) as u64;
    let bytes_per_run = result.total_bytes / runs;
    let throughputs: Vec<f64> = result
        .run_times_us
        .iter()
        .filter(|&&us| us > 0)
        .map(|&us| bytes_per_run as f64 / us as f64)
        .collect();
    let (n, avg, std) = avg_std(&throughputs);
    if n > 0 {
        println!("  per-run: {avg:.2} ± {std:.2} MB/s over {n} successful runs");
    }
    Ok(())
}

fn avg_std(list: &[f64]) -> (usize, f64, f64) {
    let n = list.len();
    if n == 0 {
        return (0, 0.0, 0.0);
    }
    let mean = list.iter().sum::<f64>() / n as f64;
    let variance = list.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64;
    (n, mean, variance.sqrt())
}

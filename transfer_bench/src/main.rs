//! Point-to-point read throughput benchmark.
//!
//! Run one process per host:
//!
//! ```text
//! transfer_bench --mode target    --initiator-addr <initiator host>
//! transfer_bench --mode initiator --target-addr <target host>
//! ```
//!
//! The target fills its buffer with `i % 128` and waits for the termination message.
//! The initiator reads `batch_size` blocks of `block_size` bytes in a loop for
//! `duration` seconds, reports throughput and latency, then checks the first batch
//! byte for byte.
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use clap::ValueEnum;
use transfer_engine::Assignment;
use transfer_engine::CompletionStatus;
use transfer_engine::LinkType;
use transfer_engine::RdmaContextConfig;
use transfer_engine::RdmaScheduler;
use transfer_engine::SchedulerConfig;
use transfer_engine::TcpChannelConfig;
use transfer_engine::TcpControlChannel;
use transfer_engine::initialize_logging;
use transfer_engine::send_terminate;
use transfer_engine::wait_remote_terminate;

const BUFFER_KEY: &str = "buffer";

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Issues reads and reports results
    Initiator,
    /// Serves its buffer until the initiator terminates
    Target,
}

#[derive(Parser, Debug)]
#[command(name = "transfer_bench")]
#[command(about = "RDMA read throughput benchmark")]
struct Args {
    #[arg(long, value_enum)]
    mode: Mode,

    /// RDMA device name; every device on the host when unset
    #[arg(long)]
    device_name: Option<String>,

    /// RDMA port number
    #[arg(long, default_value = "1")]
    ib_port: u8,

    /// Link layer: IB or RoCE
    #[arg(long, default_value = "RoCE")]
    link_type: LinkType,

    #[arg(long, default_value = "127.0.0.1")]
    target_addr: String,

    #[arg(long, default_value = "23344")]
    target_port: u16,

    #[arg(long, default_value = "127.0.0.1")]
    initiator_addr: String,

    #[arg(long, default_value = "24433")]
    initiator_port: u16,

    /// Total size of the registered buffer in bytes
    #[arg(long, default_value = "327680001")]
    buffer_size: usize,

    /// Bytes per block
    #[arg(long, default_value = "2048000")]
    block_size: usize,

    /// Blocks per submitted batch
    #[arg(long, default_value = "160")]
    batch_size: usize,

    /// Run duration in seconds
    #[arg(long, default_value = "10")]
    duration: u64,

    /// Largest single memory registration in bytes
    #[arg(long, env = "TRANSFER_MAX_REGION_SIZE", default_value = "1073741824")]
    max_region_size: usize,
}

impl Args {
    fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            devices: self.device_name.iter().cloned().collect(),
            link_type: self.link_type,
            max_region_size: self.max_region_size,
            context: RdmaContextConfig {
                port_num: self.ib_port,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn channel_config(&self) -> TcpChannelConfig {
        let (local_port, remote_addr, remote_port) = match self.mode {
            Mode::Target => (
                self.target_port,
                self.initiator_addr.clone(),
                self.initiator_port,
            ),
            Mode::Initiator => (
                self.initiator_port,
                self.target_addr.clone(),
                self.target_port,
            ),
        };
        TcpChannelConfig {
            local_port,
            remote_addr,
            remote_port,
            ..Default::default()
        }
    }
}

struct Report {
    trips: u64,
    bytes: u64,
    elapsed: Duration,
}

impl Report {
    fn print(&self, args: &Args) {
        let seconds = self.elapsed.as_secs_f64();
        let average_latency_ms = if self.trips == 0 {
            0.0
        } else {
            seconds * 1000.0 / self.trips as f64
        };
        println!("Batch size        : {}", args.batch_size);
        println!("Block size        : {}", args.block_size);
        println!("Total trips       : {}", self.trips);
        println!("Total transferred : {} MiB", self.bytes >> 20);
        println!("Duration          : {:.3} seconds", seconds);
        println!("Average latency   : {:.3} ms/trip", average_latency_ms);
        println!(
            "Throughput        : {:.2} MiB/s",
            self.bytes as f64 / seconds / (1u64 << 20) as f64
        );
    }
}

fn target(args: &Args) -> Result<()> {
    let mut data: Vec<u8> = (0..args.buffer_size).map(|i| (i % 128) as u8).collect();

    let mut scheduler = RdmaScheduler::new(args.scheduler_config())?;
    scheduler.register_memory_region(BUFFER_KEY, data.as_mut_ptr() as usize, data.len())?;
    tracing::info!("target registered {} bytes", data.len());

    let mut channel = TcpControlChannel::connect(&args.channel_config())?;
    scheduler.connect_remote_node(&mut channel)?;
    tracing::info!("target connected to {}", args.initiator_addr);

    wait_remote_terminate(&mut channel)?;
    scheduler.stop()?;
    Ok(())
}

fn initiator(args: &Args) -> Result<()> {
    let mut data = vec![0u8; args.buffer_size];

    let mut scheduler = RdmaScheduler::new(args.scheduler_config())?;
    scheduler.register_memory_region(BUFFER_KEY, data.as_mut_ptr() as usize, data.len())?;
    tracing::info!("initiator registered {} bytes", data.len());

    let mut channel = TcpControlChannel::connect(&args.channel_config())?;
    scheduler.connect_remote_node(&mut channel)?;
    tracing::info!("initiator connected to {}", args.target_addr);

    let offsets: Vec<usize> = (0..args.batch_size)
        .map(|i| i * args.block_size)
        .collect();
    let mut report = Report {
        trips: 0,
        bytes: 0,
        elapsed: Duration::ZERO,
    };
    let start = Instant::now();
    let deadline = start + Duration::from_secs(args.duration);
    while Instant::now() < deadline {
        let assignment = Assignment::read(
            BUFFER_KEY,
            offsets.clone(),
            offsets.clone(),
            args.block_size,
        );
        let handle = scheduler.submit(assignment, Box::new(|_: CompletionStatus| {}))?;
        tracing::debug!("{}", handle);
        let status = handle.wait();
        anyhow::ensure!(status.is_success(), "trip {} failed: {}", report.trips, status);

        report.trips += 1;
        report.bytes += (args.batch_size * args.block_size) as u64;
    }
    report.elapsed = start.elapsed();
    report.print(args);

    send_terminate(&mut channel)?;
    scheduler.stop()?;

    let checked = args.batch_size * args.block_size;
    if let Some(i) = (0..checked).find(|&i| data[i] != (i % 128) as u8) {
        anyhow::bail!("transferred data differs at byte {}", i);
    }
    println!("Verified first {} bytes", checked);
    Ok(())
}

fn main() -> Result<()> {
    initialize_logging();
    let args = Args::parse();
    anyhow::ensure!(
        args.buffer_size >= args.batch_size * args.block_size,
        "buffer_size {} is smaller than batch_size x block_size",
        args.buffer_size
    );

    match args.mode {
        Mode::Target => target(&args).context("target failed"),
        Mode::Initiator => initiator(&args).context("initiator failed"),
    }
}

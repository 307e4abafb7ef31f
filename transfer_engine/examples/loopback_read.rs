//! Reads a patterned buffer between two schedulers on the same host.
//!
//! Both sides open every local device, register a buffer large enough to be sliced
//! across contexts, swap handshake payloads over an in-process control channel and
//! the initiator then reads the whole target buffer in fixed-size blocks.
//!
//! Requires an RDMA capable NIC (or a soft-RoCE device).
use std::thread;
use std::time::Duration;
use std::time::Instant;

use anyhow::Result;
use transfer_engine::Assignment;
use transfer_engine::CompletionStatus;
use transfer_engine::LinkType;
use transfer_engine::LocalControlChannel;
use transfer_engine::RdmaScheduler;
use transfer_engine::SchedulerConfig;
use transfer_engine::get_all_devices;
use transfer_engine::initialize_logging;
use transfer_engine::send_terminate;
use transfer_engine::wait_remote_terminate;

const BUFFER_SIZE: usize = 64 << 20;
const BLOCK_SIZE: usize = 32768;
const MAX_REGION_SIZE: usize = 5 << 20;

fn config() -> Result<SchedulerConfig> {
    let link_type = std::env::var("RDMA_LINK_TYPE")
        .ok()
        .map(|link| link.parse::<LinkType>().map_err(anyhow::Error::msg))
        .transpose()?
        .unwrap_or_default();
    Ok(SchedulerConfig {
        link_type,
        max_region_size: MAX_REGION_SIZE,
        ..Default::default()
    })
}

fn main() -> Result<()> {
    initialize_logging();
    for device in get_all_devices() {
        println!("{device}");
    }

    let mut initiator_buffer = vec![0u8; BUFFER_SIZE];
    let mut target_buffer: Vec<u8> = (0..BUFFER_SIZE).map(|i| (i % 128) as u8).collect();

    let mut initiator = RdmaScheduler::new(config()?)?;
    let mut target = RdmaScheduler::new(config()?)?;
    let slices = initiator.register_memory_region(
        "buffer",
        initiator_buffer.as_mut_ptr() as usize,
        BUFFER_SIZE,
    )?;
    target.register_memory_region("buffer", target_buffer.as_mut_ptr() as usize, BUFFER_SIZE)?;
    println!(
        "buffer registered as {} slices over {} contexts",
        slices,
        initiator.contexts().len()
    );

    let (mut initiator_channel, mut target_channel) = LocalControlChannel::pair();
    let elapsed = thread::scope(|scope| -> Result<Duration> {
        let target_side = scope.spawn(|| -> Result<()> {
            target.connect_remote_node(&mut target_channel)?;
            wait_remote_terminate(&mut target_channel)?;
            Ok(())
        });

        initiator.connect_remote_node(&mut initiator_channel)?;
        let offsets: Vec<usize> = (0..BUFFER_SIZE / BLOCK_SIZE)
            .map(|i| i * BLOCK_SIZE)
            .collect();
        let start = Instant::now();
        let handle = initiator.submit(
            Assignment::read("buffer", offsets.clone(), offsets, BLOCK_SIZE),
            Box::new(|status: CompletionStatus| println!("transfer finished: {status}")),
        )?;
        let status = handle.wait();
        let elapsed = start.elapsed();
        send_terminate(&mut initiator_channel)?;
        target_side
            .join()
            .map_err(|_| anyhow::anyhow!("target thread panicked"))??;
        anyhow::ensure!(status.is_success(), "transfer failed: {status}");
        Ok(elapsed)
    })?;

    initiator.stop()?;
    target.stop()?;

    anyhow::ensure!(
        initiator_buffer == target_buffer,
        "initiator buffer differs from target"
    );
    println!(
        "read {} MiB in {:?} ({:.2} GiB/s)",
        BUFFER_SIZE >> 20,
        elapsed,
        BUFFER_SIZE as f64 / elapsed.as_secs_f64() / (1u64 << 30) as f64
    );
    Ok(())
}

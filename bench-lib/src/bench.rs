//! Timed execution of a transfer strategy over a transfer list.

use std::{ffi::c_void, ptr::NonNull, time::Instant};

use tracing::{debug, error, info, warn};

use crate::{
    api::{BenchConfig, BenchMode, BenchResult, DmaFlags, DmaVecEntry, SmallVec},
    translist::{TransferEntry, TransferList, TransferListDesc},
    transport::MappedRegion,
    verify,
};

/// Drive the configured strategy `runs` times over the transfer list, then
/// run the verification handshake.
///
/// A failed repetition records a zero sample and the loop continues; an
/// unsupported strategy or a failed queue/mapping setup yields a result with
/// `success_count == 0` instead of an error. Only local-buffer failures
/// (device errors while filling) abort the invocation.
pub fn run_benchmark(config: &BenchConfig) -> crate::error::Result<BenchResult> {
    let list = &config.list;
    let desc = list.desc();

    let byte: u8 = rand::random();
    debug!(
        value = format_args!("{byte:02x}"),
        "Filling local buffer with random value"
    );
    desc.buffer().fill(byte)?;

    let mut samples = vec![0u64; config.runs];
    info!(mode = config.mode.name(), runs = config.runs, "Executing benchmark");
    let total_us = match config.mode {
        BenchMode::DmaPush => {
            dma_benchmark(desc, list, DmaFlags { pull: false, global: false }, &mut samples)
        }
        BenchMode::DmaPushGlobal => {
            dma_benchmark(desc, list, DmaFlags { pull: false, global: true }, &mut samples)
        }
        BenchMode::DmaPull => {
            dma_benchmark(desc, list, DmaFlags { pull: true, global: false }, &mut samples)
        }
        BenchMode::DmaPullGlobal => {
            dma_benchmark(desc, list, DmaFlags { pull: true, global: true }, &mut samples)
        }
        BenchMode::PioWrite => pio_benchmark(desc, list, PioOp::Write, &mut samples),
        BenchMode::PioCopyToRemote => {
            pio_benchmark(desc, list, PioOp::Copy { pull: false }, &mut samples)
        }
        BenchMode::PioCopyFromRemote => {
            pio_benchmark(desc, list, PioOp::Copy { pull: true }, &mut samples)
        }
        BenchMode::CopyToRemote => {
            pio_benchmark(desc, list, PioOp::Plain { pull: false }, &mut samples)
        }
        BenchMode::CopyFromRemote => {
            pio_benchmark(desc, list, PioOp::Plain { pull: true }, &mut samples)
        }
        BenchMode::DoNothing => {
            error!("No benchmarking operation is set");
            0
        }
        BenchMode::DataInterrupt => {
            error!(mode = config.mode.name(), "Benchmark mode is not supported");
            0
        }
    };

    info!("Benchmark complete, verifying transfer");
    verify::trigger_validation(desc, byte);
    let buffer_matches = match verify::compare_remote(desc) {
        Ok(true) => {
            debug!("Local and remote buffers are equal");
            true
        }
        Ok(false) => {
            warn!("Local and remote buffers differ");
            false
        }
        Err(error) => {
            error!(%error, "Failed to verify transfer");
            false
        }
    };

    let success_count = samples.iter().filter(|&&sample| sample != 0).count();
    Ok(BenchResult {
        success_count,
        buffer_matches,
        total_bytes: list.total_size() * config.runs as u64,
        total_runtime_us: total_us,
        run_times_us: samples,
    })
}

/// One repetition loop over the DMA queue. Returns the wall-clock runtime of
/// the whole loop in microseconds; per-repetition samples land in `samples`.
fn dma_benchmark(
    desc: &TransferListDesc,
    list: &TransferList,
    flags: DmaFlags,
    samples: &mut [u64],
) -> u64 {
    let io = desc.io();
    let queue = match io.create_dma_queue(desc.adapter()) {
        Ok(queue) => queue,
        Err(error) => {
            error!(%error, "Failed to create DMA queue");
            return 0;
        }
    };

    let vec: SmallVec<DmaVecEntry> = list
        .entries()
        .iter()
        .map(|entry| DmaVecEntry {
            local_offset: entry.local_offset as u64,
            remote_offset: entry.remote_offset as u64,
            size: entry.size as u64,
        })
        .collect();

    debug!(entries = vec.len(), runs = samples.len(), "Performing DMA transfers");
    let start = Instant::now();
    for sample in samples.iter_mut() {
        let before = Instant::now();
        let result = io.dma_transfer_vec(
            queue,
            desc.local_segment(),
            desc.remote_segment(),
            &vec,
            flags,
        );
        let elapsed = before.elapsed().as_micros() as u64;
        match result {
            // An elapsed time of zero would divide a throughput sample by
            // zero; it counts as a failed repetition.
            Ok(()) => *sample = elapsed,
            Err(error) => {
                error!(%error, "DMA transfer failed");
                *sample = 0;
            }
        }
    }
    let total = start.elapsed().as_micros() as u64;

    if let Err(error) = io.remove_dma_queue(queue) {
        warn!(%error, "Failed to remove DMA queue");
    }
    total
}

#[derive(Clone, Copy)]
enum PioOp {
    Write,
    Copy { pull: bool },
    Plain { pull: bool },
}

/// Programmed-I/O and plain-copy repetitions through a run-scoped mapping of
/// the remote segment. Same timing discipline as the DMA path.
fn pio_benchmark(
    desc: &TransferListDesc,
    list: &TransferList,
    op: PioOp,
    samples: &mut [u64],
) -> u64 {
    if !desc.device().is_host() {
        error!(
            device = %desc.device(),
            "Programmed I/O requires a host-resident local buffer"
        );
        return 0;
    }

    let io = desc.io();
    let map = match io.map_remote(desc.remote_segment()) {
        Ok(map) => map,
        Err(error) => {
            error!(%error, "Failed to map remote segment");
            return 0;
        }
    };

    let base = desc.buffer().ptr();
    debug!(entries = list.len(), runs = samples.len(), "Performing programmed transfers");
    let start = Instant::now();
    for sample in samples.iter_mut() {
        let before = Instant::now();
        let mut failed = false;
        for entry in list.entries() {
            let local = unsafe { base.byte_add(entry.local_offset) };
            let result = match op {
                PioOp::Write => io.pio_write(map.handle, entry.remote_offset, local, entry.size),
                PioOp::Copy { pull } => {
                    io.pio_copy(map.handle, entry.remote_offset, local, entry.size, pull)
                }
                PioOp::Plain { pull } => {
                    plain_copy(&map, entry, local, pull);
                    Ok(())
                }
            };
            if let Err(error) = result {
                error!(%error, "Programmed transfer failed");
                failed = true;
                break;
            }
        }
        let elapsed = before.elapsed().as_micros() as u64;
        *sample = if failed { 0 } else { elapsed };
    }
    let total = start.elapsed().as_micros() as u64;

    if let Err(error) = verify::unmap_retrying(io.as_ref(), map.handle) {
        warn!(%error, "Failed to unmap remote segment");
    }
    total
}

fn plain_copy(map: &MappedRegion, entry: &TransferEntry, local: NonNull<c_void>, pull: bool) {
    unsafe {
        let remote = map.ptr.byte_add(entry.remote_offset).as_ptr() as *mut u8;
        let local = local.as_ptr() as *mut u8;
        if pull {
            std::ptr::copy_nonoverlapping(remote, local, entry.size);
        } else {
            std::ptr::copy_nonoverlapping(local, remote, entry.size);
        }
    }
}

//! End-to-end benchmark runs over the shared-memory fabric: a server thread
//! and a client session in one process, talking only through segment files
//! and interrupt counters.

use std::{
    ffi::c_void,
    ptr::NonNull,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering::SeqCst},
    },
    thread,
    time::{Duration, Instant},
};

use tempfile::TempDir;

use crate::{
    api::{
        BenchConfig, BenchMode, ChannelId, DmaFlags, DmaQueueHandle, DmaVecEntry,
        InterruptHandle, LocalSegmentHandle, MapHandle, RemoteSegmentHandle, SegmentId,
    },
    device::{Device, GpuId, MockDeviceMemory},
    error::TransportError,
    run_benchmark, serve,
    server::{ServerControl, ServerOpts},
    shm::ShmFabric,
    translist::TransferListBuilder,
    transport::{
        Interconnect, InterruptCallback, MappedRegion, MockInterconnect,
        TransportResult,
    },
    verify,
};

const SEG_SIZE: usize = 1 << 20;

fn start_server(
    io: Arc<dyn Interconnect>,
    id: u32,
) -> (ServerControl, thread::JoinHandle<crate::Result<()>>) {
    let control = ServerControl::new();
    let opts = ServerOpts {
        adapter: 0,
        device: Device::Host,
        segment_id: SegmentId(id),
        segment_size: SEG_SIZE,
    };
    let handle = {
        let control = control.clone();
        thread::spawn(move || serve(io, None, &opts, &control))
    };
    (control, handle)
}

fn wait_published(io: &Arc<dyn Interconnect>, id: u32) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match io.connect_segment(0, SegmentId(id)) {
            Ok(remote) => {
                io.disconnect_segment(remote).unwrap();
                return;
            }
            Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(1)),
            Err(error) => panic!("server never published its segment: {error}"),
        }
    }
}

fn run_mode(
    io: &Arc<dyn Interconnect>,
    local_id: u32,
    remote_id: u32,
    mode: BenchMode,
    runs: usize,
) -> (BenchConfig, crate::api::BenchResult) {
    let list = TransferListBuilder::new(
        io.clone(),
        0,
        SegmentId(local_id),
        SegmentId(remote_id),
        SEG_SIZE,
    )
    .build()
    .unwrap();
    let config = BenchConfig { mode, runs, list };
    let result = run_benchmark(&config).unwrap();
    (config, result)
}

#[test]
fn dma_push_succeeds_and_replicates() {
    let dir = TempDir::new().unwrap();
    let io: Arc<dyn Interconnect> = ShmFabric::with_dir(dir.path()).unwrap();
    let (control, server) = start_server(io.clone(), 8);
    wait_published(&io, 8);

    let (config, result) = run_mode(&io, 9, 8, BenchMode::DmaPush, 5);
    assert_eq!(result.run_times_us.len(), 5);
    assert_eq!(result.success_count, 5);
    assert!(result.run_times_us.iter().all(|&us| us > 0));
    assert!(result.buffer_matches);
    assert_eq!(result.total_bytes, SEG_SIZE as u64 * 5);
    assert_eq!(config.list.total_size(), result.total_bytes / 5);

    // The triggered interrupt makes the server observe the pushed byte.
    let pushed = config.list.desc().buffer().first_byte().unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while control.last_observed_byte() != pushed {
        assert!(Instant::now() < deadline, "server never observed the transfer");
        thread::sleep(Duration::from_millis(1));
    }

    drop(config);
    control.stop();
    server.join().unwrap().unwrap();
}

#[test]
fn dma_pull_reads_remote_contents() {
    let dir = TempDir::new().unwrap();
    let io: Arc<dyn Interconnect> = ShmFabric::with_dir(dir.path()).unwrap();
    let (control, server) = start_server(io.clone(), 16);
    wait_published(&io, 16);

    let (config, result) = run_mode(&io, 17, 16, BenchMode::DmaPullGlobal, 3);
    assert_eq!(result.success_count, 3);
    assert!(result.buffer_matches);

    drop(config);
    control.stop();
    server.join().unwrap().unwrap();
}

#[test]
fn programmed_modes_replicate() {
    let dir = TempDir::new().unwrap();
    let io: Arc<dyn Interconnect> = ShmFabric::with_dir(dir.path()).unwrap();
    let (control, server) = start_server(io.clone(), 24);
    wait_published(&io, 24);

    for (i, mode) in [
        BenchMode::PioWrite,
        BenchMode::PioCopyToRemote,
        BenchMode::PioCopyFromRemote,
        BenchMode::CopyToRemote,
        BenchMode::CopyFromRemote,
    ]
    .into_iter()
    .enumerate()
    {
        let (config, result) = run_mode(&io, 25 + i as u32, 24, mode, 2);
        assert_eq!(result.success_count, 2, "mode {}", mode.name());
        assert!(result.buffer_matches, "mode {}", mode.name());
        drop(config);
    }

    control.stop();
    server.join().unwrap().unwrap();
}

#[test]
fn scatter_gather_lists_cover_the_segment() {
    let dir = TempDir::new().unwrap();
    let io: Arc<dyn Interconnect> = ShmFabric::with_dir(dir.path()).unwrap();
    let (control, server) = start_server(io.clone(), 32);
    wait_published(&io, 32);

    let list = TransferListBuilder::new(
        io.clone(),
        0,
        SegmentId(33),
        SegmentId(32),
        SEG_SIZE,
    )
    .split(7)
    .build()
    .unwrap();
    assert_eq!(list.len(), 7);
    assert_eq!(list.total_size(), SEG_SIZE as u64);

    let config = BenchConfig { mode: BenchMode::DmaPush, runs: 2, list };
    let result = run_benchmark(&config).unwrap();
    assert_eq!(result.success_count, 2);
    assert!(result.buffer_matches);
    assert_eq!(result.total_bytes, config.list.total_size() * 2);

    drop(config);
    control.stop();
    server.join().unwrap().unwrap();
}

/// Decorator fabric that injects a transport failure into the nth DMA call.
struct FlakyFabric {
    inner: Arc<dyn Interconnect>,
    fail_on: usize,
    calls: AtomicUsize,
}

impl Interconnect for FlakyFabric {
    fn alloc_segment(
        &self,
        adapter: u32,
        id: SegmentId,
        len: usize,
        device: Device,
    ) -> TransportResult<LocalSegmentHandle> {
        self.inner.alloc_segment(adapter, id, len, device)
    }

    fn segment_ptr(
        &self,
        segment: LocalSegmentHandle,
    ) -> TransportResult<NonNull<c_void>> {
        self.inner.segment_ptr(segment)
    }

    fn segment_len(&self, segment: LocalSegmentHandle) -> TransportResult<usize> {
        self.inner.segment_len(segment)
    }

    fn publish_segment(&self, segment: LocalSegmentHandle) -> TransportResult<()> {
        self.inner.publish_segment(segment)
    }

    fn unpublish_segment(&self, segment: LocalSegmentHandle) -> TransportResult<()> {
        self.inner.unpublish_segment(segment)
    }

    fn remove_segment(&self, segment: LocalSegmentHandle) -> TransportResult<()> {
        self.inner.remove_segment(segment)
    }

    fn connect_segment(
        &self,
        adapter: u32,
        id: SegmentId,
    ) -> TransportResult<RemoteSegmentHandle> {
        self.inner.connect_segment(adapter, id)
    }

    fn remote_len(&self, remote: RemoteSegmentHandle) -> TransportResult<usize> {
        self.inner.remote_len(remote)
    }

    fn disconnect_segment(&self, remote: RemoteSegmentHandle) -> TransportResult<()> {
        self.inner.disconnect_segment(remote)
    }

    fn map_remote(&self, remote: RemoteSegmentHandle) -> TransportResult<MappedRegion> {
        self.inner.map_remote(remote)
    }

    fn unmap_remote(&self, map: MapHandle) -> TransportResult<()> {
        self.inner.unmap_remote(map)
    }

    fn create_dma_queue(&self, adapter: u32) -> TransportResult<DmaQueueHandle> {
        self.inner.create_dma_queue(adapter)
    }

    fn remove_dma_queue(&self, queue: DmaQueueHandle) -> TransportResult<()> {
        self.inner.remove_dma_queue(queue)
    }

    fn dma_transfer_vec(
        &self,
        queue: DmaQueueHandle,
        local: LocalSegmentHandle,
        remote: RemoteSegmentHandle,
        entries: &[DmaVecEntry],
        flags: DmaFlags,
    ) -> TransportResult<()> {
        let call = self.calls.fetch_add(1, SeqCst) + 1;
        if call == self.fail_on {
            return Err(TransportError::Io { code: 5, context: "injected dma failure" });
        }
        self.inner.dma_transfer_vec(queue, local, remote, entries, flags)
    }

    fn pio_write(
        &self,
        map: MapHandle,
        remote_offset: usize,
        src: NonNull<c_void>,
        len: usize,
    ) -> TransportResult<()> {
        self.inner.pio_write(map, remote_offset, src, len)
    }

    fn pio_copy(
        &self,
        map: MapHandle,
        remote_offset: usize,
        local: NonNull<c_void>,
        len: usize,
        pull: bool,
    ) -> TransportResult<()> {
        self.inner.pio_copy(map, remote_offset, local, len, pull)
    }

    fn register_interrupt(
        &self,
        adapter: u32,
        channel: ChannelId,
        callback: InterruptCallback,
    ) -> TransportResult<InterruptHandle> {
        self.inner.register_interrupt(adapter, channel, callback)
    }

    fn remove_interrupt(&self, interrupt: InterruptHandle) -> TransportResult<()> {
        self.inner.remove_interrupt(interrupt)
    }

    fn trigger_interrupt(
        &self,
        adapter: u32,
        channel: ChannelId,
    ) -> TransportResult<()> {
        self.inner.trigger_interrupt(adapter, channel)
    }
}

#[test]
fn failed_repetition_records_zero_sample_and_continues() {
    let dir = TempDir::new().unwrap();
    let shm: Arc<dyn Interconnect> = ShmFabric::with_dir(dir.path()).unwrap();
    let (control, server) = start_server(shm.clone(), 40);
    wait_published(&shm, 40);

    let io: Arc<dyn Interconnect> = Arc::new(FlakyFabric {
        inner: shm.clone(),
        fail_on: 2,
        calls: AtomicUsize::new(0),
    });
    let (config, result) = run_mode(&io, 41, 40, BenchMode::DmaPush, 3);
    assert_eq!(result.success_count, 2);
    assert_eq!(result.run_times_us[1], 0);
    assert!(result.run_times_us[0] > 0);
    assert!(result.run_times_us[2] > 0);
    // The final repetition replicated the buffer.
    assert!(result.buffer_matches);

    drop(config);
    control.stop();
    server.join().unwrap().unwrap();
}

#[test]
fn missing_signal_channel_yields_mismatch_without_crash() {
    let dir = TempDir::new().unwrap();
    let io: Arc<dyn Interconnect> = ShmFabric::with_dir(dir.path()).unwrap();

    // A peer that published a segment but registered no interrupt channel,
    // filled with an alternating pattern no single fill byte can match.
    let seg = io.alloc_segment(0, SegmentId(50), SEG_SIZE, Device::Host).unwrap();
    let ptr = io.segment_ptr(seg).unwrap();
    let bytes =
        unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr() as *mut u8, SEG_SIZE) };
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = if i % 2 == 0 { 0xaa } else { 0x55 };
    }
    io.publish_segment(seg).unwrap();

    let (config, result) = run_mode(&io, 51, 50, BenchMode::DoNothing, 2);
    assert_eq!(result.success_count, 0);
    assert_eq!(result.run_times_us, vec![0, 0]);
    assert!(!result.buffer_matches);

    drop(config);
    io.remove_segment(seg).unwrap();
}

#[test]
fn verification_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let io: Arc<dyn Interconnect> = ShmFabric::with_dir(dir.path()).unwrap();
    let (control, server) = start_server(io.clone(), 60);
    wait_published(&io, 60);

    let (config, result) = run_mode(&io, 61, 60, BenchMode::DmaPush, 1);
    assert!(result.buffer_matches);
    assert!(verify::compare_remote(config.list.desc()).unwrap());
    assert!(verify::compare_remote(config.list.desc()).unwrap());

    drop(config);
    control.stop();
    server.join().unwrap().unwrap();
}

#[test]
fn repeated_stop_requests_tear_down_once() {
    let dir = TempDir::new().unwrap();
    let io: Arc<dyn Interconnect> = ShmFabric::with_dir(dir.path()).unwrap();
    let (control, server) = start_server(io.clone(), 70);
    wait_published(&io, 70);

    control.stop();
    control.stop();
    server.join().unwrap().unwrap();

    assert!(!dir.path().join("segbench-seg-0-70").exists());
    assert!(!dir.path().join("segbench-seg-0-70.avail").exists());
    assert!(!dir.path().join("segbench-irq-0-70").exists());

    // Stopping after teardown is equally a no-op.
    control.stop();
}

#[test]
fn failed_builds_release_their_segments() {
    let dir = TempDir::new().unwrap();
    let io: Arc<dyn Interconnect> = ShmFabric::with_dir(dir.path()).unwrap();
    let (control, server) = start_server(io.clone(), 80);
    wait_published(&io, 80);

    let invalid = TransferListBuilder::new(
        io.clone(),
        0,
        SegmentId(81),
        SegmentId(80),
        SEG_SIZE,
    )
    .entry(0, 0, 0)
    .build();
    assert!(matches!(invalid, Err(crate::BenchError::InvalidRange(_))));

    // The local segment id is free again after the failed build.
    let list = TransferListBuilder::new(
        io.clone(),
        0,
        SegmentId(81),
        SegmentId(80),
        SEG_SIZE,
    )
    .build()
    .unwrap();
    drop(list);

    control.stop();
    server.join().unwrap().unwrap();
}

#[test]
fn server_unwinds_when_interrupt_registration_fails() {
    let dir = TempDir::new().unwrap();
    let io: Arc<dyn Interconnect> = ShmFabric::with_dir(dir.path()).unwrap();

    // Occupy the channel the server will want.
    let irq = io.register_interrupt(0, ChannelId(90), Box::new(|_| {})).unwrap();

    let control = ServerControl::new();
    let opts = ServerOpts {
        adapter: 0,
        device: Device::Host,
        segment_id: SegmentId(90),
        segment_size: 4096,
    };
    let err = serve(io.clone(), None, &opts, &control).unwrap_err();
    assert!(matches!(
        err,
        crate::BenchError::Transport(TransportError::AlreadyExists(_))
    ));
    // The segment acquired before the failure was unwound.
    assert!(!dir.path().join("segbench-seg-0-90").exists());

    io.remove_interrupt(irq).unwrap();
}

#[test]
fn pio_with_gpu_buffer_reports_error_result() {
    let mut local = vec![0u8; 256];
    let local_addr = local.as_mut_ptr() as usize;
    let mut remote = vec![1u8; 256];
    let remote_addr = remote.as_mut_ptr() as usize;

    let mut io = MockInterconnect::new();
    io.expect_alloc_segment().returning(|_, _, _, _| Ok(LocalSegmentHandle(1)));
    io.expect_connect_segment().returning(|_, _| Ok(RemoteSegmentHandle(2)));
    io.expect_segment_len().returning(|_| Ok(256));
    io.expect_remote_len().returning(|_| Ok(256));
    io.expect_segment_ptr().returning(move |_| {
        Ok(NonNull::new(local_addr as *mut c_void).unwrap())
    });
    io.expect_trigger_interrupt().returning(|_, _| Ok(()));
    io.expect_map_remote().returning(move |_| {
        Ok(MappedRegion {
            handle: MapHandle(3),
            ptr: NonNull::new(remote_addr as *mut c_void).unwrap(),
            len: 256,
        })
    });
    io.expect_unmap_remote().returning(|_| Ok(()));
    io.expect_disconnect_segment().returning(|_| Ok(()));
    io.expect_remove_segment().returning(|_| Ok(()));

    let mut devmem = MockDeviceMemory::new();
    devmem.expect_fill().returning(|_, _, _, _| Ok(()));
    devmem.expect_compare().returning(|_, _, _, _| Ok(0));
    devmem.expect_copy_to_host().returning(|_, _, _, dst| {
        dst.fill(0);
        Ok(())
    });

    let io: Arc<dyn Interconnect> = Arc::new(io);
    let list = TransferListBuilder::new(io, 0, SegmentId(1), SegmentId(2), 256)
        .device(Device::Gpu(GpuId(0)))
        .device_memory(Arc::new(devmem))
        .build()
        .unwrap();

    let config = BenchConfig { mode: BenchMode::PioWrite, runs: 2, list };
    let result = run_benchmark(&config).unwrap();
    assert_eq!(result.success_count, 0);
    assert_eq!(result.run_times_us, vec![0, 0]);
    assert!(!result.buffer_matches);
}

//! File-backed shared-memory implementation of [`Interconnect`].
//!
//! Segments are plain files under `/dev/shm` (or the temp dir when that is
//! unavailable) mapped into every connected session; publication is a marker
//! file next to the data file. Interrupt channels are 8-byte counter words:
//! triggering increments the counter from any process, and a watcher thread
//! owned by the registering session turns increments into handler callbacks.
//!
//! Host segments only. GPU segments need a transport that can register
//! device memory with the interconnect adapter.

use std::{
    ffi::c_void,
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
    ptr::NonNull,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering::SeqCst},
    },
    thread::JoinHandle,
    time::Duration,
};

use dashmap::DashMap;
use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, warn};

use crate::{
    api::{
        ChannelId, DmaFlags, DmaQueueHandle, DmaVecEntry, InterruptHandle,
        LocalSegmentHandle, MapHandle, RemoteSegmentHandle, SegmentId,
    },
    device::Device,
    error::TransportError,
    transport::{
        Interconnect, InterruptCallback, InterruptEvent, MappedRegion, TransportResult,
    },
};

const WATCH_INTERVAL: Duration = Duration::from_micros(200);

struct LocalSeg {
    path: PathBuf,
    avail_path: PathBuf,
    ptr: usize,
    len: usize,
    _map: MmapMut,
}

impl LocalSeg {
    fn remove(&mut self) -> TransportResult<()> {
        if let Err(error) = fs::remove_file(&self.avail_path)
            && error.kind() != std::io::ErrorKind::NotFound
        {
            debug!(%error, "Failed to remove availability marker");
        }
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(ref error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(TransportError::from_io("remove segment file", &error)),
        }
    }
}

struct SharedMap {
    ptr: usize,
    len: usize,
    _map: MmapMut,
}

struct RemoteSeg {
    shared: Arc<SharedMap>,
}

struct IrqWatcher {
    path: PathBuf,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl IrqWatcher {
    fn shutdown(&mut self) -> TransportResult<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        self.stop.store(true, SeqCst);
        if thread.join().is_err() {
            warn!("Interrupt watcher thread panicked");
        }
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(ref error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(TransportError::from_io("remove interrupt file", &error)),
        }
    }
}

impl Drop for IrqWatcher {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// One session on the shared-memory fabric. Opening several sessions over
/// the same directory, in one process or many, yields peers that see each
/// other's published segments and interrupt channels.
pub struct ShmFabric {
    dir: PathBuf,
    next_handle: AtomicU64,
    locals: DashMap<u64, LocalSeg>,
    remotes: DashMap<u64, RemoteSeg>,
    maps: DashMap<u64, Arc<SharedMap>>,
    queues: DashMap<u64, u32>,
    irqs: DashMap<u64, IrqWatcher>,
}

impl ShmFabric {
    /// Open a session over the default directory (`/dev/shm` when present).
    pub fn open() -> TransportResult<Arc<Self>> {
        let shm = Path::new("/dev/shm");
        let dir =
            if shm.is_dir() { shm.to_path_buf() } else { std::env::temp_dir() };
        Self::with_dir(dir)
    }

    /// Open a session over an explicit directory.
    pub fn with_dir(dir: impl Into<PathBuf>) -> TransportResult<Arc<Self>> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| TransportError::from_io("create fabric directory", &e))?;
        Ok(Arc::new(ShmFabric {
            dir,
            next_handle: AtomicU64::new(1),
            locals: DashMap::new(),
            remotes: DashMap::new(),
            maps: DashMap::new(),
            queues: DashMap::new(),
            irqs: DashMap::new(),
        }))
    }

    fn handle(&self) -> u64 {
        self.next_handle.fetch_add(1, SeqCst)
    }

    fn segment_path(&self, adapter: u32, id: SegmentId) -> PathBuf {
        self.dir.join(format!("segbench-seg-{adapter}-{}", id.0))
    }

    fn avail_path(&self, adapter: u32, id: SegmentId) -> PathBuf {
        self.dir.join(format!("segbench-seg-{adapter}-{}.avail", id.0))
    }

    fn irq_path(&self, adapter: u32, channel: ChannelId) -> PathBuf {
        self.dir.join(format!("segbench-irq-{adapter}-{}", channel.0))
    }
}

impl Interconnect for ShmFabric {
    fn alloc_segment(
        &self,
        adapter: u32,
        id: SegmentId,
        len: usize,
        device: Device,
    ) -> TransportResult<LocalSegmentHandle> {
        if !device.is_host() {
            return Err(TransportError::NotSupported(
                "gpu segments require a device-aware transport",
            ));
        }
        if len == 0 {
            return Err(TransportError::InvalidArgument("zero-length segment"));
        }

        let path = self.segment_path(adapter, id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| TransportError::from_io("create segment file", &e))?;
        file.set_len(len as u64)
            .map_err(|e| TransportError::from_io("size segment file", &e))?;
        let mut map = unsafe { MmapOptions::new().map_mut(&file) }
            .map_err(|e| TransportError::from_io("map segment file", &e))?;

        let handle = self.handle();
        self.locals.insert(
            handle,
            LocalSeg {
                path,
                avail_path: self.avail_path(adapter, id),
                ptr: map.as_mut_ptr() as usize,
                len,
                _map: map,
            },
        );
        Ok(LocalSegmentHandle(handle))
    }

    fn segment_ptr(
        &self,
        segment: LocalSegmentHandle,
    ) -> TransportResult<NonNull<c_void>> {
        let seg = self
            .locals
            .get(&segment.0)
            .ok_or(TransportError::StaleHandle("local segment"))?;
        Ok(NonNull::new(seg.ptr as *mut c_void).expect("mapped segment pointer"))
    }

    fn segment_len(&self, segment: LocalSegmentHandle) -> TransportResult<usize> {
        let seg = self
            .locals
            .get(&segment.0)
            .ok_or(TransportError::StaleHandle("local segment"))?;
        Ok(seg.len)
    }

    fn publish_segment(&self, segment: LocalSegmentHandle) -> TransportResult<()> {
        let seg = self
            .locals
            .get(&segment.0)
            .ok_or(TransportError::StaleHandle("local segment"))?;
        fs::write(&seg.avail_path, b"")
            .map_err(|e| TransportError::from_io("create availability marker", &e))
    }

    fn unpublish_segment(&self, segment: LocalSegmentHandle) -> TransportResult<()> {
        let seg = self
            .locals
            .get(&segment.0)
            .ok_or(TransportError::StaleHandle("local segment"))?;
        match fs::remove_file(&seg.avail_path) {
            Ok(()) => Ok(()),
            Err(ref error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => {
                Err(TransportError::from_io("remove availability marker", &error))
            }
        }
    }

    fn remove_segment(&self, segment: LocalSegmentHandle) -> TransportResult<()> {
        let (_, mut seg) = self
            .locals
            .remove(&segment.0)
            .ok_or(TransportError::StaleHandle("local segment"))?;
        seg.remove()
    }

    fn connect_segment(
        &self,
        adapter: u32,
        id: SegmentId,
    ) -> TransportResult<RemoteSegmentHandle> {
        if !self.avail_path(adapter, id).exists() {
            return Err(TransportError::NotFound("segment is not available"));
        }
        let path = self.segment_path(adapter, id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| TransportError::from_io("open segment file", &e))?;
        let len = file
            .metadata()
            .map_err(|e| TransportError::from_io("stat segment file", &e))?
            .len() as usize;
        let mut map = unsafe { MmapOptions::new().map_mut(&file) }
            .map_err(|e| TransportError::from_io("map segment file", &e))?;

        let handle = self.handle();
        self.remotes.insert(
            handle,
            RemoteSeg {
                shared: Arc::new(SharedMap {
                    ptr: map.as_mut_ptr() as usize,
                    len,
                    _map: map,
                }),
            },
        );
        Ok(RemoteSegmentHandle(handle))
    }

    fn remote_len(&self, remote: RemoteSegmentHandle) -> TransportResult<usize> {
        let seg = self
            .remotes
            .get(&remote.0)
            .ok_or(TransportError::StaleHandle("remote segment"))?;
        Ok(seg.shared.len)
    }

    fn disconnect_segment(&self, remote: RemoteSegmentHandle) -> TransportResult<()> {
        self.remotes
            .remove(&remote.0)
            .map(|_| ())
            .ok_or(TransportError::StaleHandle("remote segment"))
    }

    fn map_remote(&self, remote: RemoteSegmentHandle) -> TransportResult<MappedRegion> {
        let seg = self
            .remotes
            .get(&remote.0)
            .ok_or(TransportError::StaleHandle("remote segment"))?;
        let shared = seg.shared.clone();
        let handle = self.handle();
        let region = MappedRegion {
            handle: MapHandle(handle),
            ptr: NonNull::new(shared.ptr as *mut c_void).expect("mapped segment pointer"),
            len: shared.len,
        };
        self.maps.insert(handle, shared);
        Ok(region)
    }

    fn unmap_remote(&self, map: MapHandle) -> TransportResult<()> {
        self.maps
            .remove(&map.0)
            .map(|_| ())
            .ok_or(TransportError::StaleHandle("mapping"))
    }

    fn create_dma_queue(&self, adapter: u32) -> TransportResult<DmaQueueHandle> {
        let handle = self.handle();
        self.queues.insert(handle, adapter);
        Ok(DmaQueueHandle(handle))
    }

    fn remove_dma_queue(&self, queue: DmaQueueHandle) -> TransportResult<()> {
        self.queues
            .remove(&queue.0)
            .map(|_| ())
            .ok_or(TransportError::StaleHandle("dma queue"))
    }

    fn dma_transfer_vec(
        &self,
        queue: DmaQueueHandle,
        local: LocalSegmentHandle,
        remote: RemoteSegmentHandle,
        entries: &[DmaVecEntry],
        flags: DmaFlags,
    ) -> TransportResult<()> {
        if !self.queues.contains_key(&queue.0) {
            return Err(TransportError::StaleHandle("dma queue"));
        }
        let local = self
            .locals
            .get(&local.0)
            .ok_or(TransportError::StaleHandle("local segment"))?;
        let remote = self
            .remotes
            .get(&remote.0)
            .ok_or(TransportError::StaleHandle("remote segment"))?;

        for entry in entries {
            let size = entry.size as usize;
            let local_end = (entry.local_offset as usize).checked_add(size);
            let remote_end = (entry.remote_offset as usize).checked_add(size);
            if local_end.is_none_or(|end| end > local.len)
                || remote_end.is_none_or(|end| end > remote.shared.len)
            {
                return Err(TransportError::InvalidArgument(
                    "transfer entry exceeds segment bounds",
                ));
            }

            // Backing files are coherent shared mappings, so the global
            // ordering flag needs no extra work here.
            unsafe {
                let local_ptr =
                    (local.ptr as *mut u8).add(entry.local_offset as usize);
                let remote_ptr =
                    (remote.shared.ptr as *mut u8).add(entry.remote_offset as usize);
                if flags.pull {
                    std::ptr::copy_nonoverlapping(remote_ptr, local_ptr, size);
                } else {
                    std::ptr::copy_nonoverlapping(local_ptr, remote_ptr, size);
                }
            }
        }
        Ok(())
    }

    fn pio_write(
        &self,
        map: MapHandle,
        remote_offset: usize,
        src: NonNull<c_void>,
        len: usize,
    ) -> TransportResult<()> {
        self.pio_copy(map, remote_offset, src, len, false)
    }

    fn pio_copy(
        &self,
        map: MapHandle,
        remote_offset: usize,
        local: NonNull<c_void>,
        len: usize,
        pull: bool,
    ) -> TransportResult<()> {
        let shared =
            self.maps.get(&map.0).ok_or(TransportError::StaleHandle("mapping"))?;
        if remote_offset.checked_add(len).is_none_or(|end| end > shared.len) {
            return Err(TransportError::InvalidArgument(
                "programmed transfer exceeds mapped length",
            ));
        }
        unsafe {
            let remote_ptr = (shared.ptr as *mut u8).add(remote_offset);
            let local_ptr = local.as_ptr() as *mut u8;
            if pull {
                std::ptr::copy_nonoverlapping(remote_ptr, local_ptr, len);
            } else {
                std::ptr::copy_nonoverlapping(local_ptr, remote_ptr, len);
            }
        }
        Ok(())
    }

    fn register_interrupt(
        &self,
        adapter: u32,
        channel: ChannelId,
        callback: InterruptCallback,
    ) -> TransportResult<InterruptHandle> {
        let path = self.irq_path(adapter, channel);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| TransportError::from_io("create interrupt file", &e))?;
        file.set_len(8)
            .map_err(|e| TransportError::from_io("size interrupt file", &e))?;
        let mut map = unsafe { MmapOptions::new().map_mut(&file) }
            .map_err(|e| TransportError::from_io("map interrupt file", &e))?;

        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let stop = stop.clone();
            let counter_ptr = map.as_mut_ptr() as usize;
            std::thread::Builder::new()
                .name("shm-irq-watcher".to_string())
                .spawn(move || {
                    // The mapping moves into the thread to keep the counter
                    // word alive for as long as the watcher runs.
                    let _map = map;
                    let counter =
                        unsafe { AtomicU64::from_ptr(counter_ptr as *mut u64) };
                    // The counter word starts at zero in the freshly created
                    // file, so triggers racing registration are not lost.
                    let mut seen = 0u64;
                    while !stop.load(SeqCst) {
                        let current = counter.load(SeqCst);
                        while seen < current {
                            seen += 1;
                            callback(InterruptEvent { channel, error: None });
                        }
                        std::thread::sleep(WATCH_INTERVAL);
                    }
                })
                .map_err(|_| {
                    TransportError::Io { code: 0, context: "spawn interrupt watcher" }
                })?
        };

        let handle = self.handle();
        self.irqs.insert(handle, IrqWatcher { path, stop, thread: Some(thread) });
        Ok(InterruptHandle(handle))
    }

    fn remove_interrupt(&self, interrupt: InterruptHandle) -> TransportResult<()> {
        let (_, mut watcher) = self
            .irqs
            .remove(&interrupt.0)
            .ok_or(TransportError::StaleHandle("interrupt"))?;
        watcher.shutdown()
    }

    fn trigger_interrupt(
        &self,
        adapter: u32,
        channel: ChannelId,
    ) -> TransportResult<()> {
        let path = self.irq_path(adapter, channel);
        let file = OpenOptions::new().read(true).write(true).open(&path).map_err(
            |error| match error.kind() {
                std::io::ErrorKind::NotFound => {
                    TransportError::NotFound("no interrupt registered on channel")
                }
                _ => TransportError::from_io("open interrupt file", &error),
            },
        )?;
        let mut map = unsafe { MmapOptions::new().map_mut(&file) }
            .map_err(|e| TransportError::from_io("map interrupt file", &e))?;
        let counter = unsafe { AtomicU64::from_ptr(map.as_mut_ptr() as *mut u64) };
        counter.fetch_add(1, SeqCst);
        Ok(())
    }
}

impl Drop for ShmFabric {
    fn drop(&mut self) {
        // Watchers stop and interrupt files unlink through IrqWatcher::drop;
        // leftover local segments unlink here.
        self.irqs.clear();
        for mut entry in self.locals.iter_mut() {
            if let Err(error) = entry.value_mut().remove() {
                debug!(%error, "Failed to clean up segment on session close");
            }
        }
        self.locals.clear();
    }
}

use std::sync::Arc;

use tracing::warn;

use crate::{
    api::{ChannelId, LocalSegmentHandle, RemoteSegmentHandle, SegmentId},
    buffer::Buffer,
    device::{Device, DeviceMemory},
    error::{BenchError, Result},
    transport::Interconnect,
    utils::Defer,
};

/// One scatter/gather element: `size` bytes from `local_offset` in the local
/// segment to `remote_offset` in the remote segment (or the reverse, for
/// pull strategies).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferEntry {
    pub local_offset: usize,
    pub remote_offset: usize,
    pub size: usize,
}

/// Everything a transfer strategy needs besides the entries: the transport
/// session, the segment handles, the local buffer view and the validation
/// channel tied to the remote segment id.
pub struct TransferListDesc {
    io: Arc<dyn Interconnect>,
    adapter: u32,
    local: LocalSegmentHandle,
    remote: RemoteSegmentHandle,
    validate: ChannelId,
    device: Device,
    buffer: Buffer,
    segment_size: usize,
}

impl TransferListDesc {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        io: Arc<dyn Interconnect>,
        adapter: u32,
        local: LocalSegmentHandle,
        remote: RemoteSegmentHandle,
        validate: ChannelId,
        device: Device,
        buffer: Buffer,
        segment_size: usize,
    ) -> Self {
        Self { io, adapter, local, remote, validate, device, buffer, segment_size }
    }

    pub fn io(&self) -> &Arc<dyn Interconnect> {
        &self.io
    }

    pub fn adapter(&self) -> u32 {
        self.adapter
    }

    pub fn local_segment(&self) -> LocalSegmentHandle {
        self.local
    }

    pub fn remote_segment(&self) -> RemoteSegmentHandle {
        self.remote
    }

    pub fn validation_channel(&self) -> ChannelId {
        self.validate
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }
}

/// Ordered scatter/gather description of one benchmark's data movement.
/// Entries are fixed at construction; no API mutates them afterwards.
/// Exactly one list is in flight per client invocation.
pub struct TransferList {
    entries: Vec<TransferEntry>,
    desc: TransferListDesc,
}

impl TransferList {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, index: usize) -> Option<&TransferEntry> {
        self.entries.get(index)
    }

    pub fn entries(&self) -> &[TransferEntry] {
        &self.entries
    }

    /// Sum of all entry sizes, the bytes moved by one repetition.
    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size as u64).sum()
    }

    pub fn desc(&self) -> &TransferListDesc {
        &self.desc
    }
}

impl Drop for TransferList {
    fn drop(&mut self) {
        if let Err(error) = self.desc.io.disconnect_segment(self.desc.remote) {
            warn!(%error, "Failed to disconnect remote segment");
        }
        if let Err(error) = self.desc.io.remove_segment(self.desc.local) {
            warn!(%error, "Failed to remove local segment");
        }
    }
}

/// Builds a [`TransferList`]: allocates the local segment, connects the
/// published remote segment and validates every entry against both segment
/// lengths. Range violations are rejected here, never at transfer time.
pub struct TransferListBuilder {
    io: Arc<dyn Interconnect>,
    adapter: u32,
    local_id: SegmentId,
    remote_id: SegmentId,
    size: usize,
    device: Device,
    devmem: Option<Arc<dyn DeviceMemory>>,
    entries: Vec<TransferEntry>,
}

impl TransferListBuilder {
    pub fn new(
        io: Arc<dyn Interconnect>,
        adapter: u32,
        local_id: SegmentId,
        remote_id: SegmentId,
        size: usize,
    ) -> Self {
        Self {
            io,
            adapter,
            local_id,
            remote_id,
            size,
            device: Device::Host,
            devmem: None,
            entries: Vec::new(),
        }
    }

    pub fn device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn device_memory(mut self, devmem: Arc<dyn DeviceMemory>) -> Self {
        self.devmem = Some(devmem);
        self
    }

    pub fn entry(mut self, local_offset: usize, remote_offset: usize, size: usize) -> Self {
        self.entries.push(TransferEntry { local_offset, remote_offset, size });
        self
    }

    /// Cover the whole segment with `chunks` equally sized entries (the last
    /// one takes the remainder).
    pub fn split(mut self, chunks: usize) -> Self {
        let chunks = chunks.max(1).min(self.size.max(1));
        let chunk = self.size / chunks;
        for i in 0..chunks {
            let offset = i * chunk;
            let size = if i == chunks - 1 { self.size - offset } else { chunk };
            self.entries.push(TransferEntry {
                local_offset: offset,
                remote_offset: offset,
                size,
            });
        }
        self
    }

    pub fn build(self) -> Result<TransferList> {
        let Self { io, adapter, local_id, remote_id, size, device, devmem, mut entries } =
            self;

        let local = io.alloc_segment(adapter, local_id, size, device)?;
        let io_local = io.clone();
        let mut local_guard = Defer::new(move || {
            if let Err(error) = io_local.remove_segment(local) {
                warn!(%error, "Failed to remove local segment");
            }
        });

        let remote = io.connect_segment(adapter, remote_id)?;
        let io_remote = io.clone();
        let mut remote_guard = Defer::new(move || {
            if let Err(error) = io_remote.disconnect_segment(remote) {
                warn!(%error, "Failed to disconnect remote segment");
            }
        });

        let local_len = io.segment_len(local)?;
        let remote_len = io.remote_len(remote)?;
        if entries.is_empty() {
            entries.push(TransferEntry { local_offset: 0, remote_offset: 0, size });
        }
        validate_entries(&entries, local_len, remote_len)?;

        let buffer = Buffer::new(io.segment_ptr(local)?, local_len, device, devmem)?;

        local_guard.cancel();
        remote_guard.cancel();
        let desc = TransferListDesc::new(
            io,
            adapter,
            local,
            remote,
            ChannelId(remote_id.0),
            device,
            buffer,
            local_len,
        );
        Ok(TransferList { entries, desc })
    }
}

fn validate_entries(
    entries: &[TransferEntry],
    local_len: usize,
    remote_len: usize,
) -> Result<()> {
    for (i, entry) in entries.iter().enumerate() {
        if entry.size == 0 {
            return Err(BenchError::InvalidRange(format!(
                "entry {i}: zero-sized transfer"
            )));
        }
        if entry.local_offset.checked_add(entry.size).is_none_or(|end| end > local_len) {
            return Err(BenchError::InvalidRange(format!(
                "entry {i}: local bytes {}..{} exceed segment length {local_len}",
                entry.local_offset,
                entry.local_offset.saturating_add(entry.size),
            )));
        }
        if entry.remote_offset.checked_add(entry.size).is_none_or(|end| end > remote_len)
        {
            return Err(BenchError::InvalidRange(format!(
                "entry {i}: remote bytes {}..{} exceed segment length {remote_len}",
                entry.remote_offset,
                entry.remote_offset.saturating_add(entry.size),
            )));
        }
    }
    Ok(())
}

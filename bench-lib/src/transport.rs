//! Capability surface of the interconnect transport.
//!
//! The vendor driver (segment registration, DMA queues, interrupt delivery)
//! stays behind this trait; the benchmark core only ever sees opaque handles
//! and `TransportError` statuses. The in-tree implementation is
//! [`crate::ShmFabric`]; hardware transports plug in the same way.

use std::{ffi::c_void, ptr::NonNull};

use mockall::automock;

use crate::{
    api::{
        ChannelId, DmaFlags, DmaQueueHandle, DmaVecEntry, InterruptHandle,
        LocalSegmentHandle, MapHandle, RemoteSegmentHandle, SegmentId,
    },
    device::Device,
    error::TransportError,
};

/// A remote segment mapped for direct access. Valid until the handle is
/// passed to [`Interconnect::unmap_remote`].
#[derive(Debug, Clone, Copy)]
pub struct MappedRegion {
    pub handle: MapHandle,
    pub ptr: NonNull<c_void>,
    pub len: usize,
}

/// Event delivered to a registered interrupt handler. Carries the channel
/// the trigger arrived on and the delivery status.
#[derive(Debug)]
pub struct InterruptEvent {
    pub channel: ChannelId,
    pub error: Option<TransportError>,
}

/// Handlers run on a transport-owned callback context, concurrently with
/// the thread that registered them. They must not block.
pub type InterruptCallback = Box<dyn Fn(InterruptEvent) + Send + Sync>;

pub type TransportResult<T> = std::result::Result<T, TransportError>;

#[automock]
pub trait Interconnect: Send + Sync {
    /// Allocate a local segment of `len` bytes on `device`, bound to an
    /// adapter and a numeric id. The segment owns its memory until
    /// `remove_segment`.
    fn alloc_segment(
        &self,
        adapter: u32,
        id: SegmentId,
        len: usize,
        device: Device,
    ) -> TransportResult<LocalSegmentHandle>;

    fn segment_ptr(&self, segment: LocalSegmentHandle)
    -> TransportResult<NonNull<c_void>>;

    fn segment_len(&self, segment: LocalSegmentHandle) -> TransportResult<usize>;

    /// Make the segment connectable by remote peers.
    fn publish_segment(&self, segment: LocalSegmentHandle) -> TransportResult<()>;

    fn unpublish_segment(&self, segment: LocalSegmentHandle) -> TransportResult<()>;

    /// Release the segment and the memory behind it (device-specific release
    /// for GPU segments).
    fn remove_segment(&self, segment: LocalSegmentHandle) -> TransportResult<()>;

    /// Connect to a published segment on `adapter` with the given id.
    fn connect_segment(
        &self,
        adapter: u32,
        id: SegmentId,
    ) -> TransportResult<RemoteSegmentHandle>;

    fn remote_len(&self, remote: RemoteSegmentHandle) -> TransportResult<usize>;

    fn disconnect_segment(&self, remote: RemoteSegmentHandle) -> TransportResult<()>;

    /// Map a connected remote segment for direct access.
    fn map_remote(&self, remote: RemoteSegmentHandle) -> TransportResult<MappedRegion>;

    /// Release a mapping. May report `Busy` transiently; callers retry.
    fn unmap_remote(&self, map: MapHandle) -> TransportResult<()>;

    fn create_dma_queue(&self, adapter: u32) -> TransportResult<DmaQueueHandle>;

    fn remove_dma_queue(&self, queue: DmaQueueHandle) -> TransportResult<()>;

    /// Submit a vectorized transfer and block until it completes.
    fn dma_transfer_vec(
        &self,
        queue: DmaQueueHandle,
        local: LocalSegmentHandle,
        remote: RemoteSegmentHandle,
        entries: &[DmaVecEntry],
        flags: DmaFlags,
    ) -> TransportResult<()>;

    /// Programmed write of `len` bytes from `src` into the mapped segment.
    fn pio_write(
        &self,
        map: MapHandle,
        remote_offset: usize,
        src: NonNull<c_void>,
        len: usize,
    ) -> TransportResult<()>;

    /// Programmed copy between local memory and the mapped segment.
    fn pio_copy(
        &self,
        map: MapHandle,
        remote_offset: usize,
        local: NonNull<c_void>,
        len: usize,
        pull: bool,
    ) -> TransportResult<()>;

    /// Register a handler on a fixed channel id. One handler per channel.
    fn register_interrupt(
        &self,
        adapter: u32,
        channel: ChannelId,
        callback: InterruptCallback,
    ) -> TransportResult<InterruptHandle>;

    /// Deregister a handler. May report `Busy` transiently; callers retry.
    fn remove_interrupt(&self, interrupt: InterruptHandle) -> TransportResult<()>;

    /// Trigger the interrupt registered on `channel` by a remote peer.
    fn trigger_interrupt(&self, adapter: u32, channel: ChannelId)
    -> TransportResult<()>;
}

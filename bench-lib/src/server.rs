//! Server role: expose a receive buffer as a published segment and report
//! spot checks whenever the client triggers the validation interrupt.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::{
    api::{ChannelId, InterruptHandle, SegmentId},
    buffer::Buffer,
    device::{Device, DeviceMemory},
    error::{Result, TransportError},
    transport::{Interconnect, InterruptEvent},
    utils::Defer,
};

#[derive(Debug, Clone)]
pub struct ServerOpts {
    pub adapter: u32,
    pub device: Device,
    pub segment_id: SegmentId,
    pub segment_size: usize,
}

struct ControlFlags {
    keep_running: bool,
    last_observed: u8,
}

struct ControlState {
    lock: Mutex<ControlFlags>,
    cond: Condvar,
}

/// Stop signal and observed-byte state for one server invocation. One mutex
/// guards both fields: the interrupt callback writes `last_observed` while
/// the main thread waits on the condition variable.
#[derive(Clone)]
pub struct ServerControl {
    state: Arc<ControlState>,
}

impl ServerControl {
    pub fn new() -> Self {
        Self {
            state: Arc::new(ControlState {
                lock: Mutex::new(ControlFlags { keep_running: true, last_observed: 0 }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Request the server to stop. Safe to call from a signal handler
    /// context or any thread; requests after the first are no-ops.
    pub fn stop(&self) {
        let mut flags = self.state.lock.lock();
        if !flags.keep_running {
            debug!("Stop already requested");
            return;
        }
        info!("Stopping server");
        flags.keep_running = false;
        self.state.cond.notify_one();
    }

    /// The byte most recently observed by the interrupt handler.
    pub fn last_observed_byte(&self) -> u8 {
        self.state.lock.lock().last_observed
    }

    fn seed(&self, byte: u8) {
        self.state.lock.lock().last_observed = byte;
    }

    fn observe(&self, byte: u8) -> u8 {
        let mut flags = self.state.lock.lock();
        std::mem::replace(&mut flags.last_observed, byte)
    }

    fn wait(&self) {
        let mut flags = self.state.lock.lock();
        while flags.keep_running {
            self.state.cond.wait(&mut flags);
        }
    }
}

impl Default for ServerControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the server until `control.stop()` is invoked.
///
/// Setup order: segment, interrupt handler, publish. Teardown walks the
/// completed steps in reverse (unpublish, deregister, release), and a
/// failure partway through setup unwinds only what was acquired. The session
/// itself closes when the caller drops its `Arc`.
pub fn serve(
    io: Arc<dyn Interconnect>,
    devmem: Option<Arc<dyn DeviceMemory>>,
    opts: &ServerOpts,
    control: &ServerControl,
) -> Result<()> {
    let segment =
        io.alloc_segment(opts.adapter, opts.segment_id, opts.segment_size, opts.device)?;
    let io_segment = io.clone();
    let segment_guard = Defer::new(move || {
        if let Err(error) = io_segment.remove_segment(segment) {
            warn!(%error, "Failed to release segment");
        }
    });

    let buffer =
        Buffer::new(io.segment_ptr(segment)?, io.segment_len(segment)?, opts.device, devmem)?;
    let byte: u8 = rand::random();
    debug!(
        value = format_args!("{byte:02x}"),
        "Filling receive buffer with random value"
    );
    buffer.fill(byte)?;
    control.seed(byte);

    let channel = ChannelId(opts.segment_id.0);
    let handler = {
        let control = control.clone();
        let buffer = buffer.clone();
        Box::new(move |event: InterruptEvent| {
            if let Some(error) = event.error {
                warn!(%error, channel = event.channel.0, "Interrupt delivered with error status");
                return;
            }
            match buffer.first_byte() {
                Ok(observed) => {
                    let previous = control.observe(observed);
                    info!(
                        previous = format_args!("{previous:02x}"),
                        observed = format_args!("{observed:02x}"),
                        "Receive buffer spot check"
                    );
                }
                Err(error) => error!(%error, "Failed to read receive buffer"),
            }
        })
    };
    let interrupt = io.register_interrupt(opts.adapter, channel, handler)?;
    let io_interrupt = io.clone();
    let interrupt_guard = Defer::new(move || {
        if let Err(error) = remove_interrupt_retrying(io_interrupt.as_ref(), interrupt) {
            warn!(%error, "Failed to remove interrupt");
        }
    });

    io.publish_segment(segment)?;

    info!(
        segment = opts.segment_id.0,
        size = opts.segment_size,
        device = %opts.device,
        "Running server"
    );
    control.wait();
    info!("Server stopped");

    if let Err(error) = io.unpublish_segment(segment) {
        warn!(%error, "Failed to unpublish segment");
    }
    // Guards drop in reverse declaration order: interrupt first, then the
    // segment and its memory.
    drop(interrupt_guard);
    drop(segment_guard);
    Ok(())
}

/// Deregister, retrying while the transport reports a transient busy status.
fn remove_interrupt_retrying(
    io: &dyn Interconnect,
    interrupt: InterruptHandle,
) -> std::result::Result<(), TransportError> {
    loop {
        match io.remove_interrupt(interrupt) {
            Err(error) if error.is_busy() => std::thread::yield_now(),
            result => return result,
        }
    }
}

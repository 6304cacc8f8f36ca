//! Cross-host completion and verification handshake.
//!
//! Two independent checks: a one-shot remote interrupt that makes the server
//! spot-check its own buffer, and a client-driven full comparison of the
//! mapped remote segment against the local buffer.

use tracing::{debug, error, info, warn};

use crate::{
    api::MapHandle,
    error::{Result, TransportError},
    translist::TransferListDesc,
    transport::Interconnect,
};

/// Fire the validation interrupt and log the local spot check. Purely
/// observational: trigger failures are logged, never propagated.
pub(crate) fn trigger_validation(desc: &TransferListDesc, before: u8) {
    let io = desc.io();
    if let Err(error) = io.trigger_interrupt(desc.adapter(), desc.validation_channel()) {
        error!(%error, "Failed to trigger remote interrupt");
    }

    match desc.buffer().first_byte() {
        Ok(after) => info!(
            before = format_args!("{before:02x}"),
            after = format_args!("{after:02x}"),
            "Local buffer spot check"
        ),
        Err(error) => error!(%error, "Failed to read back local buffer"),
    }
}

/// Map the remote segment and compare it in full against the local buffer.
/// The mapping is released on every exit path.
pub(crate) fn compare_remote(desc: &TransferListDesc) -> Result<bool> {
    let io = desc.io();
    let map = io.map_remote(desc.remote_segment())?;

    debug!("Comparing local and remote memory");
    let matched = desc.buffer().compare(map.ptr, desc.segment_size().min(map.len));

    if let Err(error) = unmap_retrying(io.as_ref(), map.handle) {
        warn!(%error, "Failed to unmap remote segment");
    }

    Ok(matched? == desc.segment_size())
}

/// Unmap, retrying while the transport reports a transient busy status.
/// Any other status ends the loop.
pub(crate) fn unmap_retrying(
    io: &dyn Interconnect,
    map: MapHandle,
) -> std::result::Result<(), TransportError> {
    loop {
        match io.unmap_remote(map) {
            Err(error) if error.is_busy() => std::thread::yield_now(),
            result => return result,
        }
    }
}

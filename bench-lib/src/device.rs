use std::{ffi::c_void, ptr::NonNull};

use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::error::DeviceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GpuId(pub u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Host,
    Gpu(GpuId),
}

impl Device {
    pub fn is_host(&self) -> bool {
        matches!(self, Device::Host)
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Host => write!(f, "host"),
            Device::Gpu(id) => write!(f, "gpu:{}", id.0),
        }
    }
}

/// Capability surface of the vendor device-memory library. Host buffers
/// never go through this trait; GPU buffers use nothing else.
///
/// `compare` returns the number of leading bytes that match so callers can
/// report how far a partial replication got.
#[automock]
pub trait DeviceMemory: Send + Sync {
    fn alloc(
        &self,
        device: GpuId,
        len: usize,
    ) -> std::result::Result<NonNull<c_void>, DeviceError>;

    fn release(
        &self,
        device: GpuId,
        ptr: NonNull<c_void>,
        len: usize,
    ) -> std::result::Result<(), DeviceError>;

    fn fill(
        &self,
        device: GpuId,
        ptr: NonNull<c_void>,
        len: usize,
        value: u8,
    ) -> std::result::Result<(), DeviceError>;

    fn compare(
        &self,
        device: GpuId,
        device_ptr: NonNull<c_void>,
        other: NonNull<c_void>,
        len: usize,
    ) -> std::result::Result<usize, DeviceError>;

    fn copy_to_host(
        &self,
        device: GpuId,
        src: NonNull<c_void>,
        offset: usize,
        dst: &mut [u8],
    ) -> std::result::Result<(), DeviceError>;
}

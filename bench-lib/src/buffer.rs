use std::{ffi::c_void, ptr::NonNull, sync::Arc};

use crate::{
    device::{Device, DeviceMemory},
    error::{BenchError, Result},
};

/// View over one contiguous memory region, either host RAM or a specific
/// GPU's device memory. The memory itself is owned by the segment that
/// created it; dropping a `Buffer` releases nothing.
///
/// All operations dispatch by device kind, so strategy and verification
/// code is written once against this type.
#[derive(Clone)]
pub struct Buffer {
    ptr: NonNull<c_void>,
    len: usize,
    device: Device,
    devmem: Option<Arc<dyn DeviceMemory>>,
}

unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
    pub fn new(
        ptr: NonNull<c_void>,
        len: usize,
        device: Device,
        devmem: Option<Arc<dyn DeviceMemory>>,
    ) -> Result<Self> {
        if !device.is_host() && devmem.is_none() {
            return Err(BenchError::Custom(
                "gpu buffer requires a device memory library",
            ));
        }
        Ok(Buffer { ptr, len, device, devmem })
    }

    pub fn host(ptr: NonNull<c_void>, len: usize) -> Self {
        Buffer { ptr, len, device: Device::Host, devmem: None }
    }

    pub fn ptr(&self) -> NonNull<c_void> {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Set every byte of the buffer to `value`.
    pub fn fill(&self, value: u8) -> Result<()> {
        match self.device {
            Device::Host => {
                let bytes = unsafe {
                    std::slice::from_raw_parts_mut(self.ptr.as_ptr() as *mut u8, self.len)
                };
                bytes.fill(value);
                Ok(())
            }
            Device::Gpu(id) => {
                self.devmem().fill(id, self.ptr, self.len, value)?;
                Ok(())
            }
        }
    }

    /// Compare the first `len` bytes of this buffer against host-addressable
    /// memory at `other`. Returns the length of the matching prefix rather
    /// than failing fast, so partial matches stay diagnosable.
    pub fn compare(&self, other: NonNull<c_void>, len: usize) -> Result<usize> {
        let len = len.min(self.len);
        match self.device {
            Device::Host => {
                let ours = unsafe {
                    std::slice::from_raw_parts(self.ptr.as_ptr() as *const u8, len)
                };
                let theirs = unsafe {
                    std::slice::from_raw_parts(other.as_ptr() as *const u8, len)
                };
                Ok(ours.iter().zip(theirs).take_while(|(a, b)| a == b).count())
            }
            Device::Gpu(id) => Ok(self.devmem().compare(id, self.ptr, other, len)?),
        }
    }

    /// Copy `dst.len()` bytes starting at `offset` into host memory.
    pub fn copy_to_host(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        if offset.checked_add(dst.len()).is_none_or(|end| end > self.len) {
            return Err(BenchError::InvalidRange(format!(
                "read of {} bytes at offset {} exceeds buffer length {}",
                dst.len(),
                offset,
                self.len
            )));
        }
        match self.device {
            Device::Host => {
                let src = unsafe {
                    std::slice::from_raw_parts(
                        (self.ptr.as_ptr() as *const u8).add(offset),
                        dst.len(),
                    )
                };
                dst.copy_from_slice(src);
                Ok(())
            }
            Device::Gpu(id) => {
                self.devmem().copy_to_host(id, self.ptr, offset, dst)?;
                Ok(())
            }
        }
    }

    /// The byte at offset 0, used by the spot-check reports.
    pub fn first_byte(&self) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.copy_to_host(0, &mut byte)?;
        Ok(byte[0])
    }

    fn devmem(&self) -> &dyn DeviceMemory {
        self.devmem.as_deref().expect("checked at construction")
    }
}

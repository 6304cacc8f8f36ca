pub mod api;
mod bench;
mod buffer;
mod device;
mod error;
mod server;
mod shm;
mod translist;
mod transport;
mod utils;
mod verify;

pub use api::{BenchConfig, BenchMode, BenchResult, ChannelId, SegmentId};
pub use bench::run_benchmark;
pub use buffer::Buffer;
pub use device::{Device, DeviceMemory, GpuId};
pub use error::{BenchError, DeviceError, Result, TransportError};
pub use server::{ServerControl, ServerOpts, serve};
pub use shm::ShmFabric;
pub use translist::{TransferEntry, TransferList, TransferListBuilder, TransferListDesc};
pub use transport::{
    Interconnect, InterruptCallback, InterruptEvent, MappedRegion, TransportResult,
};

pub use device::MockDeviceMemory;
pub use transport::MockInterconnect;

#[cfg(test)]
mod test_bench;

//! Types used in public API

use serde::{Deserialize, Serialize};

use crate::translist::TransferList;

pub type SmallVec<T> = ::smallvec::SmallVec<[T; 4]>;

/// Numeric id of a local or remote segment. Client and server must agree on
/// it out of band; together with the channel id it is the whole protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct SegmentId(pub u32);

/// Numeric id binding a client-side trigger to a server-side interrupt
/// handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ChannelId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct LocalSegmentHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct RemoteSegmentHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct DmaQueueHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct MapHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct InterruptHandle(pub u64);

/// One hardware transfer descriptor, mapped one-to-one from a transfer
/// list entry.
#[derive(Debug, Clone, Copy)]
pub struct DmaVecEntry {
    pub local_offset: u64,
    pub remote_offset: u64,
    pub size: u64,
}

/// Directional and ordering flags for a vectorized DMA transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DmaFlags {
    /// Read from the remote segment instead of writing to it.
    pub pull: bool,
    /// Request globally ordered delivery.
    pub global: bool,
}

/// The transfer technique driven for one benchmark invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BenchMode {
    /// Dummy mode, reports an error result.
    DoNothing,
    /// DMA push to the remote segment.
    DmaPush,
    /// DMA push with global ordering.
    DmaPushGlobal,
    /// DMA pull from the remote segment.
    DmaPull,
    /// DMA pull with global ordering.
    DmaPullGlobal,
    /// Programmed write of local memory into the mapped remote segment.
    PioWrite,
    /// Programmed copy into the mapped remote segment.
    PioCopyToRemote,
    /// Programmed copy out of the mapped remote segment.
    PioCopyFromRemote,
    /// Plain memory copy into the mapped remote segment.
    CopyToRemote,
    /// Plain memory copy out of the mapped remote segment.
    CopyFromRemote,
    /// Send data through remote data interrupts.
    DataInterrupt,
}

impl BenchMode {
    pub fn is_dma(&self) -> bool {
        matches!(
            self,
            BenchMode::DmaPush
                | BenchMode::DmaPushGlobal
                | BenchMode::DmaPull
                | BenchMode::DmaPullGlobal
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            BenchMode::DoNothing => "do-nothing",
            BenchMode::DmaPush => "dma-push",
            BenchMode::DmaPushGlobal => "dma-push-global",
            BenchMode::DmaPull => "dma-pull",
            BenchMode::DmaPullGlobal => "dma-pull-global",
            BenchMode::PioWrite => "pio-write",
            BenchMode::PioCopyToRemote => "pio-copy-to",
            BenchMode::PioCopyFromRemote => "pio-copy-from",
            BenchMode::CopyToRemote => "copy-to",
            BenchMode::CopyFromRemote => "copy-from",
            BenchMode::DataInterrupt => "data-interrupt",
        }
    }
}

impl std::fmt::Display for BenchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for BenchMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "do-nothing" => Ok(BenchMode::DoNothing),
            "dma-push" => Ok(BenchMode::DmaPush),
            "dma-push-global" => Ok(BenchMode::DmaPushGlobal),
            "dma-pull" => Ok(BenchMode::DmaPull),
            "dma-pull-global" => Ok(BenchMode::DmaPullGlobal),
            "pio-write" => Ok(BenchMode::PioWrite),
            "pio-copy-to" => Ok(BenchMode::PioCopyToRemote),
            "pio-copy-from" => Ok(BenchMode::PioCopyFromRemote),
            "copy-to" => Ok(BenchMode::CopyToRemote),
            "copy-from" => Ok(BenchMode::CopyFromRemote),
            "data-interrupt" => Ok(BenchMode::DataInterrupt),
            s => Err(format!("unknown benchmark mode: {s}")),
        }
    }
}

/// Immutable input to one benchmark execution.
pub struct BenchConfig {
    pub mode: BenchMode,
    pub runs: usize,
    pub list: TransferList,
}

/// Outcome of one benchmark execution. Finalized before it is returned and
/// never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchResult {
    /// Number of repetitions that completed with a non-zero timing sample.
    pub success_count: usize,
    /// Whether the full-length comparison of local and remote memory held.
    pub buffer_matches: bool,
    /// Sum of all entry sizes times the number of repetitions.
    pub total_bytes: u64,
    /// Wall-clock runtime of the whole repetition loop, in microseconds.
    pub total_runtime_us: u64,
    /// Elapsed microseconds per repetition; 0 marks a failed repetition.
    pub run_times_us: Vec<u64>,
}

impl BenchResult {
    /// Aggregate throughput in bytes per microsecond (equivalently MB/s).
    pub fn throughput_mbps(&self) -> f64 {
        if self.total_runtime_us == 0 {
            return 0.0;
        }
        self.total_bytes as f64 / self.total_runtime_us as f64
    }
}

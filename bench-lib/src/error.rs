use crate::device::GpuId;

pub type Result<T> = std::result::Result<T, BenchError>;

#[derive(Clone, Debug, thiserror::Error)]
pub enum BenchError {
    #[error("{0}")]
    Transport(#[from] TransportError),
    #[error("{0}")]
    Device(#[from] DeviceError),
    #[error("InvalidRangeError: {0}")]
    InvalidRange(String),
    #[error("BenchError: {0}")]
    Custom(&'static str),
}

/// Status reported by the interconnect transport. Any non-success status
/// from the vendor library surfaces as one of these variants; `Busy` is the
/// only transient one and is the signal for teardown retries.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransportError {
    #[error("TransportError: busy: {0}")]
    Busy(&'static str),
    #[error("TransportError: not found: {0}")]
    NotFound(&'static str),
    #[error("TransportError: already exists: {0}")]
    AlreadyExists(&'static str),
    #[error("TransportError: not supported: {0}")]
    NotSupported(&'static str),
    #[error("TransportError: invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("TransportError: stale handle: {0}")]
    StaleHandle(&'static str),
    #[error("TransportError: code {code}, context: {context}")]
    Io { code: i32, context: &'static str },
}

impl TransportError {
    pub fn is_busy(&self) -> bool {
        matches!(self, TransportError::Busy(_))
    }

    pub fn from_io(context: &'static str, err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => TransportError::NotFound(context),
            std::io::ErrorKind::AlreadyExists => TransportError::AlreadyExists(context),
            _ => TransportError::Io { code: err.raw_os_error().unwrap_or(0), context },
        }
    }
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("DeviceError: unknown device {0:?}")]
    UnknownDevice(GpuId),
    #[error("DeviceError: allocation failed: {0}")]
    Alloc(&'static str),
    #[error("DeviceError: {0}")]
    Custom(&'static str),
}

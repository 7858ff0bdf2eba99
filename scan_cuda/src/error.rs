use thiserror::Error;

pub type Result<T> = std::result::Result<T, ScanError>;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("exclusive mode is not supported by the non-negative segmented scan")]
    ExclusiveSegmentedScan,
    #[error("length mismatch: expected {expected} elements, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("arguments are sharded differently: {0}")]
    ShardingMismatch(String),
    #[error("stream {stream} does not exist on device {device}")]
    UnknownStream { device: usize, stream: usize },
    #[error("invalid segment encoding at index {index}: {reason}")]
    InvalidEncoding { index: usize, reason: &'static str },
    #[error("out of memory on device {device}: requested={requested} available={available}")]
    OutOfMemory {
        device: usize,
        requested: usize,
        available: usize,
    },
    #[error("device {device} failed: {status}")]
    Device { device: usize, status: String },
}

/// The failure classes callers can react to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected before any device work was enqueued.
    Configuration,
    ResourceExhausted,
    Execution,
}

impl ScanError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ScanError::ExclusiveSegmentedScan
            | ScanError::LengthMismatch { .. }
            | ScanError::ShardingMismatch(_)
            | ScanError::UnknownStream { .. }
            | ScanError::InvalidEncoding { .. } => ErrorKind::Configuration,
            ScanError::OutOfMemory { .. } => ErrorKind::ResourceExhausted,
            ScanError::Device { .. } => ErrorKind::Execution,
        }
    }

    pub(crate) fn device(device: usize, status: impl ToString) -> Self {
        ScanError::Device {
            device,
            status: status.to_string(),
        }
    }
}

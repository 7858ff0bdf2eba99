pub mod config;
pub mod context;
#[cfg(feature = "cuda")]
pub mod cuda;
pub mod device;
pub mod dispatch;
pub mod element;
pub mod error;
pub mod host;
pub mod plan;
pub mod scan;
pub mod segments;
pub mod sequential;

pub use config::ScanConfig;
pub use context::{ScanContext, ScratchPlan};
pub use device::{Device, DeviceArray, ExecutionStream};
pub use dispatch::{DevicePlan, Dispatcher, DistributedArray, ShardMapping, DEFAULT_STREAM};
pub use element::{ScanElement, SegmentElement};
pub use error::{ErrorKind, Result, ScanError};
pub use host::HostDevice;
pub use plan::{scratch_size, Level};
pub use scan::{
    inclusive_segmented_scan_non_negative, scan, segmented_scan_and_scatter_non_negative,
    segmented_scan_non_negative,
};
pub use segments::{encode_segments, encode_segments_by_len, Segmented};

use scan_gpu::{Element, SignEncoded};
use std::fmt::Debug;

#[cfg(feature = "cuda")]
pub use cust::memory::DeviceCopy;

/// Stand-in for `cust`'s marker when the CUDA backend is not built.
#[cfg(not(feature = "cuda"))]
pub trait DeviceCopy {}

#[cfg(not(feature = "cuda"))]
impl<T> DeviceCopy for T {}

/// The element types the scan kernels are instantiated for.
pub trait ScanElement:
    Element + DeviceCopy + bytemuck::Pod + Debug + PartialEq + Send + Sync + 'static
{
}

impl ScanElement for u32 {}
impl ScanElement for u64 {}
impl ScanElement for i32 {}
impl ScanElement for i64 {}
impl ScanElement for f32 {}
impl ScanElement for f64 {}

/// Element types accepted by the sign-encoded segmented scans.
pub trait SegmentElement: ScanElement + SignEncoded {}

impl<T> SegmentElement for T where T: ScanElement + SignEncoded {}

//! The boundary between the scan engine and a device backend.
//!
//! A backend supplies device-resident arrays, execution streams, a scratch
//! allocator and the launch facility for the three scan variants. Launches
//! enqueue work on a stream and return; waiting is left to the caller.

use crate::context::ScanContext;
use crate::element::{ScanElement, SegmentElement};
use crate::error::Result;

/// An ordered queue of device work.
pub trait ExecutionStream {
    /// Blocks until everything enqueued so far has run, reporting the first
    /// failure the stream has seen.
    fn synchronize(&self) -> Result<()>;
}

/// A fixed-length array resident on one device.
pub trait DeviceArray<T> {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies the current contents back to the host. Does not wait for pending
    /// work; synchronize the producing stream first.
    fn to_host(&self) -> Result<Vec<T>>;
}

pub trait Device: Sized {
    type Stream: ExecutionStream;
    type Array<T: ScanElement>: DeviceArray<T>;
    type Scratch;

    fn ordinal(&self) -> usize;

    fn stream(&self, id: usize) -> Result<&Self::Stream>;

    fn array_from_slice<T: ScanElement>(&self, data: &[T]) -> Result<Self::Array<T>>;

    fn zeroed_array<T: ScanElement>(&self, len: usize) -> Result<Self::Array<T>>;

    /// Allocates `bytes` of scratch ordered before later work on `stream`.
    fn allocate_scratch(&self, stream: &Self::Stream, bytes: usize) -> Result<Self::Scratch>;

    fn launch_scan<T: ScanElement>(
        &self,
        stream: &Self::Stream,
        input: &Self::Array<T>,
        output: &mut Self::Array<T>,
        inclusive: bool,
        context: ScanContext<Self, T>,
    ) -> Result<()>;

    /// Inclusive segmented scan of sign-encoded input.
    fn launch_segmented_scan<T: SegmentElement>(
        &self,
        stream: &Self::Stream,
        input: &Self::Array<T>,
        output: &mut Self::Array<T>,
        context: ScanContext<Self, T>,
    ) -> Result<()>;

    fn launch_segmented_scan_and_scatter<T: SegmentElement>(
        &self,
        stream: &Self::Stream,
        input: &Self::Array<T>,
        indices: &Self::Array<u32>,
        output: &mut Self::Array<T>,
        inclusive: bool,
        context: ScanContext<Self, T>,
    ) -> Result<()>;
}

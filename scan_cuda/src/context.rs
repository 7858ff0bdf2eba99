//! The two phases that precede a launch: size the scratch, then allocate it.
//!
//! A [`ScanContext`] can only be built by [`ScratchPlan::prepare`], so every
//! launch holds scratch that was sized for it. Launches take the context by
//! value and it is gone once the kernels are enqueued.

use crate::device::Device;
use crate::element::ScanElement;
use crate::error::Result;
use crate::plan::{scan_levels, scratch_size, Level};
use std::marker::PhantomData;
use std::mem;
use std::ops::Range;

/// The sizing result for one scan of `len` elements of `T`. Building it cannot
/// fail and touches no device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScratchPlan<T> {
    len: usize,
    inclusive: bool,
    levels: Vec<Level>,
    num_parts: usize,
    staged: bool,
    _element: PhantomData<T>,
}

impl<T: ScanElement> ScratchPlan<T> {
    pub fn for_scan(len: usize, inclusive: bool) -> Self {
        Self {
            len,
            inclusive,
            levels: scan_levels(len),
            num_parts: scratch_size::<T>(len, inclusive),
            staged: false,
            _element: PhantomData,
        }
    }

    /// The scatter variant also stages the unscattered block results in
    /// scratch, after the partial totals.
    pub fn for_scatter(len: usize, inclusive: bool) -> Self {
        Self {
            staged: true,
            num_parts: scratch_size::<T>(len, inclusive) + len * mem::size_of::<T>(),
            ..Self::for_scan(len, inclusive)
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn inclusive(&self) -> bool {
        self.inclusive
    }

    /// Scratch size in bytes.
    pub fn num_parts(&self) -> usize {
        self.num_parts
    }

    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    /// Element range of the staging region, if this plan has one.
    pub fn staging(&self) -> Option<Range<usize>> {
        if !self.staged {
            return None;
        }
        let start = self.levels.last().map_or(0, |level| level.totals.end);
        Some(start..start + self.len)
    }

    /// Allocates the scratch on `device`, ordered on `stream`.
    pub fn prepare<D: Device>(self, device: &D, stream: &D::Stream) -> Result<ScanContext<D, T>> {
        log::debug!(
            "device {}: {} bytes of scratch for {} elements over {} levels",
            device.ordinal(),
            self.num_parts,
            self.len,
            self.levels.len()
        );
        let part_results = device.allocate_scratch(stream, self.num_parts)?;
        Ok(ScanContext {
            plan: self,
            part_results,
        })
    }
}

/// Scratch allocated for exactly one launch.
pub struct ScanContext<D: Device, T> {
    plan: ScratchPlan<T>,
    part_results: D::Scratch,
}

impl<D: Device, T: ScanElement> ScanContext<D, T> {
    pub fn plan(&self) -> &ScratchPlan<T> {
        &self.plan
    }

    pub fn num_parts(&self) -> usize {
        self.plan.num_parts
    }

    /// Hands the scratch to the launch that consumes it.
    pub fn into_parts(self) -> (ScratchPlan<T>, D::Scratch) {
        (self.plan, self.part_results)
    }
}

#[cfg(test)]
mod tests {
    use super::ScratchPlan;
    use crate::plan::partial_slots;
    use scan_gpu::BLOCK_SIZE;

    #[test]
    fn scan_plan_test() {
        let plan = ScratchPlan::<i64>::for_scan(3 * BLOCK_SIZE, true);
        assert_eq!(plan.len(), 3 * BLOCK_SIZE);
        assert!(plan.inclusive());
        assert_eq!(plan.levels().len(), 2);
        assert_eq!(plan.num_parts(), 3 * 8);
        assert_eq!(plan.staging(), None);
    }

    #[test]
    fn scatter_plan_stages_after_totals_test() {
        let n = 5 * BLOCK_SIZE + 7;
        let plan = ScratchPlan::<f32>::for_scatter(n, false);
        let slots = partial_slots(n);
        assert_eq!(plan.staging(), Some(slots..slots + n));
        assert_eq!(plan.num_parts(), (slots + n) * 4);
    }

    #[test]
    fn empty_plan_test() {
        let plan = ScratchPlan::<u32>::for_scatter(0, true);
        assert!(plan.is_empty());
        assert!(plan.levels().is_empty());
        assert_eq!(plan.num_parts(), 0);
        assert_eq!(plan.staging(), Some(0..0));
    }
}

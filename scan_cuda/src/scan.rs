//! Scans of one device-resident array on one stream.
//!
//! Every operation sizes its scratch, allocates it on the stream and enqueues
//! the kernels; none of them waits for the result.

use crate::context::ScratchPlan;
use crate::device::{Device, DeviceArray};
use crate::element::{ScanElement, SegmentElement};
use crate::error::{Result, ScanError};

/// Inclusive or exclusive prefix sum of `input` into `output`.
pub fn scan<D, T>(
    device: &D,
    stream: &D::Stream,
    input: &D::Array<T>,
    output: &mut D::Array<T>,
    inclusive: bool,
) -> Result<()>
where
    D: Device,
    T: ScanElement,
{
    check_len(input.len(), output.len())?;
    let context = ScratchPlan::for_scan(input.len(), inclusive).prepare(device, stream)?;
    device.launch_scan(stream, input, output, inclusive, context)
}

/// Segmented prefix sum over sign-encoded input: a negative element starts a
/// new segment and every element contributes its magnitude.
///
/// Only the inclusive mode exists. `inclusive == false` is rejected before
/// anything is allocated.
pub fn segmented_scan_non_negative<D, T>(
    device: &D,
    stream: &D::Stream,
    input: &D::Array<T>,
    output: &mut D::Array<T>,
    inclusive: bool,
) -> Result<()>
where
    D: Device,
    T: SegmentElement,
{
    if !inclusive {
        return Err(ScanError::ExclusiveSegmentedScan);
    }
    check_len(input.len(), output.len())?;
    let context = ScratchPlan::for_scan(input.len(), true).prepare(device, stream)?;
    device.launch_segmented_scan(stream, input, output, context)
}

pub fn inclusive_segmented_scan_non_negative<D, T>(
    device: &D,
    stream: &D::Stream,
    input: &D::Array<T>,
    output: &mut D::Array<T>,
) -> Result<()>
where
    D: Device,
    T: SegmentElement,
{
    segmented_scan_non_negative(device, stream, input, output, true)
}

/// Segmented prefix sum whose result for element `i` lands in
/// `output[indices[i]]`.
///
/// The exclusive result of an element is the inclusive result of the element
/// before it, and zero at segment heads.
///
/// `output` must be longer than the largest index. Indices are not checked and
/// duplicates leave the slot with an unspecified winner.
pub fn segmented_scan_and_scatter_non_negative<D, T>(
    device: &D,
    stream: &D::Stream,
    input: &D::Array<T>,
    indices: &D::Array<u32>,
    output: &mut D::Array<T>,
    inclusive: bool,
) -> Result<()>
where
    D: Device,
    T: SegmentElement,
{
    check_len(input.len(), indices.len())?;
    let context = ScratchPlan::for_scatter(input.len(), inclusive).prepare(device, stream)?;
    device.launch_segmented_scan_and_scatter(stream, input, indices, output, inclusive, context)
}

fn check_len(expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(ScanError::LengthMismatch { expected, actual });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        inclusive_segmented_scan_non_negative, scan, segmented_scan_and_scatter_non_negative,
        segmented_scan_non_negative,
    };
    use crate::config::ScanConfig;
    use crate::device::{Device, DeviceArray, ExecutionStream};
    use crate::error::{ErrorKind, ScanError};
    use crate::host::HostDevice;
    use crate::sequential::{exclusive_scan, inclusive_scan};
    use proptest::prelude::*;

    fn device() -> HostDevice {
        HostDevice::new(0, &ScanConfig::default()).unwrap()
    }

    fn run_scan(device: &HostDevice, xs: &[u64], inclusive: bool) -> Vec<u64> {
        let stream = device.stream(0).unwrap();
        let input = device.array_from_slice(xs).unwrap();
        let mut output = device.zeroed_array(xs.len()).unwrap();
        scan(device, stream, &input, &mut output, inclusive).unwrap();
        stream.synchronize().unwrap();
        output.to_host().unwrap()
    }

    #[test]
    fn scan_test() {
        let device = device();
        assert_eq!(run_scan(&device, &[1, 2, 3, 4, 5], true), vec![1, 3, 6, 10, 15]);
        assert_eq!(run_scan(&device, &[1, 2, 3, 4, 5], false), vec![0, 1, 3, 6, 10]);
        assert!(run_scan(&device, &[], true).is_empty());
    }

    #[test]
    fn in_place_scan_test() {
        let device = device();
        let stream = device.stream(0).unwrap();
        let mut values = device.array_from_slice(&[2.0f32, 0.5, 1.5]).unwrap();
        // A second handle to the same storage.
        let aliased = values.share();
        scan(&device, stream, &aliased, &mut values, true).unwrap();
        stream.synchronize().unwrap();
        assert_eq!(values.to_host().unwrap(), vec![2.0, 2.5, 4.0]);
    }

    #[test]
    fn segmented_scan_test() {
        let device = device();
        let stream = device.stream(0).unwrap();
        let input = device.array_from_slice(&[5i32, -3, 2, -1, 4]).unwrap();
        let mut output = device.zeroed_array(5).unwrap();
        inclusive_segmented_scan_non_negative(&device, stream, &input, &mut output).unwrap();
        stream.synchronize().unwrap();
        assert_eq!(output.to_host().unwrap(), vec![5, 3, 5, 1, 5]);
    }

    #[test]
    fn exclusive_segmented_scan_is_rejected_test() {
        let config = ScanConfig {
            memory_limit: Some(0),
            ..ScanConfig::default()
        };
        let device = HostDevice::new(0, &config).unwrap();
        let stream = device.stream(0).unwrap();
        let input = device.array_from_slice(&[5.0f64, -3.0]).unwrap();
        let mut output = device.zeroed_array(2).unwrap();

        let err = segmented_scan_non_negative(&device, stream, &input, &mut output, false)
            .unwrap_err();
        assert!(matches!(err, ScanError::ExclusiveSegmentedScan));
        assert_eq!(err.kind(), ErrorKind::Configuration);
        stream.synchronize().unwrap();
        assert_eq!(output.to_host().unwrap(), vec![0.0, 0.0]);
    }

    #[test]
    fn scatter_test() {
        let device = device();
        let stream = device.stream(1).unwrap();
        let input = device.array_from_slice(&[5i64, -3, 2, -1, 4]).unwrap();
        let indices = device.array_from_slice(&[4u32, 3, 2, 1, 0]).unwrap();
        let mut output = device.zeroed_array(5).unwrap();

        segmented_scan_and_scatter_non_negative(&device, stream, &input, &indices, &mut output, true)
            .unwrap();
        stream.synchronize().unwrap();
        assert_eq!(output.to_host().unwrap(), vec![5, 1, 5, 3, 5]);

        segmented_scan_and_scatter_non_negative(&device, stream, &input, &indices, &mut output, false)
            .unwrap();
        stream.synchronize().unwrap();
        assert_eq!(output.to_host().unwrap(), vec![1, 0, 3, 0, 0]);
    }

    #[test]
    fn exclusive_scatter_keeps_small_floats_test() {
        let device = device();
        let stream = device.stream(0).unwrap();
        let input = device.array_from_slice(&[-1.0f32, 1.0e8]).unwrap();
        let indices = device.array_from_slice(&[0u32, 1]).unwrap();
        let mut output = device.zeroed_array(2).unwrap();

        segmented_scan_and_scatter_non_negative(&device, stream, &input, &indices, &mut output, false)
            .unwrap();
        stream.synchronize().unwrap();
        assert_eq!(output.to_host().unwrap(), vec![0.0, 1.0]);
    }

    #[test]
    fn scatter_into_larger_output_test() {
        let device = device();
        let stream = device.stream(0).unwrap();
        let input = device.array_from_slice(&[-1.0f32, 2.0, -4.0]).unwrap();
        let indices = device.array_from_slice(&[5u32, 1, 3]).unwrap();
        let mut output = device.array_from_slice(&[9.0f32; 6]).unwrap();

        segmented_scan_and_scatter_non_negative(&device, stream, &input, &indices, &mut output, true)
            .unwrap();
        stream.synchronize().unwrap();
        assert_eq!(
            output.to_host().unwrap(),
            vec![9.0, 3.0, 9.0, 4.0, 9.0, 1.0]
        );
    }

    #[test]
    fn length_mismatch_test() {
        let device = device();
        let stream = device.stream(0).unwrap();
        let input = device.array_from_slice(&[1u32, 2, 3]).unwrap();
        let mut output = device.zeroed_array(2).unwrap();
        assert!(matches!(
            scan(&device, stream, &input, &mut output, true),
            Err(ScanError::LengthMismatch {
                expected: 3,
                actual: 2
            })
        ));
    }

    #[test]
    fn out_of_range_index_fails_on_synchronize_test() {
        let device = device();
        let stream = device.stream(0).unwrap();
        let input = device.array_from_slice(&[1i32, 2]).unwrap();
        let indices = device.array_from_slice(&[0u32, 7]).unwrap();
        let mut output = device.zeroed_array(2).unwrap();

        segmented_scan_and_scatter_non_negative(&device, stream, &input, &indices, &mut output, true)
            .unwrap();
        let err = stream.synchronize().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Execution);
    }

    proptest! {
        #[test]
        fn inclusive_last_is_sum(xs in proptest::collection::vec(0u64..1_000_000, 1..3000)) {
            let device = device();
            let ys = run_scan(&device, &xs, true);
            prop_assert_eq!(ys[xs.len() - 1], xs.iter().sum::<u64>());
            prop_assert_eq!(ys, inclusive_scan(&xs));
        }

        #[test]
        fn exclusive_is_shifted_inclusive(xs in proptest::collection::vec(0u64..1_000_000, 1..3000)) {
            let device = device();
            let inclusive = run_scan(&device, &xs, true);
            let exclusive = run_scan(&device, &xs, false);
            prop_assert_eq!(exclusive[0], 0);
            for i in 1..xs.len() {
                prop_assert_eq!(exclusive[i], inclusive[i - 1]);
            }
            prop_assert_eq!(exclusive, exclusive_scan(&xs));
        }

        #[test]
        fn exclusive_scan_round_trips(xs in proptest::collection::vec(any::<u32>(), 0..3000)) {
            let xs: Vec<u64> = xs.into_iter().map(u64::from).collect();
            let device = device();
            let mut ys = run_scan(&device, &xs, false);
            ys.push(ys.last().copied().unwrap_or(0) + xs.last().copied().unwrap_or(0));
            let recovered: Vec<u64> = ys.windows(2).map(|w| w[1] - w[0]).collect();
            prop_assert_eq!(recovered, xs);
        }

        #[test]
        fn exclusive_segmented_scan_always_fails(xs in proptest::collection::vec(-100i32..100, 0..64)) {
            let device = device();
            let stream = device.stream(0).unwrap();
            let input = device.array_from_slice(&xs).unwrap();
            let mut output = device.zeroed_array(xs.len()).unwrap();
            let result = segmented_scan_non_negative(&device, stream, &input, &mut output, false);
            prop_assert!(matches!(result, Err(ScanError::ExclusiveSegmentedScan)));
        }
    }
}

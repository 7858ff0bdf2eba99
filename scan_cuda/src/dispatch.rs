//! Scans of arrays sharded across several devices.
//!
//! Each device scans its own shard on its own stream. There is no carry
//! between devices: every shard's scan starts from zero, so the result is
//! the concatenation of per-shard scans and not a global prefix sum.

use crate::device::{Device, DeviceArray, ExecutionStream};
use crate::element::{ScanElement, SegmentElement};
use crate::error::{Result, ScanError};
use crate::scan;
use itertools::Itertools;
use std::iter;

pub const DEFAULT_STREAM: usize = 0;

/// How many elements each device holds, in device order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardMapping {
    sizes: Vec<usize>,
}

impl ShardMapping {
    /// Everything on the first device.
    pub fn single(len: usize) -> Self {
        Self { sizes: vec![len] }
    }

    /// Splits `len` evenly over `devices`, the remainder going one element
    /// each to the leading devices.
    pub fn stripe(len: usize, devices: usize) -> Self {
        if devices == 0 {
            return Self { sizes: Vec::new() };
        }
        let (base, remainder) = (len / devices, len % devices);
        Self {
            sizes: (0..devices)
                .map(|device| base + usize::from(device < remainder))
                .collect(),
        }
    }

    pub fn from_sizes(sizes: Vec<usize>) -> Self {
        Self { sizes }
    }

    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    pub fn num_devices(&self) -> usize {
        self.sizes.len()
    }

    pub fn total_len(&self) -> usize {
        self.sizes.iter().sum()
    }

    /// Global index of each shard's first element.
    pub fn offsets(&self) -> Vec<usize> {
        self.sizes
            .iter()
            .scan(0, |offset, &size| {
                let start = *offset;
                *offset += size;
                Some(start)
            })
            .collect()
    }

    pub fn non_empty_devices(&self) -> impl Iterator<Item = usize> + '_ {
        self.sizes
            .iter()
            .enumerate()
            .filter(|&(_, &size)| size > 0)
            .map(|(device, _)| device)
    }
}

/// An array split over devices, shard `i` living on device `i`.
pub struct DistributedArray<T: ScanElement, D: Device> {
    mapping: ShardMapping,
    ordinals: Vec<usize>,
    shards: Vec<D::Array<T>>,
}

impl<T: ScanElement, D: Device> DistributedArray<T, D> {
    pub fn from_slice(devices: &[D], mapping: ShardMapping, data: &[T]) -> Result<Self> {
        check_devices(devices, &mapping)?;
        if mapping.total_len() != data.len() {
            return Err(ScanError::LengthMismatch {
                expected: data.len(),
                actual: mapping.total_len(),
            });
        }
        let shards = devices
            .iter()
            .zip(mapping.offsets().into_iter().zip(mapping.sizes()))
            .map(|(device, (offset, &size))| device.array_from_slice(&data[offset..offset + size]))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            ordinals: ordinals(devices, &mapping),
            mapping,
            shards,
        })
    }

    pub fn zeroed(devices: &[D], mapping: ShardMapping) -> Result<Self> {
        check_devices(devices, &mapping)?;
        let shards = devices
            .iter()
            .zip(mapping.sizes())
            .map(|(device, &size)| device.zeroed_array(size))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            ordinals: ordinals(devices, &mapping),
            mapping,
            shards,
        })
    }

    pub fn mapping(&self) -> &ShardMapping {
        &self.mapping
    }

    /// Ordinals of the devices the shards were created on, in shard order.
    pub fn device_ordinals(&self) -> &[usize] {
        &self.ordinals
    }

    pub fn shard(&self, device: usize) -> Option<&D::Array<T>> {
        self.shards.get(device)
    }

    pub fn shard_mut(&mut self, device: usize) -> Option<&mut D::Array<T>> {
        self.shards.get_mut(device)
    }

    /// Concatenates the shards in device order. Synchronize first.
    pub fn to_host(&self) -> Result<Vec<T>> {
        Ok(self
            .shards
            .iter()
            .map(|shard| shard.to_host())
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .concat())
    }

    fn placement(&self) -> Placement<'_> {
        Placement {
            mapping: &self.mapping,
            ordinals: &self.ordinals,
            lens: self.shards.iter().map(|shard| shard.len()).collect(),
        }
    }
}

/// Where an argument's shards live, as seen by the dispatcher's checks.
struct Placement<'p> {
    mapping: &'p ShardMapping,
    ordinals: &'p [usize],
    lens: Vec<usize>,
}

fn ordinals<D: Device>(devices: &[D], mapping: &ShardMapping) -> Vec<usize> {
    devices
        .iter()
        .take(mapping.num_devices())
        .map(D::ordinal)
        .collect()
}

fn check_devices<D: Device>(devices: &[D], mapping: &ShardMapping) -> Result<()> {
    if mapping.num_devices() > devices.len() {
        return Err(ScanError::ShardingMismatch(format!(
            "{} shards for {} devices",
            mapping.num_devices(),
            devices.len()
        )));
    }
    Ok(())
}

/// One launch of a distributed operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlanEntry {
    pub device: usize,
    pub len: usize,
}

/// The per-device launches of one operation: one entry for every device with
/// a non-empty shard.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DevicePlan {
    entries: Vec<PlanEntry>,
}

impl DevicePlan {
    pub fn new(mapping: &ShardMapping) -> Self {
        Self {
            entries: mapping
                .non_empty_devices()
                .map(|device| PlanEntry {
                    device,
                    len: mapping.sizes()[device],
                })
                .collect(),
        }
    }

    pub fn entries(&self) -> &[PlanEntry] {
        &self.entries
    }
}

pub struct Dispatcher<'a, D: Device> {
    devices: &'a [D],
}

impl<'a, D: Device> Dispatcher<'a, D> {
    pub fn new(devices: &'a [D]) -> Self {
        Self { devices }
    }

    pub fn devices(&self) -> &'a [D] {
        self.devices
    }

    pub fn scan<T: ScanElement>(
        &self,
        input: &DistributedArray<T, D>,
        output: &mut DistributedArray<T, D>,
        inclusive: bool,
        stream_id: usize,
    ) -> Result<()> {
        let plan = self.plan(
            "scan",
            input.placement(),
            &[output.placement()],
            &[],
            stream_id,
        )?;
        for entry in plan.entries() {
            let device = &self.devices[entry.device];
            scan::scan(
                device,
                device.stream(stream_id)?,
                &input.shards[entry.device],
                &mut output.shards[entry.device],
                inclusive,
            )?;
        }
        Ok(())
    }

    pub fn inclusive_segmented_scan_non_negative<T: SegmentElement>(
        &self,
        input: &DistributedArray<T, D>,
        output: &mut DistributedArray<T, D>,
        stream_id: usize,
    ) -> Result<()> {
        self.segmented_scan_non_negative(input, output, true, stream_id)
    }

    /// Segment heads do not cross shards: each shard starts a fresh segment.
    pub fn segmented_scan_non_negative<T: SegmentElement>(
        &self,
        input: &DistributedArray<T, D>,
        output: &mut DistributedArray<T, D>,
        inclusive: bool,
        stream_id: usize,
    ) -> Result<()> {
        if !inclusive {
            return Err(ScanError::ExclusiveSegmentedScan);
        }
        let plan = self.plan(
            "segmented scan",
            input.placement(),
            &[output.placement()],
            &[],
            stream_id,
        )?;
        for entry in plan.entries() {
            let device = &self.devices[entry.device];
            scan::segmented_scan_non_negative(
                device,
                device.stream(stream_id)?,
                &input.shards[entry.device],
                &mut output.shards[entry.device],
                inclusive,
            )?;
        }
        Ok(())
    }

    /// Indices are local to each shard: shard `i` scatters into the output
    /// shard on device `i`, whose size may differ from the input shard's.
    pub fn segmented_scan_and_scatter_non_negative<T: SegmentElement>(
        &self,
        input: &DistributedArray<T, D>,
        indices: &DistributedArray<u32, D>,
        output: &mut DistributedArray<T, D>,
        inclusive: bool,
        stream_id: usize,
    ) -> Result<()> {
        if output.mapping().num_devices() != input.mapping().num_devices() {
            return Err(ScanError::ShardingMismatch(format!(
                "output over {} devices, input over {}",
                output.mapping().num_devices(),
                input.mapping().num_devices()
            )));
        }
        let plan = self.plan(
            "segmented scan and scatter",
            input.placement(),
            &[indices.placement()],
            &[output.placement()],
            stream_id,
        )?;
        for entry in plan.entries() {
            let device = &self.devices[entry.device];
            scan::segmented_scan_and_scatter_non_negative(
                device,
                device.stream(stream_id)?,
                &input.shards[entry.device],
                &indices.shards[entry.device],
                &mut output.shards[entry.device],
                inclusive,
            )?;
        }
        Ok(())
    }

    /// Waits for stream `stream_id` on every device and returns the first
    /// failure, after waiting for all of them.
    pub fn synchronize(&self, stream_id: usize) -> Result<()> {
        let mut first = None;
        for device in self.devices {
            if let Err(e) = device.stream(stream_id).and_then(|s| s.synchronize()) {
                log::warn!("device {}: {}", device.ordinal(), e);
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Checks every argument and stream before anything is enqueued.
    ///
    /// `matching` arguments must be sharded exactly like `input`; `placed`
    /// ones only have to live on the same devices.
    fn plan(
        &self,
        operation: &str,
        input: Placement<'_>,
        matching: &[Placement<'_>],
        placed: &[Placement<'_>],
        stream_id: usize,
    ) -> Result<DevicePlan> {
        check_devices(self.devices, input.mapping)?;
        if let Some(other) = matching.iter().find(|other| other.mapping != input.mapping) {
            return Err(ScanError::ShardingMismatch(format!(
                "{:?} vs {:?}",
                input.mapping.sizes(),
                other.mapping.sizes()
            )));
        }
        for placement in iter::once(&input).chain(matching).chain(placed) {
            self.check_ordinals(placement.ordinals)?;
        }

        let plan = DevicePlan::new(input.mapping);
        for entry in plan.entries() {
            // Shards can be swapped out through `shard_mut`.
            for placement in iter::once(&input).chain(matching) {
                let actual = placement.lens[entry.device];
                if actual != entry.len {
                    return Err(ScanError::LengthMismatch {
                        expected: entry.len,
                        actual,
                    });
                }
            }
            self.devices[entry.device].stream(stream_id)?;
        }
        log::debug!(
            "{} on stream {}: {:?}",
            operation,
            stream_id,
            plan.entries()
        );
        Ok(plan)
    }

    fn check_ordinals(&self, ordinals: &[usize]) -> Result<()> {
        for (shard, &ordinal) in ordinals.iter().enumerate() {
            let dispatched = self.devices.get(shard).map(D::ordinal);
            if dispatched != Some(ordinal) {
                return Err(ScanError::ShardingMismatch(format!(
                    "shard {} lives on device {}, dispatching to {:?}",
                    shard, ordinal, dispatched
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{DevicePlan, DistributedArray, Dispatcher, PlanEntry, ShardMapping, DEFAULT_STREAM};
    use crate::config::ScanConfig;
    use crate::device::Device;
    use crate::error::ScanError;
    use crate::host::HostDevice;
    use crate::sequential::inclusive_scan;

    fn devices(count: usize) -> Vec<HostDevice> {
        HostDevice::set(count, &ScanConfig::default()).unwrap()
    }

    #[test]
    fn shard_mapping_test() {
        let mapping = ShardMapping::stripe(10, 3);
        assert_eq!(mapping.sizes(), &[4, 3, 3]);
        assert_eq!(mapping.offsets(), vec![0, 4, 7]);
        assert_eq!(mapping.total_len(), 10);

        let mapping = ShardMapping::from_sizes(vec![0, 5, 0, 2]);
        assert_eq!(mapping.non_empty_devices().collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(
            DevicePlan::new(&mapping).entries(),
            &[
                PlanEntry { device: 1, len: 5 },
                PlanEntry { device: 3, len: 2 }
            ]
        );
        assert_eq!(ShardMapping::single(7).sizes(), &[7]);
    }

    #[test]
    fn no_carry_between_devices_test() {
        let devices = devices(2);
        let dispatcher = Dispatcher::new(&devices);
        let xs: Vec<u32> = (1..=8).collect();
        let mapping = ShardMapping::stripe(xs.len(), devices.len());
        let input = DistributedArray::from_slice(&devices, mapping.clone(), &xs).unwrap();
        let mut output = DistributedArray::zeroed(&devices, mapping).unwrap();

        dispatcher
            .scan(&input, &mut output, true, DEFAULT_STREAM)
            .unwrap();
        dispatcher.synchronize(DEFAULT_STREAM).unwrap();
        let ys = output.to_host().unwrap();
        assert_eq!(ys, vec![1, 3, 6, 10, 5, 11, 18, 26]);
        assert_ne!(ys, inclusive_scan(&xs));

        dispatcher
            .scan(&input, &mut output, false, DEFAULT_STREAM)
            .unwrap();
        dispatcher.synchronize(DEFAULT_STREAM).unwrap();
        assert_eq!(output.to_host().unwrap(), vec![0, 1, 3, 6, 0, 5, 11, 18]);
    }

    #[test]
    fn segmented_scan_per_device_test() {
        let devices = devices(2);
        let dispatcher = Dispatcher::new(&devices);
        let mapping = ShardMapping::from_sizes(vec![3, 3]);
        let input =
            DistributedArray::from_slice(&devices, mapping.clone(), &[5i32, -3, 2, 1, -1, 4])
                .unwrap();
        let mut output = DistributedArray::zeroed(&devices, mapping).unwrap();

        dispatcher
            .inclusive_segmented_scan_non_negative(&input, &mut output, 1)
            .unwrap();
        dispatcher.synchronize(1).unwrap();
        // The second shard starts a fresh segment at its first element.
        assert_eq!(output.to_host().unwrap(), vec![5, 3, 5, 1, 1, 5]);

        assert!(matches!(
            dispatcher.segmented_scan_non_negative(&input, &mut output, false, 1),
            Err(ScanError::ExclusiveSegmentedScan)
        ));
    }

    #[test]
    fn scatter_per_device_test() {
        let devices = devices(2);
        let dispatcher = Dispatcher::new(&devices);
        let mapping = ShardMapping::from_sizes(vec![2, 3]);
        let input =
            DistributedArray::from_slice(&devices, mapping.clone(), &[1.0f64, 2.0, -1.0, 1.0, 1.0])
                .unwrap();
        let indices =
            DistributedArray::from_slice(&devices, mapping, &[1u32, 0, 2, 1, 0]).unwrap();
        let mut output =
            DistributedArray::zeroed(&devices, ShardMapping::from_sizes(vec![2, 3])).unwrap();

        dispatcher
            .segmented_scan_and_scatter_non_negative(&input, &indices, &mut output, true, 0)
            .unwrap();
        dispatcher.synchronize(0).unwrap();
        assert_eq!(output.to_host().unwrap(), vec![3.0, 1.0, 3.0, 2.0, 1.0]);
    }

    #[test]
    fn sharding_mismatch_enqueues_nothing_test() {
        let devices = devices(2);
        let dispatcher = Dispatcher::new(&devices);
        let input =
            DistributedArray::from_slice(&devices, ShardMapping::stripe(8, 2), &[1u64; 8]).unwrap();
        let mut output =
            DistributedArray::zeroed(&devices, ShardMapping::from_sizes(vec![5, 3])).unwrap();

        assert!(matches!(
            dispatcher.scan(&input, &mut output, true, DEFAULT_STREAM),
            Err(ScanError::ShardingMismatch(_))
        ));
        dispatcher.synchronize(DEFAULT_STREAM).unwrap();
        assert_eq!(output.to_host().unwrap(), vec![0; 8]);
    }

    #[test]
    fn unknown_stream_enqueues_nothing_test() {
        let devices = devices(2);
        let dispatcher = Dispatcher::new(&devices);
        let mapping = ShardMapping::stripe(4, 2);
        let input = DistributedArray::from_slice(&devices, mapping.clone(), &[1i64; 4]).unwrap();
        let mut output = DistributedArray::zeroed(&devices, mapping).unwrap();

        assert!(matches!(
            dispatcher.scan(&input, &mut output, true, 9),
            Err(ScanError::UnknownStream {
                device: 0,
                stream: 9
            })
        ));
        assert_eq!(output.to_host().unwrap(), vec![0; 4]);
    }

    #[test]
    fn empty_shards_are_skipped_test() {
        let devices = devices(3);
        let dispatcher = Dispatcher::new(&devices);
        let mapping = ShardMapping::from_sizes(vec![0, 3]);
        let input =
            DistributedArray::from_slice(&devices, mapping.clone(), &[1.0f32, 2.0, 3.0]).unwrap();
        let mut output = DistributedArray::zeroed(&devices, mapping).unwrap();
        assert!(output.shard(0).is_some());
        assert!(output.shard(2).is_none());

        dispatcher
            .scan(&input, &mut output, true, DEFAULT_STREAM)
            .unwrap();
        dispatcher.synchronize(DEFAULT_STREAM).unwrap();
        assert_eq!(output.to_host().unwrap(), vec![1.0, 3.0, 6.0]);
    }

    #[test]
    fn replaced_shard_enqueues_nothing_test() {
        let devices = devices(2);
        let dispatcher = Dispatcher::new(&devices);
        let mapping = ShardMapping::stripe(8, 2);
        let mut input = DistributedArray::from_slice(&devices, mapping.clone(), &[1u32; 8]).unwrap();
        let mut output = DistributedArray::zeroed(&devices, mapping).unwrap();
        *input.shard_mut(1).unwrap() = devices[1].array_from_slice(&[1u32; 2]).unwrap();

        assert!(matches!(
            dispatcher.scan(&input, &mut output, true, DEFAULT_STREAM),
            Err(ScanError::LengthMismatch {
                expected: 4,
                actual: 2
            })
        ));
        dispatcher.synchronize(DEFAULT_STREAM).unwrap();
        assert_eq!(output.to_host().unwrap(), vec![0; 8]);
    }

    #[test]
    fn arrays_from_other_devices_are_rejected_test() {
        let devices = devices(2);
        let mapping = ShardMapping::stripe(6, 2);
        let input = DistributedArray::from_slice(&devices, mapping.clone(), &[2i32; 6]).unwrap();
        let mut output = DistributedArray::zeroed(&devices, mapping).unwrap();
        assert_eq!(input.device_ordinals(), &[0, 1]);

        let config = ScanConfig::default();
        let swapped = vec![
            HostDevice::new(1, &config).unwrap(),
            HostDevice::new(0, &config).unwrap(),
        ];
        let dispatcher = Dispatcher::new(&swapped);
        assert!(matches!(
            dispatcher.scan(&input, &mut output, true, DEFAULT_STREAM),
            Err(ScanError::ShardingMismatch(_))
        ));
        assert!(matches!(
            dispatcher.inclusive_segmented_scan_non_negative(&input, &mut output, DEFAULT_STREAM),
            Err(ScanError::ShardingMismatch(_))
        ));
        assert_eq!(output.to_host().unwrap(), vec![0; 6]);
    }

    #[test]
    fn too_many_shards_test() {
        let devices = devices(1);
        assert!(matches!(
            DistributedArray::<u32, _>::zeroed(&devices, ShardMapping::stripe(4, 2)),
            Err(ScanError::ShardingMismatch(_))
        ));
    }
}

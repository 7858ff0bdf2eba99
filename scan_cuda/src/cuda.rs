//! CUDA devices driven through `cust`.
//!
//! The kernels come from the `scan_gpu` crate, compiled to PTX by `build.rs`.
//! Every launch enqueues its scratch allocation, the level passes and the
//! scratch release on the same stream, in that order.

use crate::config::ScanConfig;
use crate::context::ScanContext;
use crate::device::{Device, DeviceArray, ExecutionStream};
use crate::element::{ScanElement, SegmentElement};
use crate::error::{Result, ScanError};
use crate::plan::Level;
use cust::context::{Context, CurrentContext};
use cust::device::Device as CudaHandle;
use cust::error::{CudaError, CudaResult};
use cust::function::Function;
use cust::launch;
use cust::memory::{mem_get_info, CopyDestination, DeviceBuffer, DevicePointer};
use cust::module::Module;
use cust::stream::{Stream, StreamFlags};
use cust::CudaFlags;
use scan_gpu::BLOCK_SIZE;
use std::mem;
use std::sync::Arc;

static PTX: &str = include_str!("../../resources/scan_gpu.ptx");

fn failed(device: usize) -> impl Fn(CudaError) -> ScanError {
    move |e| ScanError::device(device, e)
}

pub struct CudaStream {
    inner: Stream,
    device: usize,
}

impl ExecutionStream for CudaStream {
    fn synchronize(&self) -> Result<()> {
        self.inner.synchronize().map_err(failed(self.device))
    }
}

pub struct CudaArray<T: ScanElement> {
    buf: DeviceBuffer<T>,
    context: Arc<Context>,
    device: usize,
}

impl<T: ScanElement> DeviceArray<T> for CudaArray<T> {
    fn len(&self) -> usize {
        self.buf.len()
    }

    fn to_host(&self) -> Result<Vec<T>> {
        CurrentContext::set_current(&*self.context).map_err(failed(self.device))?;
        let mut host = vec![T::ZERO; self.buf.len()];
        self.buf.copy_to(&mut host).map_err(failed(self.device))?;
        Ok(host)
    }
}

/// Scratch bytes; empty scans own no allocation.
pub struct CudaScratch {
    buf: Option<DeviceBuffer<u8>>,
}

impl CudaScratch {
    /// Pointer to element `offset` of the scratch viewed as `T`.
    fn at<T: ScanElement>(&self, offset: usize) -> DevicePointer<T> {
        match &self.buf {
            Some(buf) => DevicePointer::from_raw(
                buf.as_device_ptr().as_raw() + (offset * mem::size_of::<T>()) as u64,
            ),
            None => DevicePointer::null(),
        }
    }
}

pub struct CudaDevice {
    ordinal: usize,
    module: Module,
    streams: Vec<CudaStream>,
    mem_check: bool,
    // Dropped last, after everything created in it.
    context: Arc<Context>,
}

impl CudaDevice {
    pub fn new(ordinal: usize, config: &ScanConfig) -> Result<Self> {
        cust::init(CudaFlags::empty()).map_err(failed(ordinal))?;
        let device = CudaHandle::get_device(ordinal as u32).map_err(failed(ordinal))?;
        let context = Arc::new(Context::new(device).map_err(failed(ordinal))?);
        let module = Module::from_ptx(PTX, &[]).map_err(failed(ordinal))?;
        let streams = (0..config.streams_per_device)
            .map(|_| {
                Stream::new(StreamFlags::NON_BLOCKING, None).map(|inner| CudaStream {
                    inner,
                    device: ordinal,
                })
            })
            .collect::<CudaResult<Vec<_>>>()
            .map_err(failed(ordinal))?;

        log::debug!(
            "device {}: CUDA context with {} streams",
            ordinal,
            streams.len()
        );
        Ok(Self {
            ordinal,
            module,
            streams,
            mem_check: config.mem_check,
            context,
        })
    }

    /// Opens every visible CUDA device.
    pub fn all(config: &ScanConfig) -> Result<Vec<Self>> {
        cust::init(CudaFlags::empty()).map_err(failed(0))?;
        let count = CudaHandle::num_devices().map_err(failed(0))?;
        (0..count as usize)
            .map(|ordinal| Self::new(ordinal, config))
            .collect()
    }

    fn make_current(&self) -> Result<()> {
        CurrentContext::set_current(&*self.context).map_err(failed(self.ordinal))
    }

    fn function<T: ScanElement>(&self, kernel: &str) -> Result<Function<'_>> {
        self.module
            .get_function(&format!("{}_{}", kernel, T::NAME))
            .map_err(failed(self.ordinal))
    }

    /// Pointer to the values scanned at level `k`: `base` for the first level,
    /// the totals of the level below otherwise.
    fn level_values<T: ScanElement>(
        levels: &[Level],
        k: usize,
        base: DevicePointer<T>,
        scratch: &CudaScratch,
    ) -> DevicePointer<T> {
        if k == 0 {
            base
        } else {
            scratch.at(levels[k - 1].totals.start)
        }
    }

    /// Block-local scans of every level, bottom up.
    #[allow(clippy::too_many_arguments)]
    fn up_sweep<T: ScanElement>(
        &self,
        stream: &Stream,
        function: &Function<'_>,
        levels: &[Level],
        input: DevicePointer<T>,
        base: DevicePointer<T>,
        scratch: &CudaScratch,
        exclusive: Option<bool>,
    ) -> Result<()> {
        for (k, level) in levels.iter().enumerate() {
            let src = if k == 0 {
                input
            } else {
                Self::level_values(levels, k, base, scratch)
            };
            let dst = Self::level_values(levels, k, base, scratch);
            let totals = scratch.at::<T>(level.totals.start);
            let grid = level.blocks as u32;
            let len = level.len;
            log::trace!("device {}: level {} scan, {} blocks", self.ordinal, k, grid);
            let launched = unsafe {
                match exclusive {
                    Some(exclusive) => {
                        let exclusive = exclusive && k == 0;
                        launch!(
                            function<<<grid, BLOCK_SIZE as u32, 0, stream>>>(
                                src, dst, len, totals, exclusive
                            )
                        )
                    }
                    None => launch!(
                        function<<<grid, BLOCK_SIZE as u32, 0, stream>>>(src, dst, len, totals)
                    ),
                }
            };
            launched.map_err(failed(self.ordinal))?;
        }
        Ok(())
    }

    /// Segmented carries from the top level down to `lowest`.
    fn segmented_down_sweep<T: SegmentElement>(
        &self,
        stream: &Stream,
        levels: &[Level],
        base: DevicePointer<T>,
        scratch: &CudaScratch,
        lowest: usize,
    ) -> Result<()> {
        let strip = self.function::<T>("strip_block_carries")?;
        for k in (lowest..levels.len()).rev() {
            let level = &levels[k];
            if level.is_last() && k > 0 {
                continue;
            }
            let values = Self::level_values(levels, k, base, scratch);
            let carries = scratch.at::<T>(level.totals.start);
            let has_carries = !level.is_last();
            let grid = level.blocks as u32;
            let len = level.len;
            unsafe {
                launch!(
                    strip<<<grid, BLOCK_SIZE as u32, 0, stream>>>(values, len, carries, has_carries)
                )
                .map_err(failed(self.ordinal))?;
            }
        }
        Ok(())
    }

    fn release(&self, scratch: CudaScratch, stream: &Stream) -> Result<()> {
        match scratch.buf {
            Some(buf) => buf.drop_async(stream).map_err(failed(self.ordinal)),
            None => Ok(()),
        }
    }
}

impl Device for CudaDevice {
    type Stream = CudaStream;
    type Array<T: ScanElement> = CudaArray<T>;
    type Scratch = CudaScratch;

    fn ordinal(&self) -> usize {
        self.ordinal
    }

    fn stream(&self, id: usize) -> Result<&CudaStream> {
        self.streams.get(id).ok_or(ScanError::UnknownStream {
            device: self.ordinal,
            stream: id,
        })
    }

    fn array_from_slice<T: ScanElement>(&self, data: &[T]) -> Result<CudaArray<T>> {
        self.make_current()?;
        Ok(CudaArray {
            buf: DeviceBuffer::from_slice(data).map_err(failed(self.ordinal))?,
            context: Arc::clone(&self.context),
            device: self.ordinal,
        })
    }

    fn zeroed_array<T: ScanElement>(&self, len: usize) -> Result<CudaArray<T>> {
        self.array_from_slice(&vec![T::ZERO; len])
    }

    fn allocate_scratch(&self, stream: &CudaStream, bytes: usize) -> Result<CudaScratch> {
        if bytes == 0 {
            return Ok(CudaScratch { buf: None });
        }
        self.make_current()?;
        let out_of_memory = |available| ScanError::OutOfMemory {
            device: self.ordinal,
            requested: bytes,
            available,
        };
        if self.mem_check {
            if let Ok((free, _total)) = mem_get_info() {
                if bytes > free {
                    return Err(out_of_memory(free));
                }
            }
        }

        let buf = unsafe { DeviceBuffer::uninitialized_async(bytes, &stream.inner) }.map_err(
            |e| match e {
                CudaError::OutOfMemory => out_of_memory(0),
                e => ScanError::device(self.ordinal, e),
            },
        )?;
        Ok(CudaScratch { buf: Some(buf) })
    }

    fn launch_scan<T: ScanElement>(
        &self,
        stream: &CudaStream,
        input: &CudaArray<T>,
        output: &mut CudaArray<T>,
        inclusive: bool,
        context: ScanContext<Self, T>,
    ) -> Result<()> {
        self.make_current()?;
        let (plan, scratch) = context.into_parts();
        let levels = plan.levels();
        let s = &stream.inner;
        let base = output.buf.as_device_ptr();

        let scan_blocks = self.function::<T>("scan_blocks")?;
        self.up_sweep(
            s,
            &scan_blocks,
            levels,
            input.buf.as_device_ptr(),
            base,
            &scratch,
            Some(!inclusive),
        )?;

        let add_carries = self.function::<T>("add_block_carries")?;
        for (k, level) in levels.iter().enumerate().rev() {
            if level.is_last() {
                continue;
            }
            let values = Self::level_values(levels, k, base, &scratch);
            let carries = scratch.at::<T>(level.totals.start);
            let grid = level.blocks as u32;
            let len = level.len;
            unsafe {
                launch!(add_carries<<<grid, BLOCK_SIZE as u32, 0, s>>>(values, len, carries))
                    .map_err(failed(self.ordinal))?;
            }
        }

        self.release(scratch, s)
    }

    fn launch_segmented_scan<T: SegmentElement>(
        &self,
        stream: &CudaStream,
        input: &CudaArray<T>,
        output: &mut CudaArray<T>,
        context: ScanContext<Self, T>,
    ) -> Result<()> {
        self.make_current()?;
        let (plan, scratch) = context.into_parts();
        let levels = plan.levels();
        let s = &stream.inner;
        let base = output.buf.as_device_ptr();

        let scan_blocks = self.function::<T>("segmented_scan_blocks")?;
        self.up_sweep(
            s,
            &scan_blocks,
            levels,
            input.buf.as_device_ptr(),
            base,
            &scratch,
            None,
        )?;
        self.segmented_down_sweep(s, levels, base, &scratch, 0)?;

        self.release(scratch, s)
    }

    fn launch_segmented_scan_and_scatter<T: SegmentElement>(
        &self,
        stream: &CudaStream,
        input: &CudaArray<T>,
        indices: &CudaArray<u32>,
        output: &mut CudaArray<T>,
        inclusive: bool,
        context: ScanContext<Self, T>,
    ) -> Result<()> {
        self.make_current()?;
        let (plan, scratch) = context.into_parts();
        let levels = plan.levels();
        let s = &stream.inner;
        let staged = scratch.at::<T>(plan.staging().map_or(0, |staging| staging.start));
        let input_ptr = input.buf.as_device_ptr();

        let scan_blocks = self.function::<T>("segmented_scan_blocks")?;
        self.up_sweep(s, &scan_blocks, levels, input_ptr, staged, &scratch, None)?;
        self.segmented_down_sweep(s, levels, staged, &scratch, 1)?;

        if let Some(level) = levels.first() {
            let scatter = self.function::<T>("scatter_block_carries")?;
            let indices_ptr = indices.buf.as_device_ptr();
            let output_ptr = output.buf.as_device_ptr();
            let carries = scratch.at::<T>(level.totals.start);
            let has_carries = !level.is_last();
            let exclusive = !inclusive;
            let grid = level.blocks as u32;
            let len = level.len;
            unsafe {
                launch!(
                    scatter<<<grid, BLOCK_SIZE as u32, 0, s>>>(
                        staged,
                        input_ptr,
                        indices_ptr,
                        output_ptr,
                        len,
                        carries,
                        has_carries,
                        exclusive
                    )
                )
                .map_err(failed(self.ordinal))?;
            }
        }

        self.release(scratch, s)
    }
}

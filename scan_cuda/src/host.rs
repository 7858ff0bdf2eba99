//! A simulated accelerator that runs on the host.
//!
//! Each stream owns a worker thread that runs enqueued work in order, so a
//! launch returns as soon as its work is queued, exactly like a CUDA stream.
//! Inside one launch the blocks of a level run in parallel on the rayon pool
//! and go through the same passes as the CUDA kernels.

use crate::config::ScanConfig;
use crate::context::ScanContext;
use crate::device::{Device, DeviceArray, ExecutionStream};
use crate::element::{ScanElement, SegmentElement};
use crate::error::{Result, ScanError};
use crate::plan::Level;
use crate::sequential::scan_in_place;
use rayon::prelude::*;
use scan_gpu::BLOCK_SIZE;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, JoinHandle};

type Task = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Task),
    Fence(Sender<()>),
}

pub struct HostStream {
    device: usize,
    sender: Option<Sender<Message>>,
    failure: Arc<Mutex<Option<String>>>,
    worker: Option<JoinHandle<()>>,
}

impl HostStream {
    fn new(device: usize, id: usize) -> Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let failure = Arc::new(Mutex::new(None));
        let worker_failure = Arc::clone(&failure);
        let worker = thread::Builder::new()
            .name(format!("scan-dev{}-stream{}", device, id))
            .spawn(move || run_worker(receiver, worker_failure))
            .map_err(|e| ScanError::device(device, e))?;

        Ok(Self {
            device,
            sender: Some(sender),
            failure,
            worker: Some(worker),
        })
    }

    /// Queues `task` behind everything already on the stream.
    pub(crate) fn enqueue(&self, task: impl FnOnce() + Send + 'static) -> Result<()> {
        self.sender
            .as_ref()
            .and_then(|sender| sender.send(Message::Run(Box::new(task))).ok())
            .ok_or_else(|| ScanError::device(self.device, "stream worker has exited"))
    }
}

impl ExecutionStream for HostStream {
    fn synchronize(&self) -> Result<()> {
        let (done, wait) = mpsc::channel();
        self.sender
            .as_ref()
            .and_then(|sender| sender.send(Message::Fence(done)).ok())
            .and_then(|_| wait.recv().ok())
            .ok_or_else(|| ScanError::device(self.device, "stream worker has exited"))?;

        match lock(&self.failure).clone() {
            Some(status) => Err(ScanError::device(self.device, status)),
            None => Ok(()),
        }
    }
}

impl Drop for HostStream {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain the queue and exit.
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Runs tasks in order. The first panic is recorded and, like a CUDA stream
/// error, sticks: later tasks are skipped.
fn run_worker(receiver: Receiver<Message>, failure: Arc<Mutex<Option<String>>>) {
    for message in receiver {
        match message {
            Message::Run(task) => {
                if lock(&failure).is_some() {
                    continue;
                }
                if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(task)) {
                    *lock(&failure) = Some(panic_status(panic.as_ref()));
                }
            }
            Message::Fence(done) => {
                let _ = done.send(());
            }
        }
    }
}

fn panic_status(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "kernel panicked".to_string()
    }
}

/// An array in host memory standing in for device memory. Handles shared
/// with enqueued work point at the same storage.
pub struct HostArray<T> {
    data: Arc<RwLock<Vec<T>>>,
    len: usize,
}

impl<T> HostArray<T> {
    fn new(data: Vec<T>) -> Self {
        Self {
            len: data.len(),
            data: Arc::new(RwLock::new(data)),
        }
    }

    pub(crate) fn share(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
            len: self.len,
        }
    }

    fn aliases(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

impl<T: Clone> DeviceArray<T> for HostArray<T> {
    fn len(&self) -> usize {
        self.len
    }

    fn to_host(&self) -> Result<Vec<T>> {
        Ok(read(&self.data).clone())
    }
}

/// Scratch words; a `u64` backing keeps every element type aligned.
pub struct HostScratch {
    words: Vec<u64>,
    bytes: usize,
    in_use: Arc<AtomicUsize>,
}

impl HostScratch {
    fn elements<T: bytemuck::Pod>(&mut self) -> &mut [T] {
        bytemuck::cast_slice_mut(&mut self.words)
    }
}

impl Drop for HostScratch {
    fn drop(&mut self) {
        self.in_use.fetch_sub(self.bytes, Ordering::SeqCst);
    }
}

pub struct HostDevice {
    ordinal: usize,
    streams: Vec<HostStream>,
    memory_limit: Option<usize>,
    scratch_in_use: Arc<AtomicUsize>,
}

impl HostDevice {
    pub fn new(ordinal: usize, config: &ScanConfig) -> Result<Self> {
        let streams = (0..config.streams_per_device)
            .map(|id| HostStream::new(ordinal, id))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            ordinal,
            streams,
            memory_limit: config.memory_limit,
            scratch_in_use: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Creates devices `0..count`.
    pub fn set(count: usize, config: &ScanConfig) -> Result<Vec<Self>> {
        (0..count).map(|ordinal| Self::new(ordinal, config)).collect()
    }

    /// Bytes of scratch held by launches that have not finished yet.
    pub fn scratch_in_use(&self) -> usize {
        self.scratch_in_use.load(Ordering::SeqCst)
    }
}

impl Device for HostDevice {
    type Stream = HostStream;
    type Array<T: ScanElement> = HostArray<T>;
    type Scratch = HostScratch;

    fn ordinal(&self) -> usize {
        self.ordinal
    }

    fn stream(&self, id: usize) -> Result<&HostStream> {
        self.streams.get(id).ok_or(ScanError::UnknownStream {
            device: self.ordinal,
            stream: id,
        })
    }

    fn array_from_slice<T: ScanElement>(&self, data: &[T]) -> Result<HostArray<T>> {
        Ok(HostArray::new(data.to_vec()))
    }

    fn zeroed_array<T: ScanElement>(&self, len: usize) -> Result<HostArray<T>> {
        Ok(HostArray::new(vec![T::ZERO; len]))
    }

    fn allocate_scratch(&self, _stream: &HostStream, bytes: usize) -> Result<HostScratch> {
        let previous = self.scratch_in_use.fetch_add(bytes, Ordering::SeqCst);
        let out_of_memory = |available| ScanError::OutOfMemory {
            device: self.ordinal,
            requested: bytes,
            available,
        };
        if let Some(limit) = self.memory_limit {
            if previous + bytes > limit {
                self.scratch_in_use.fetch_sub(bytes, Ordering::SeqCst);
                return Err(out_of_memory(limit.saturating_sub(previous)));
            }
        }

        let word_count = (bytes + 7) / 8;
        let mut words = Vec::new();
        if words.try_reserve_exact(word_count).is_err() {
            self.scratch_in_use.fetch_sub(bytes, Ordering::SeqCst);
            return Err(out_of_memory(0));
        }
        words.resize(word_count, 0);

        Ok(HostScratch {
            words,
            bytes,
            in_use: Arc::clone(&self.scratch_in_use),
        })
    }

    fn launch_scan<T: ScanElement>(
        &self,
        stream: &HostStream,
        input: &HostArray<T>,
        output: &mut HostArray<T>,
        inclusive: bool,
        context: ScanContext<Self, T>,
    ) -> Result<()> {
        let (plan, mut scratch) = context.into_parts();
        let aliased = input.aliases(output);
        let (input, output) = (input.share(), output.share());
        log::trace!(
            "device {}: enqueue scan of {} elements",
            self.ordinal,
            plan.len()
        );

        stream.enqueue(move || {
            let source = (!aliased).then(|| snapshot(&input));
            let mut values = write(&output.data);
            if let Some(source) = source {
                values.copy_from_slice(&source);
            }
            run_scan(plan.levels(), &mut values, scratch.elements(), !inclusive);
        })
    }

    fn launch_segmented_scan<T: SegmentElement>(
        &self,
        stream: &HostStream,
        input: &HostArray<T>,
        output: &mut HostArray<T>,
        context: ScanContext<Self, T>,
    ) -> Result<()> {
        let (plan, mut scratch) = context.into_parts();
        let aliased = input.aliases(output);
        let (input, output) = (input.share(), output.share());
        log::trace!(
            "device {}: enqueue segmented scan of {} elements",
            self.ordinal,
            plan.len()
        );

        stream.enqueue(move || {
            let source = (!aliased).then(|| snapshot(&input));
            let mut values = write(&output.data);
            if let Some(source) = source {
                values.copy_from_slice(&source);
            }
            run_segmented_scan(plan.levels(), &mut values, scratch.elements());
        })
    }

    fn launch_segmented_scan_and_scatter<T: SegmentElement>(
        &self,
        stream: &HostStream,
        input: &HostArray<T>,
        indices: &HostArray<u32>,
        output: &mut HostArray<T>,
        inclusive: bool,
        context: ScanContext<Self, T>,
    ) -> Result<()> {
        let (plan, mut scratch) = context.into_parts();
        let (input, indices, output) = (input.share(), indices.share(), output.share());
        log::trace!(
            "device {}: enqueue segmented scan and scatter of {} elements",
            self.ordinal,
            plan.len()
        );

        stream.enqueue(move || {
            let values = snapshot(&input);
            let indices = snapshot(&indices);
            let mut out = write(&output.data);

            let staging = plan.staging().unwrap_or(0..0);
            let (parts, staged) = scratch.elements::<T>().split_at_mut(staging.start);
            run_segmented_scan_and_scatter(
                plan.levels(),
                &values,
                &indices,
                &mut out,
                parts,
                &mut staged[..staging.len()],
                !inclusive,
            );
        })
    }
}

/// Plain scan of `values` in place. `parts` must hold the totals of `levels`.
pub(crate) fn run_scan<T: ScanElement>(
    levels: &[Level],
    values: &mut [T],
    parts: &mut [T],
    exclusive: bool,
) {
    up_sweep(levels, values, parts, exclusive, T::accumulate);

    for k in (0..levels.len()).rev() {
        if levels[k].is_last() {
            continue;
        }
        let (values, carries) = level_slices(levels, k, values, parts);
        add_block_carries(values, carries);
    }
}

/// Inclusive segmented scan of sign-encoded `values` in place, leaving
/// magnitudes.
pub(crate) fn run_segmented_scan<T: SegmentElement>(
    levels: &[Level],
    values: &mut [T],
    parts: &mut [T],
) {
    up_sweep(levels, values, parts, false, T::combine_segmented);
    segmented_down_sweep(levels, values, parts, 0);
}

pub(crate) fn run_segmented_scan_and_scatter<T: SegmentElement>(
    levels: &[Level],
    input: &[T],
    indices: &[u32],
    output: &mut [T],
    parts: &mut [T],
    staged: &mut [T],
    exclusive: bool,
) {
    staged.copy_from_slice(input);
    up_sweep(levels, staged, parts, false, T::combine_segmented);
    segmented_down_sweep(levels, staged, parts, 1);

    // Level 0 is finished in staging, then written through the permutation.
    let carries = levels
        .first()
        .filter(|level| !level.is_last())
        .map(|level| &parts[level.totals.clone()]);
    strip_block_carries(staged, carries);
    for (i, &index) in indices.iter().enumerate() {
        output[index as usize] = if !exclusive {
            staged[i]
        } else if i == 0 || input[i].is_head() {
            T::ZERO
        } else {
            staged[i - 1]
        };
    }
}

fn up_sweep<T, F>(levels: &[Level], base: &mut [T], parts: &mut [T], exclusive: bool, op: F)
where
    T: ScanElement,
    F: Fn(T, T) -> T + Copy + Send + Sync,
{
    for k in 0..levels.len() {
        let (values, totals) = level_slices(levels, k, base, parts);
        // Only the input level is exclusive; block totals are always inclusive.
        scan_blocks(values, totals, exclusive && k == 0, op);
    }
}

/// Strips and carries every level from the top down to `lowest`.
fn segmented_down_sweep<T: SegmentElement>(
    levels: &[Level],
    base: &mut [T],
    parts: &mut [T],
    lowest: usize,
) {
    for k in (lowest..levels.len()).rev() {
        let level = &levels[k];
        // The top level only feeds carries, which are read as magnitudes.
        if level.is_last() && k > 0 {
            continue;
        }
        let (values, carries) = level_slices(levels, k, base, parts);
        strip_block_carries(values, Some(&*carries).filter(|_| !level.is_last()));
    }
}

/// The values scanned at level `k` and the region of that level's totals.
fn level_slices<'a, T>(
    levels: &[Level],
    k: usize,
    base: &'a mut [T],
    parts: &'a mut [T],
) -> (&'a mut [T], &'a mut [T]) {
    let totals = levels[k].totals.clone();
    if k == 0 {
        return (base, &mut parts[totals]);
    }
    let (lower, upper) = parts.split_at_mut(totals.start);
    (
        &mut lower[levels[k - 1].totals.clone()],
        &mut upper[..totals.len()],
    )
}

fn scan_blocks<T, F>(values: &mut [T], totals: &mut [T], exclusive: bool, op: F)
where
    T: ScanElement,
    F: Fn(T, T) -> T + Copy + Send + Sync,
{
    let block_totals: Vec<T> = values
        .par_chunks_mut(BLOCK_SIZE)
        .map(|block| scan_in_place(block, exclusive, op))
        .collect();
    if !totals.is_empty() {
        totals.copy_from_slice(&block_totals);
    }
}

fn add_block_carries<T: ScanElement>(values: &mut [T], carries: &[T]) {
    values
        .par_chunks_mut(BLOCK_SIZE)
        .enumerate()
        .skip(1)
        .for_each(|(b, block)| {
            let carry = carries[b - 1];
            block.iter_mut().for_each(|v| *v = v.accumulate(carry));
        });
}

/// Elements before the first head of their block take the preceding block's
/// carry; everything else just loses its head flag.
fn strip_block_carries<T: SegmentElement>(values: &mut [T], carries: Option<&[T]>) {
    values
        .par_chunks_mut(BLOCK_SIZE)
        .enumerate()
        .for_each(|(b, block)| {
            let carry = match carries {
                Some(carries) if b > 0 => carries[b - 1].magnitude(),
                _ => T::ZERO,
            };
            for v in block.iter_mut() {
                *v = if v.is_head() {
                    v.magnitude()
                } else {
                    v.accumulate(carry)
                };
            }
        });
}

/// Copies the array under a read lock that is released before returning, so
/// a task never waits for one lock while holding another.
fn snapshot<T: Clone>(array: &HostArray<T>) -> Vec<T> {
    read(&array.data).clone()
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

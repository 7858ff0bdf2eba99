use crate::element::{Element, SignEncoded};
use crate::step::doubling_strides;
use crate::BLOCK_SIZE;
use cuda_std::{kernel, shared_array, thread};

/// Scans the block of `input` owned by this thread block with the
/// Kogge-Stone algorithm and writes the block's total into `totals`.
///
/// `input` and `output` may be the same pointer: every thread reads its element
/// into shared memory before any thread writes. Totals are only written when
/// the launch has more than one block.
unsafe fn scan_block<T, F>(
    input: *const T,
    output: *mut T,
    len: usize,
    totals: *mut T,
    exclusive: bool,
    xys: *mut T,
    op: F,
) where
    T: Element,
    F: Fn(T, T) -> T,
{
    let t_idx = thread::thread_idx_x() as usize;
    let b_idx = thread::block_idx_x() as usize;
    let i = b_idx * BLOCK_SIZE + t_idx;

    // Threads past the end load the identity so that the block total is still
    // correct for a partial last block.
    *(&mut *xys.add(t_idx)) = if i < len { *input.add(i) } else { T::ZERO };

    for stride in doubling_strides(BLOCK_SIZE) {
        thread::sync_threads();
        let left = if t_idx >= stride {
            *xys.add(t_idx - stride)
        } else {
            T::ZERO
        };
        thread::sync_threads();
        if t_idx >= stride {
            *(&mut *xys.add(t_idx)) = op(left, *xys.add(t_idx));
        }
    }
    thread::sync_threads();

    if i < len {
        *(&mut *output.add(i)) = if !exclusive {
            *xys.add(t_idx)
        } else if t_idx > 0 {
            *xys.add(t_idx - 1)
        } else {
            T::ZERO
        };
    }

    if t_idx == BLOCK_SIZE - 1 && thread::grid_dim_x() > 1 {
        *(&mut *totals.add(b_idx)) = *xys.add(t_idx);
    }
}

unsafe fn add_block_carries<T: Element>(values: *mut T, len: usize, carries: *const T) {
    let b_idx = thread::block_idx_x() as usize;
    let i = b_idx * BLOCK_SIZE + thread::thread_idx_x() as usize;
    if b_idx == 0 || i >= len {
        return;
    }
    *(&mut *values.add(i)) = (*values.add(i)).accumulate(*carries.add(b_idx - 1));
}

/// The carry of a segmented block only reaches the elements before the block's
/// first head, which are exactly the ones still non-negative after the
/// block-local scan. `block` is the block that owns `value`.
#[inline(always)]
unsafe fn segmented_carry<T: SignEncoded>(
    value: T,
    block: usize,
    carries: *const T,
    has_carries: bool,
) -> T {
    if value.is_head() {
        value.magnitude()
    } else if has_carries && block > 0 {
        value.accumulate((*carries.add(block - 1)).magnitude())
    } else {
        value
    }
}

unsafe fn strip_block_carries<T: SignEncoded>(
    values: *mut T,
    len: usize,
    carries: *const T,
    has_carries: bool,
) {
    let b_idx = thread::block_idx_x() as usize;
    let i = b_idx * BLOCK_SIZE + thread::thread_idx_x() as usize;
    if i >= len {
        return;
    }
    *(&mut *values.add(i)) = segmented_carry(*values.add(i), b_idx, carries, has_carries);
}

/// Finishes level 0 from the staged block-local results and writes it through
/// `indices`. The exclusive result of `i` is the finished inclusive result of
/// `i - 1`, or zero at a segment head.
#[allow(clippy::too_many_arguments)]
unsafe fn scatter_block_carries<T: SignEncoded>(
    staged: *const T,
    input: *const T,
    indices: *const u32,
    output: *mut T,
    len: usize,
    carries: *const T,
    has_carries: bool,
    exclusive: bool,
) {
    let i = thread::block_idx_x() as usize * BLOCK_SIZE + thread::thread_idx_x() as usize;
    if i >= len {
        return;
    }
    let value = if !exclusive {
        segmented_carry(*staged.add(i), i / BLOCK_SIZE, carries, has_carries)
    } else if i == 0 || (*input.add(i)).is_head() {
        T::ZERO
    } else {
        segmented_carry(*staged.add(i - 1), (i - 1) / BLOCK_SIZE, carries, has_carries)
    };
    *(&mut *output.add(*indices.add(i) as usize)) = value;
}

macro_rules! plain_kernels {
    ($($t:ty => $scan:ident, $carry:ident);* $(;)?) => {
        $(
            #[kernel]
            #[allow(improper_ctypes_definitions, clippy::missing_safety_doc)]
            pub unsafe fn $scan(
                input: *const $t,
                output: *mut $t,
                len: usize,
                totals: *mut $t,
                exclusive: bool,
            ) {
                let xys = shared_array![$t; BLOCK_SIZE];
                scan_block(input, output, len, totals, exclusive, xys, <$t as Element>::accumulate);
            }

            #[kernel]
            #[allow(improper_ctypes_definitions, clippy::missing_safety_doc)]
            pub unsafe fn $carry(values: *mut $t, len: usize, carries: *const $t) {
                add_block_carries(values, len, carries);
            }
        )*
    };
}

macro_rules! segmented_kernels {
    ($($t:ty => $scan:ident, $strip:ident, $scatter:ident);* $(;)?) => {
        $(
            #[kernel]
            #[allow(improper_ctypes_definitions, clippy::missing_safety_doc)]
            pub unsafe fn $scan(input: *const $t, output: *mut $t, len: usize, totals: *mut $t) {
                let xys = shared_array![$t; BLOCK_SIZE];
                scan_block(
                    input,
                    output,
                    len,
                    totals,
                    false,
                    xys,
                    <$t as SignEncoded>::combine_segmented,
                );
            }

            #[kernel]
            #[allow(improper_ctypes_definitions, clippy::missing_safety_doc)]
            pub unsafe fn $strip(values: *mut $t, len: usize, carries: *const $t, has_carries: bool) {
                strip_block_carries(values, len, carries, has_carries);
            }

            #[kernel]
            #[allow(improper_ctypes_definitions, clippy::missing_safety_doc)]
            pub unsafe fn $scatter(
                staged: *const $t,
                input: *const $t,
                indices: *const u32,
                output: *mut $t,
                len: usize,
                carries: *const $t,
                has_carries: bool,
                exclusive: bool,
            ) {
                scatter_block_carries(staged, input, indices, output, len, carries, has_carries, exclusive);
            }
        )*
    };
}

plain_kernels! {
    u32 => scan_blocks_u32, add_block_carries_u32;
    u64 => scan_blocks_u64, add_block_carries_u64;
    i32 => scan_blocks_i32, add_block_carries_i32;
    i64 => scan_blocks_i64, add_block_carries_i64;
    f32 => scan_blocks_f32, add_block_carries_f32;
    f64 => scan_blocks_f64, add_block_carries_f64;
}

segmented_kernels! {
    i32 => segmented_scan_blocks_i32, strip_block_carries_i32, scatter_block_carries_i32;
    i64 => segmented_scan_blocks_i64, strip_block_carries_i64, scatter_block_carries_i64;
    f32 => segmented_scan_blocks_f32, strip_block_carries_f32, scatter_block_carries_f32;
    f64 => segmented_scan_blocks_f64, strip_block_carries_f64, scatter_block_carries_f64;
}

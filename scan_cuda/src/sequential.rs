//! Sequential scans on host slices. These are the reference the device scans
//! are checked against, and `scan_in_place` is the per-block routine of the
//! host backend.

use scan_gpu::{Element, SignEncoded};

/// Scans `values` in place with `op`, starting from `T::ZERO`, and returns the
/// inclusive total.
pub fn scan_in_place<T, F>(values: &mut [T], exclusive: bool, op: F) -> T
where
    T: Element,
    F: Fn(T, T) -> T,
{
    let mut accumulator = T::ZERO;
    for value in values.iter_mut() {
        let next = op(accumulator, *value);
        *value = if exclusive { accumulator } else { next };
        accumulator = next;
    }
    accumulator
}

/// Inclusive scan.
pub fn inclusive_scan<T: Element>(xs: &[T]) -> Vec<T> {
    let mut ys = xs.to_vec();
    scan_in_place(&mut ys, false, T::accumulate);
    ys
}

/// Exclusive scan.
pub fn exclusive_scan<T: Element>(xs: &[T]) -> Vec<T> {
    let mut ys = xs.to_vec();
    scan_in_place(&mut ys, true, T::accumulate);
    ys
}

/// Inclusive scan that restarts at every negative (head) element and outputs
/// magnitudes.
pub fn segmented_inclusive_scan<T: SignEncoded>(xs: &[T]) -> Vec<T> {
    let mut ys = xs.to_vec();
    scan_in_place(&mut ys, false, T::combine_segmented);
    ys.iter_mut().for_each(|y| *y = y.magnitude());
    ys
}

/// Exclusive counterpart of [`segmented_inclusive_scan`]: zero at every head,
/// otherwise the inclusive result of the previous element.
pub fn segmented_exclusive_scan<T: SignEncoded>(xs: &[T]) -> Vec<T> {
    let inclusive = segmented_inclusive_scan(xs);
    xs.iter()
        .enumerate()
        .map(|(i, x)| {
            if i == 0 || x.is_head() {
                T::ZERO
            } else {
                inclusive[i - 1]
            }
        })
        .collect()
}

//! Building sign-encoded input for the segmented scans.

use crate::element::SegmentElement;
use crate::error::{Result, ScanError};

/// One element of a segmented sequence before sign encoding.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Segmented<T> {
    /// Starts a new segment.
    Head(T),
    Continue(T),
}

impl<T: SegmentElement> Segmented<T> {
    /// The encoded value, or `None` when it cannot be encoded: a negative
    /// magnitude, or a head with magnitude zero.
    pub fn encode(self) -> Option<T> {
        self.checked().ok()
    }

    pub fn decode(value: T) -> Self {
        if value.is_head() {
            Segmented::Head(value.magnitude())
        } else {
            Segmented::Continue(value)
        }
    }

    pub fn magnitude(self) -> T {
        match self {
            Segmented::Head(v) | Segmented::Continue(v) => v,
        }
    }

    fn checked(self) -> std::result::Result<T, &'static str> {
        let magnitude = self.magnitude();
        if magnitude < T::ZERO {
            return Err("negative magnitude");
        }
        match self {
            // Zero has no negative form, so it can never start a segment.
            Segmented::Head(v) if !(v > T::ZERO) => Err("segment head is zero"),
            Segmented::Head(v) => Ok(v.into_head()),
            Segmented::Continue(v) => Ok(v),
        }
    }

    fn encode_at(self, index: usize) -> Result<T> {
        self.checked()
            .map_err(|reason| ScanError::InvalidEncoding { index, reason })
    }
}

/// Encodes `values`, starting a segment wherever `heads` is set.
pub fn encode_segments<T: SegmentElement>(values: &[T], heads: &[bool]) -> Result<Vec<T>> {
    if values.len() != heads.len() {
        return Err(ScanError::LengthMismatch {
            expected: values.len(),
            actual: heads.len(),
        });
    }
    values
        .iter()
        .zip(heads)
        .enumerate()
        .map(|(index, (&value, &head))| {
            let element = if head {
                Segmented::Head(value)
            } else {
                Segmented::Continue(value)
            };
            element.encode_at(index)
        })
        .collect()
}

/// Encodes `values` split into consecutive segments of the given lengths.
/// Empty segments are skipped.
pub fn encode_segments_by_len<T: SegmentElement>(values: &[T], lengths: &[usize]) -> Result<Vec<T>> {
    let total: usize = lengths.iter().sum();
    if total != values.len() {
        return Err(ScanError::LengthMismatch {
            expected: values.len(),
            actual: total,
        });
    }
    let mut heads = vec![false; values.len()];
    let mut start = 0;
    for &len in lengths {
        if len > 0 {
            heads[start] = true;
        }
        start += len;
    }
    encode_segments(values, &heads)
}

#[cfg(test)]
mod tests {
    use super::{encode_segments, encode_segments_by_len, Segmented};
    use crate::error::ScanError;
    use crate::sequential::segmented_inclusive_scan;

    #[test]
    fn encode_decode_test() {
        assert_eq!(Segmented::Head(3i32).encode(), Some(-3));
        assert_eq!(Segmented::Continue(3i32).encode(), Some(3));
        assert_eq!(Segmented::Head(0.0f32).encode(), None);
        assert_eq!(Segmented::Continue(-1i64).encode(), None);

        assert_eq!(Segmented::decode(-2.5f64), Segmented::Head(2.5));
        assert_eq!(Segmented::decode(0i32), Segmented::Continue(0));
        assert_eq!(Segmented::decode(-0.0f32).magnitude(), 0.0);
    }

    #[test]
    fn encode_segments_test() {
        let encoded =
            encode_segments(&[5i32, 3, 2, 1, 4], &[false, true, false, true, false]).unwrap();
        assert_eq!(encoded, vec![5, -3, 2, -1, 4]);
        assert_eq!(segmented_inclusive_scan(&encoded), vec![5, 3, 5, 1, 5]);
    }

    #[test]
    fn encode_segments_rejects_test() {
        assert!(matches!(
            encode_segments(&[1i32, 0], &[true, true]),
            Err(ScanError::InvalidEncoding { index: 1, .. })
        ));
        assert!(matches!(
            encode_segments(&[1.0f32, -2.0], &[false, false]),
            Err(ScanError::InvalidEncoding { index: 1, .. })
        ));
        assert!(matches!(
            encode_segments(&[1i64], &[]),
            Err(ScanError::LengthMismatch {
                expected: 1,
                actual: 0
            })
        ));
    }

    #[test]
    fn encode_segments_by_len_test() {
        let encoded = encode_segments_by_len(&[1.0f64, 2.0, 3.0, 4.0, 5.0], &[2, 0, 3]).unwrap();
        assert_eq!(encoded, vec![-1.0, 2.0, -3.0, 4.0, 5.0]);
        assert_eq!(
            segmented_inclusive_scan(&encoded),
            vec![1.0, 3.0, 3.0, 7.0, 12.0]
        );
        assert!(matches!(
            encode_segments_by_len(&[1i32, 2], &[3]),
            Err(ScanError::LengthMismatch { .. })
        ));
    }
}

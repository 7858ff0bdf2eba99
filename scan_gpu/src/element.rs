//! Element semantics shared by the kernels and the host backend.
//!
//! Both sides must agree exactly on how values accumulate and on how the
//! segment flag is read from the sign, so these traits live in the kernel crate
//! and only use `core`.

/// A numeric type that can be scanned.
///
/// Integer accumulation wraps, which is what the device arithmetic does.
pub trait Element: Copy + PartialOrd {
    const ZERO: Self;

    /// Suffix of the per-type kernel names, e.g. `scan_blocks_f32`.
    const NAME: &'static str;

    fn accumulate(self, other: Self) -> Self;
}

/// A signed element whose sign bit carries the segment-head flag.
///
/// A negative value starts a new segment and contributes its magnitude. Zero is
/// never a head, so `-0.0` reads the same as `0.0`.
pub trait SignEncoded: Element {
    fn is_head(self) -> bool {
        self < Self::ZERO
    }

    fn magnitude(self) -> Self;

    /// Marks a non-negative magnitude as a segment head.
    fn into_head(self) -> Self;

    /// The segmented-sum operator on encoded values, `self` preceding `next`.
    ///
    /// The result is a head when either side contains one, and its magnitude
    /// restarts at `next` when `next` is a head. This is associative and has
    /// `ZERO` as identity, so it can drive a block-parallel scan.
    fn combine_segmented(self, next: Self) -> Self {
        if next.is_head() {
            return next;
        }
        let sum = self.magnitude().accumulate(next);
        if self.is_head() {
            sum.into_head()
        } else {
            sum
        }
    }
}

macro_rules! integer_elements {
    ($($t:ty => $name:literal),* $(,)?) => {
        $(
            impl Element for $t {
                const ZERO: Self = 0;
                const NAME: &'static str = $name;

                #[inline(always)]
                fn accumulate(self, other: Self) -> Self {
                    self.wrapping_add(other)
                }
            }
        )*
    };
}

macro_rules! float_elements {
    ($($t:ty => $name:literal),* $(,)?) => {
        $(
            impl Element for $t {
                const ZERO: Self = 0.0;
                const NAME: &'static str = $name;

                #[inline(always)]
                fn accumulate(self, other: Self) -> Self {
                    self + other
                }
            }

            impl SignEncoded for $t {
                #[inline(always)]
                fn magnitude(self) -> Self {
                    if self < 0.0 {
                        -self
                    } else {
                        self
                    }
                }

                #[inline(always)]
                fn into_head(self) -> Self {
                    -self
                }
            }
        )*
    };
}

integer_elements!(u32 => "u32", u64 => "u64", i32 => "i32", i64 => "i64");
float_elements!(f32 => "f32", f64 => "f64");

impl SignEncoded for i32 {
    #[inline(always)]
    fn magnitude(self) -> Self {
        self.wrapping_abs()
    }

    #[inline(always)]
    fn into_head(self) -> Self {
        self.wrapping_neg()
    }
}

impl SignEncoded for i64 {
    #[inline(always)]
    fn magnitude(self) -> Self {
        self.wrapping_abs()
    }

    #[inline(always)]
    fn into_head(self) -> Self {
        self.wrapping_neg()
    }
}

/// Strides of a Kogge-Stone pass: `1, 2, 4, ...` while below `limit`.
pub struct DoublingStrides {
    next: usize,
    limit: usize,
}

impl Iterator for DoublingStrides {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.limit {
            return None;
        }
        let next = self.next;
        self.next *= 2;
        Some(next)
    }
}

pub fn doubling_strides(limit: usize) -> DoublingStrides {
    DoublingStrides { next: 1, limit }
}

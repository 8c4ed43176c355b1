/// Cyclic cursor over the reunions of a collection.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Navigator {
    index: usize,
}

impl Navigator {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Moves forward, wrapping past the last entry. No-op for `len <= 1`.
    pub fn next(&mut self, len: usize) {
        if len > 1 {
            self.index = (self.index + 1) % len;
        }
    }

    /// Moves back, wrapping before the first entry. No-op for `len <= 1`.
    pub fn previous(&mut self, len: usize) {
        if len > 1 {
            self.index = (self.index + len - 1) % len;
        }
    }

    /// Pulls the cursor back to the start when the collection shrank under it.
    pub fn clamp(&mut self, len: usize) {
        if self.index >= len {
            self.index = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_n_times_returns_to_start() {
        for len in 2..6 {
            let mut nav = Navigator::default();
            nav.next(len);
            let start = nav.index();
            for _ in 0..len {
                nav.next(len);
            }
            assert_eq!(nav.index(), start, "len={len}");
        }
    }

    #[test]
    fn previous_from_zero_wraps_to_last() {
        let mut nav = Navigator::default();
        nav.previous(4);
        assert_eq!(nav.index(), 3);
        nav.next(4);
        assert_eq!(nav.index(), 0);
    }

    #[test]
    fn zero_or_one_entry_never_moves() {
        for len in 0..=1 {
            let mut nav = Navigator::default();
            nav.next(len);
            nav.previous(len);
            assert_eq!(nav.index(), 0);
        }
    }

    #[test]
    fn clamp_resets_out_of_range_cursor() {
        let mut nav = Navigator::default();
        nav.previous(5);
        nav.clamp(3);
        assert_eq!(nav.index(), 0);
        nav.next(3);
        nav.clamp(3);
        assert_eq!(nav.index(), 1);
    }
}

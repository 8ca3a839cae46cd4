//! Transfer progress

/// Percentage (0-100) of `sent` over `total`, rounded half up.
///
/// Returns 0 when `total` is 0. `sent` is clamped to `total`.
pub fn compute_progress(sent: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let sent = sent.min(total) as u128;
    let total = total as u128;
    ((sent * 100 + total / 2) / total) as u8
}

/// Sent/total byte counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub sent: u64,
    pub total: u64,
}

impl Progress {
    pub fn new(total: u64) -> Self {
        Self { sent: 0, total }
    }

    pub fn add(&mut self, bytes: u64) {
        self.sent = self.sent.saturating_add(bytes);
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn remaining(&self) -> u64 {
        self.total.saturating_sub(self.sent)
    }

    pub fn is_complete(&self) -> bool {
        self.sent >= self.total
    }

    pub fn percent(&self) -> u8 {
        compute_progress(self.sent, self.total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_total() {
        assert_eq!(compute_progress(0, 0), 0);
        assert_eq!(compute_progress(10, 0), 0);
    }

    #[test]
    fn test_endpoints() {
        for total in [1u64, 3, 7, 100, 1_000_003, u64::MAX] {
            assert_eq!(compute_progress(0, total), 0);
            assert_eq!(compute_progress(total, total), 100);
        }
    }

    #[test]
    fn test_half_rounds_up() {
        // 1/200 = 0.5%
        assert_eq!(compute_progress(1, 200), 1);
        // 1/3 = 33.3%, 2/3 = 66.7%
        assert_eq!(compute_progress(1, 3), 33);
        assert_eq!(compute_progress(2, 3), 67);
        // 1/8 = 12.5%
        assert_eq!(compute_progress(1, 8), 13);
    }

    #[test]
    fn test_clamps_overshoot() {
        assert_eq!(compute_progress(150, 100), 100);
    }

    #[test]
    fn test_monotonic() {
        for total in [1u64, 7, 99, 101, 1000] {
            let mut last = 0;
            for sent in 0..=total {
                let p = compute_progress(sent, total);
                assert!(p >= last, "total {} sent {}", total, sent);
                last = p;
            }
        }
    }

    #[test]
    fn test_no_overflow_near_max() {
        assert_eq!(compute_progress(u64::MAX / 2, u64::MAX), 50);
    }

    #[test]
    fn test_progress_counters() {
        let mut p = Progress::new(10);
        p.add(4);
        assert_eq!(p.remaining(), 6);
        assert_eq!(p.percent(), 40);
        p.add(6);
        assert!(p.is_complete());
        p.reset();
        assert_eq!(p, Progress::default());
    }
}

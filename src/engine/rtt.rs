//! Round-trip estimation.
//!
//! Classic Van Jacobson smoothing over millisecond samples:
//!
//! > "Congestion Avoidance and Control", Van Jacobson, Michael J. Karels, 1988
//!
//! Sampling follows Karn's rule: a segment that was retransmitted never
//! produces a sample, the in-flight measurement is abandoned instead.
use crate::time::Duration;

// Initial estimate chosen so that the first timeout fires after 3 s.
const INITIAL_RTT: u32 = 1000;
const INITIAL_VAR: u32 = 500;

const MIN_RTO: u32 = 1000;
const MAX_RTO: u32 = 64_000;

/// Smoothed round-trip state for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RttEstimator {
    /// Smoothed round-trip time, milliseconds.
    srtt: u32,

    /// Smoothed mean deviation, milliseconds.
    var: u32,

    /// Smallest sample observed so far.
    min: u32,

    /// Number of samples folded in.
    updates: u32,

    /// Backoff shift at the most recent re-arm, for diagnostics.
    last_shift: u8,
}

impl Default for RttEstimator {
    fn default() -> Self {
        RttEstimator {
            srtt: INITIAL_RTT,
            var: INITIAL_VAR,
            min: u32::max_value(),
            updates: 0,
            last_shift: 0,
        }
    }
}

impl RttEstimator {
    /// The retransmission timeout derived from the current estimate.
    pub fn rto(&self) -> Duration {
        let ms = (self.srtt + 4 * self.var).max(MIN_RTO).min(MAX_RTO);
        Duration::from_millis(u64::from(ms))
    }

    /// The timeout after `shift` consecutive expirations.
    pub fn rto_backed_off(&self, shift: u8) -> Duration {
        let factor = crate::engine::BACKOFF[usize::from(shift).min(crate::engine::BACKOFF.len() - 1)];
        let ms = ((self.srtt + 4 * self.var).saturating_mul(factor)).max(MIN_RTO).min(MAX_RTO);
        Duration::from_millis(u64::from(ms))
    }

    /// Fold in a new round-trip sample, in milliseconds.
    pub fn sample(&mut self, new_rtt: u32) {
        if self.updates == 0 {
            // First measurement replaces the conservative initial guess.
            self.srtt = new_rtt;
            self.var = new_rtt / 2;
        } else {
            self.srtt = (self.srtt * 7 + new_rtt + 7) / 8;
            let diff = (self.srtt as i32 - new_rtt as i32).abs() as u32;
            self.var = (self.var * 3 + diff + 3) / 4;
        }
        self.min = self.min.min(new_rtt);
        self.updates += 1;
        self.last_shift = 0;
        net_trace!("rtt: sample={}ms srtt={}ms var={}ms rto={:?}", new_rtt, self.srtt, self.var, self.rto());
    }

    /// Record a timer backoff.
    pub fn on_backoff(&mut self, shift: u8) {
        self.last_shift = shift;
    }

    /// The smallest sample observed, if any was taken.
    pub fn min_rtt(&self) -> Option<u32> {
        if self.updates == 0 {
            None
        } else {
            Some(self.min)
        }
    }

    /// Smoothed round-trip time in milliseconds.
    pub fn srtt(&self) -> u32 {
        self.srtt
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn initial_timeout() {
        let rtte = RttEstimator::default();
        assert_eq!(rtte.rto(), Duration::from_millis(3000));
        assert_eq!(rtte.min_rtt(), None);
    }

    #[test]
    fn first_sample_replaces_guess() {
        let mut rtte = RttEstimator::default();
        rtte.sample(100);
        assert_eq!(rtte.srtt(), 100);
        assert_eq!(rtte.min_rtt(), Some(100));
        // 100 + 4 * 50, clamped up to the minimum timeout.
        assert_eq!(rtte.rto(), Duration::from_millis(1000));
    }

    #[test]
    fn smoothing_converges() {
        let mut rtte = RttEstimator::default();
        for _ in 0..50 {
            rtte.sample(200);
        }
        assert!(rtte.srtt() >= 195 && rtte.srtt() <= 205);
        assert_eq!(rtte.min_rtt(), Some(200));
    }

    #[test]
    fn backoff_doubles() {
        let rtte = RttEstimator::default();
        let base = rtte.rto_backed_off(0);
        assert_eq!(rtte.rto_backed_off(1), 2 * base);
        assert_eq!(rtte.rto_backed_off(2), 4 * base);
        // The table saturates well below the clamp.
        assert_eq!(rtte.rto_backed_off(12), Duration::from_millis(64_000));
    }
}

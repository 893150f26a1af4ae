use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    DurationElapsed,
    TooManyFailures,
    Requested,
}

/// Decides when the main task loop ends.
pub struct LoopController {
    duration: Option<Duration>,
    max_consecutive_failures: u32,
    start_time: Instant,
    consecutive_failures: u32,
    total_failures: u32,
    cycles: u64,
    stop: Arc<AtomicBool>,
}

impl LoopController {
    /// `duration_minutes` of 0 runs until stopped.
    pub fn new(duration_minutes: u64, max_consecutive_failures: u32) -> Self {
        Self::with_duration(
            (duration_minutes > 0).then(|| Duration::from_secs(duration_minutes.saturating_mul(60))),
            max_consecutive_failures,
        )
    }

    pub fn with_duration(duration: Option<Duration>, max_consecutive_failures: u32) -> Self {
        Self {
            duration,
            max_consecutive_failures,
            start_time: Instant::now(),
            consecutive_failures: 0,
            total_failures: 0,
            cycles: 0,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that ends the loop when set, e.g. from a Ctrl-C handler.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn record_success(&mut self) {
        self.cycles += 1;
        self.consecutive_failures = 0;
    }

    pub fn record_failure(&mut self) {
        self.cycles += 1;
        self.consecutive_failures += 1;
        self.total_failures += 1;
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn total_failures(&self) -> u32 {
        self.total_failures
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn should_stop(&self) -> Option<StopReason> {
        if self.stop.load(Ordering::SeqCst) {
            return Some(StopReason::Requested);
        }
        if let Some(limit) = self.duration {
            if self.start_time.elapsed() >= limit {
                return Some(StopReason::DurationElapsed);
            }
        }
        if self.max_consecutive_failures > 0 && self.consecutive_failures >= self.max_consecutive_failures {
            return Some(StopReason::TooManyFailures);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consecutive_failures_stop_and_success_resets() {
        let mut lc = LoopController::new(0, 2);
        lc.record_failure();
        assert_eq!(lc.should_stop(), None);
        lc.record_success();
        lc.record_failure();
        assert_eq!(lc.should_stop(), None);
        lc.record_failure();
        assert_eq!(lc.should_stop(), Some(StopReason::TooManyFailures));
        assert_eq!(lc.total_failures(), 3);
        assert_eq!(lc.cycles(), 4);
    }

    #[test]
    fn duration_and_stop_flag() {
        let lc = LoopController::with_duration(Some(Duration::ZERO), 0);
        assert_eq!(lc.should_stop(), Some(StopReason::DurationElapsed));

        let lc = LoopController::new(0, 0);
        assert_eq!(lc.should_stop(), None);
        lc.stop_handle().store(true, Ordering::SeqCst);
        assert_eq!(lc.should_stop(), Some(StopReason::Requested));
    }

    #[test]
    fn huge_duration_saturates() {
        let lc = LoopController::new(u64::MAX, 0);
        assert_eq!(lc.duration, Some(Duration::from_secs(u64::MAX)));
        assert_eq!(lc.should_stop(), None);
    }
}

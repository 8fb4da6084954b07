//! Frame pacing for presented frames
//!
//! Holds each swap to the configured frame limit by sleeping off whatever
//! is left of the frame's time slice. A limit of 0 runs unthrottled.

use std::time::{Duration, Instant};

/// Sleeps shorter than this are not worth the scheduler round trip
const MIN_SLEEP: Duration = Duration::from_micros(100);

/// Frame rate limiter driven by swaps
#[derive(Debug)]
pub struct FrameLimiter {
    /// Target frame time, None when unlimited
    target: Option<Duration>,
    /// Start of the current frame
    frame_start: Instant,
    /// Oversleep carried over to the next frame
    sleep_debt: Duration,
    total_frames: u64,
    /// Frames that ran past twice the target
    slow_frames: u64,
}

impl FrameLimiter {
    /// Create a limiter for `frame_limit` frames per second (0 = unlimited)
    pub fn new(frame_limit: u32) -> Self {
        Self {
            target: Self::target_for(frame_limit),
            frame_start: Instant::now(),
            sleep_debt: Duration::ZERO,
            total_frames: 0,
            slow_frames: 0,
        }
    }

    fn target_for(frame_limit: u32) -> Option<Duration> {
        (frame_limit > 0).then(|| Duration::from_secs_f64(1.0 / frame_limit as f64))
    }

    pub fn set_frame_limit(&mut self, frame_limit: u32) {
        self.target = Self::target_for(frame_limit);
        self.sleep_debt = Duration::ZERO;
    }

    pub fn target_frame_time(&self) -> Option<Duration> {
        self.target
    }

    /// Close the current frame, sleeping until its slot is used up.
    /// Returns how long it slept.
    pub fn end_frame(&mut self) -> Duration {
        let elapsed = self.frame_start.elapsed();
        self.total_frames += 1;
        let mut slept = Duration::ZERO;

        if let Some(target) = self.target {
            if elapsed < target {
                let wanted = (target - elapsed).saturating_sub(self.sleep_debt);
                if wanted > MIN_SLEEP {
                    let start = Instant::now();
                    std::thread::sleep(wanted);
                    slept = start.elapsed();
                    self.sleep_debt = slept.saturating_sub(wanted);
                }
            } else if elapsed > target * 2 {
                self.slow_frames += 1;
                self.sleep_debt = Duration::ZERO;
            }
        }

        self.frame_start = Instant::now();
        slept
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    pub fn slow_frames(&self) -> u64 {
        self.slow_frames
    }
}

impl Default for FrameLimiter {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_frame_time() {
        let limiter = FrameLimiter::new(60);
        let target = limiter.target_frame_time().unwrap();
        assert!((target.as_secs_f64() - 1.0 / 60.0).abs() < 0.0001);
        assert!(FrameLimiter::new(0).target_frame_time().is_none());
    }

    #[test]
    fn test_unlimited_never_sleeps() {
        let mut limiter = FrameLimiter::default();
        for _ in 0..5 {
            assert_eq!(limiter.end_frame(), Duration::ZERO);
        }
        assert_eq!(limiter.total_frames(), 5);
    }

    #[test]
    fn test_limit_paces_frames() {
        let mut limiter = FrameLimiter::new(100);
        let start = Instant::now();
        for _ in 0..5 {
            limiter.end_frame();
        }
        // Five 10ms slots, allowing for coarse timers
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert_eq!(limiter.slow_frames(), 0);
    }

    #[test]
    fn test_slow_frame_counted() {
        let mut limiter = FrameLimiter::new(1000);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(limiter.end_frame(), Duration::ZERO);
        assert_eq!(limiter.slow_frames(), 1);
    }
}

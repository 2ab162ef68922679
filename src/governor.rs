// SPDX-License-Identifier: MPL-2.0

//! Minimum inter-frame interval applied to one surface's render callback.

use std::time::{Duration, Instant};

/// Highest cap accepted; anything above is treated as uncapped.
const MAX_FPS: u32 = 240;

/// Frame pacing slack so a 60 Hz compositor still hits a 30 fps cap evenly.
const SLACK: Duration = Duration::from_micros(250);

#[derive(Debug, Clone)]
pub struct FrameRateGovernor {
    interval: Option<Duration>,
    accumulator: Duration,
    last_tick: Option<Instant>,
}

impl FrameRateGovernor {
    /// Create a governor for `cap` frames per second.
    ///
    /// An invalid cap (zero or above [`MAX_FPS`]) degrades to uncapped rendering.
    #[must_use]
    pub fn new(cap: Option<u32>) -> Self {
        let interval = match cap {
            None => None,
            Some(fps) if fps == 0 || fps > MAX_FPS => {
                tracing::warn!(fps, "ignoring invalid frame rate cap, rendering uncapped");
                None
            }
            Some(fps) => Some(Duration::from_secs(1) / fps),
        };

        Self {
            interval,
            accumulator: Duration::ZERO,
            last_tick: None,
        }
    }

    #[must_use]
    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Forget pacing history, e.g. after a resume.
    pub fn reset(&mut self) {
        self.accumulator = Duration::ZERO;
        self.last_tick = None;
    }

    /// Whether a frame callback arriving at `now` should render a new frame.
    pub fn should_render(&mut self, now: Instant) -> bool {
        let last = self.last_tick.replace(now);

        let (Some(interval), Some(last)) = (self.interval, last) else {
            return true;
        };

        self.accumulator = self
            .accumulator
            .saturating_add(now.saturating_duration_since(last));

        if self.accumulator + SLACK < interval {
            false
        } else {
            // Never bank more than one interval, so a stall is not followed by a burst.
            self.accumulator = self.accumulator.saturating_sub(interval).min(interval);
            true
        }
    }
}

impl Default for FrameRateGovernor {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticks(governor: &mut FrameRateGovernor, start: Instant, step: Duration, n: u32) -> usize {
        (0..n)
            .filter(|i| governor.should_render(start + step * *i))
            .count()
    }

    #[test]
    fn test_uncapped_renders_every_frame() {
        let mut governor = FrameRateGovernor::new(None);
        let rendered = ticks(&mut governor, Instant::now(), Duration::from_millis(16), 10);
        assert_eq!(rendered, 10);
    }

    #[test]
    fn test_thirty_fps_cap_on_sixty_hz() {
        let mut governor = FrameRateGovernor::new(Some(30));
        let step = Duration::from_secs(1) / 60;
        let rendered = ticks(&mut governor, Instant::now(), step, 60);
        assert!((29..=31).contains(&rendered), "rendered {rendered}");
    }

    #[test]
    fn test_invalid_cap_is_uncapped() {
        assert_eq!(FrameRateGovernor::new(Some(0)).interval(), None);
        assert_eq!(FrameRateGovernor::new(Some(10_000)).interval(), None);
        assert!(FrameRateGovernor::new(Some(24)).interval().is_some());
    }

    #[test]
    fn test_stall_does_not_burst() {
        let mut governor = FrameRateGovernor::new(Some(10));
        let start = Instant::now();
        assert!(governor.should_render(start));
        // One long stall, then 60 Hz callbacks.
        assert!(governor.should_render(start + Duration::from_secs(2)));
        let step = Duration::from_secs(1) / 60;
        let after = start + Duration::from_secs(2);
        let rendered = (1..=6)
            .filter(|i| governor.should_render(after + step * *i))
            .count();
        assert!(rendered <= 1, "rendered {rendered}");
    }
}

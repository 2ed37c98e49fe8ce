//! Throughput counter for diagnostics.
//!
//! The acquisition worker ticks once per presented frame; any other thread
//! may read the rate at any time. Both sides hold the lock only long enough
//! to touch a small ring of instants.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

pub const DEFAULT_RATE_WINDOW: usize = 30;

/// Point-in-time copy of the counter.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RateSnapshot {
    /// Observed frames per second over the window.
    pub fps: f64,
    /// Rate implied by the most recent expected interval, if one was given.
    pub expected_fps: Option<f64>,
    pub total_ticks: u64,
}

#[derive(Debug)]
struct RateWindow {
    ticks: VecDeque<Instant>,
    capacity: usize,
    expected_interval_ms: u64,
    total_ticks: u64,
}

#[derive(Debug)]
pub struct RateCounter {
    window: Mutex<RateWindow>,
}

impl RateCounter {
    /// Rolling window over the last `capacity` ticks (minimum 2).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            window: Mutex::new(RateWindow {
                ticks: VecDeque::with_capacity(capacity),
                capacity,
                expected_interval_ms: 0,
                total_ticks: 0,
            }),
        }
    }

    /// Record one observation now.
    pub fn tick(&self, expected_interval_ms: u64) {
        self.tick_at(Instant::now(), expected_interval_ms);
    }

    pub(crate) fn tick_at(&self, at: Instant, expected_interval_ms: u64) {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        if window.ticks.len() == window.capacity {
            window.ticks.pop_front();
        }
        window.ticks.push_back(at);
        window.expected_interval_ms = expected_interval_ms;
        window.total_ticks += 1;
    }

    /// Frames per second over the window; `0.0` until two ticks exist.
    pub fn current_rate(&self) -> f64 {
        self.snapshot().fps
    }

    pub fn snapshot(&self) -> RateSnapshot {
        let window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        let fps = match (window.ticks.front(), window.ticks.back()) {
            (Some(first), Some(last)) if window.ticks.len() >= 2 => {
                let span = last.duration_since(*first).as_secs_f64();
                if span > 0.0 {
                    (window.ticks.len() - 1) as f64 / span
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };
        let expected_fps = match window.expected_interval_ms {
            0 => None,
            ms => Some(1_000.0 / ms as f64),
        };
        RateSnapshot {
            fps,
            expected_fps,
            total_ticks: window.total_ticks,
        }
    }

    pub fn reset(&self) {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        window.ticks.clear();
        window.expected_interval_ms = 0;
        window.total_ticks = 0;
    }
}

impl Default for RateCounter {
    fn default() -> Self {
        Self::new(DEFAULT_RATE_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn rate_is_zero_until_two_ticks() {
        let counter = RateCounter::new(10);
        assert_eq!(counter.current_rate(), 0.0);
        counter.tick(33);
        assert_eq!(counter.current_rate(), 0.0);
        assert_eq!(counter.snapshot().total_ticks, 1);
    }

    #[test]
    fn rate_reflects_tick_spacing() {
        let counter = RateCounter::new(10);
        let start = Instant::now();
        for i in 0..5u64 {
            counter.tick_at(start + Duration::from_millis(i * 40), 40);
        }
        let snapshot = counter.snapshot();
        assert!((snapshot.fps - 25.0).abs() < 1e-6);
        assert_eq!(snapshot.expected_fps, Some(25.0));
    }

    #[test]
    fn window_forgets_old_ticks() {
        let counter = RateCounter::new(3);
        let start = Instant::now();
        // Slow start, then a fast burst that fills the window.
        counter.tick_at(start, 0);
        counter.tick_at(start + Duration::from_secs(1), 0);
        for i in 0..3u64 {
            counter.tick_at(start + Duration::from_millis(2_000 + i * 10), 0);
        }
        let snapshot = counter.snapshot();
        assert!((snapshot.fps - 100.0).abs() < 1e-6);
        assert_eq!(snapshot.total_ticks, 5);
        assert_eq!(snapshot.expected_fps, None);
    }

    #[test]
    fn readers_on_other_threads_see_progress() {
        let counter = Arc::new(RateCounter::default());
        let writer = {
            let counter = counter.clone();
            std::thread::spawn(move || {
                for _ in 0..50 {
                    counter.tick(1);
                    std::thread::sleep(Duration::from_millis(1));
                }
            })
        };
        while counter.snapshot().total_ticks < 50 {
            let _ = counter.current_rate();
            std::thread::yield_now();
        }
        writer.join().unwrap();
        assert!(counter.current_rate() > 0.0);

        counter.reset();
        assert_eq!(counter.snapshot(), RateSnapshot::default());
    }
}

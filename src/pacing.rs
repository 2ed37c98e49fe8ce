//! Source-timed frame pacing.
//!
//! The engine correlates two clocks: the host's monotonic clock at the moment
//! a frame is ready, and the timestamp the source embedded in the frame. The
//! first frame of a session fixes a `ClockAnchor`; every later frame is held
//! back until the host has caught up with the source's elapsed time since
//! that anchor.
//!
//! Frames are never dropped. A frame that is already late is emitted at once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::PipelineError;

// ----------------------------------------------------------------------------
// Host clock
// ----------------------------------------------------------------------------

/// Host time source, in milliseconds on a monotonic scale.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// Monotonic wall clock measured from construction.
#[derive(Clone, Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by_ms: u64) {
        self.now_ms.fetch_add(by_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

// ----------------------------------------------------------------------------
// Anchor and drift
// ----------------------------------------------------------------------------

/// Reference point pairing the first source timestamp of a session with the
/// host time it was seen at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClockAnchor {
    pub first_source_timestamp_us: u64,
    pub first_host_time_ms: u64,
}

/// Per-frame clock comparison. Positive drift means the host is ahead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DriftSample {
    pub host_diff_ms: i64,
    pub source_diff_ms: i64,
    pub drift_ms: i64,
}

impl DriftSample {
    fn measure(anchor: &ClockAnchor, source_timestamp_us: u64, now_ms: u64) -> Self {
        let host_diff_ms = now_ms.saturating_sub(anchor.first_host_time_ms) as i64;
        let source_diff_ms = (source_timestamp_us / 1_000) as i64
            - (anchor.first_source_timestamp_us / 1_000) as i64;
        Self {
            host_diff_ms,
            source_diff_ms,
            drift_ms: source_diff_ms - host_diff_ms,
        }
    }
}

/// What the caller should do with the frame it just asked about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Advice {
    /// First frame of the session; it established the anchor.
    Anchored(ClockAnchor),
    /// Host is ahead of the source; suspend for `drift_ms` before emitting.
    Wait(DriftSample),
    /// On schedule or late; emit now.
    Immediate(DriftSample),
    /// Timestamp went backwards. Emit now and carry on.
    Inconsistent(PipelineError),
}

impl Advice {
    /// How long to suspend before emitting. Never negative.
    pub fn wait(&self) -> Duration {
        match self {
            Advice::Wait(sample) => Duration::from_millis(sample.drift_ms.max(0) as u64),
            _ => Duration::ZERO,
        }
    }

    pub fn sample(&self) -> Option<&DriftSample> {
        match self {
            Advice::Wait(sample) | Advice::Immediate(sample) => Some(sample),
            _ => None,
        }
    }
}

// ----------------------------------------------------------------------------
// Engine
// ----------------------------------------------------------------------------

/// Two-state pacer: UNANCHORED until the first frame, ANCHORED afterwards
/// until `reset`.
pub struct PacingEngine {
    clock: Arc<dyn Clock>,
    anchor: Option<ClockAnchor>,
    last_source_us: Option<u64>,
    lag_warn_ms: Option<u64>,
    lagging: bool,
}

impl PacingEngine {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            anchor: None,
            last_source_us: None,
            lag_warn_ms: None,
            lagging: false,
        }
    }

    /// Warn once per episode when the host falls more than `threshold_ms`
    /// behind the source. Frames are still emitted, late.
    pub fn with_lag_warning(mut self, threshold_ms: Option<u64>) -> Self {
        self.lag_warn_ms = threshold_ms;
        self
    }

    pub fn anchor(&self) -> Option<ClockAnchor> {
        self.anchor
    }

    pub fn is_anchored(&self) -> bool {
        self.anchor.is_some()
    }

    /// Decide how long the frame stamped `source_timestamp_us` must wait.
    pub fn advise(&mut self, source_timestamp_us: u64) -> Advice {
        let now_ms = self.clock.now_millis();

        let Some(anchor) = self.anchor else {
            let anchor = ClockAnchor {
                first_source_timestamp_us: source_timestamp_us,
                first_host_time_ms: now_ms,
            };
            log::debug!(
                "pacing anchored: source_ts_us={} host_ms={}",
                source_timestamp_us,
                now_ms
            );
            self.anchor = Some(anchor);
            self.last_source_us = Some(source_timestamp_us);
            return Advice::Anchored(anchor);
        };

        if let Some(previous_us) = self.last_source_us {
            if source_timestamp_us < previous_us {
                let err = PipelineError::PacingInconsistency {
                    previous_us,
                    current_us: source_timestamp_us,
                };
                log::warn!("{}; emitting without delay", err);
                return Advice::Inconsistent(err);
            }
        }
        self.last_source_us = Some(source_timestamp_us);

        let sample = DriftSample::measure(&anchor, source_timestamp_us, now_ms);
        log::debug!(
            "host_diff_ms={} source_diff_ms={} drift_ms={}",
            sample.host_diff_ms,
            sample.source_diff_ms,
            sample.drift_ms
        );
        self.track_lag(&sample);

        if sample.drift_ms > 0 {
            Advice::Wait(sample)
        } else {
            Advice::Immediate(sample)
        }
    }

    /// Back to UNANCHORED. The next frame sets a fresh anchor.
    pub fn reset(&mut self) {
        self.anchor = None;
        self.last_source_us = None;
        self.lagging = false;
    }

    fn track_lag(&mut self, sample: &DriftSample) {
        let Some(threshold) = self.lag_warn_ms else {
            return;
        };
        let behind_ms = (-sample.drift_ms).max(0) as u64;
        if behind_ms > threshold {
            if !self.lagging {
                log::warn!(
                    "playback is {}ms behind the source (threshold {}ms); frames are emitted late",
                    behind_ms,
                    threshold
                );
                self.lagging = true;
            }
        } else if self.lagging {
            log::info!("playback caught up with the source");
            self.lagging = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_at(start_ms: u64) -> (PacingEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start_ms));
        (PacingEngine::new(clock.clone()), clock)
    }

    #[test]
    fn first_frame_anchors_without_waiting() {
        let (mut engine, _clock) = engine_at(10_000);
        let advice = engine.advise(1_000_000);

        assert_eq!(
            advice,
            Advice::Anchored(ClockAnchor {
                first_source_timestamp_us: 1_000_000,
                first_host_time_ms: 10_000,
            })
        );
        assert_eq!(advice.wait(), Duration::ZERO);
    }

    #[test]
    fn host_ahead_of_source_waits_for_drift() {
        let (mut engine, clock) = engine_at(10_000);
        engine.advise(1_000_000);

        clock.set(10_500);
        let advice = engine.advise(2_000_000);

        assert_eq!(
            advice.sample(),
            Some(&DriftSample {
                host_diff_ms: 500,
                source_diff_ms: 1_000,
                drift_ms: 500,
            })
        );
        assert_eq!(advice.wait(), Duration::from_millis(500));
    }

    #[test]
    fn late_frames_are_emitted_immediately() {
        let (mut engine, clock) = engine_at(0);
        engine.advise(0);

        clock.set(300);
        let advice = engine.advise(100_000);
        assert!(matches!(advice, Advice::Immediate(s) if s.drift_ms == -200));
        assert_eq!(advice.wait(), Duration::ZERO);

        clock.set(400);
        let on_time = engine.advise(400_000);
        assert!(matches!(on_time, Advice::Immediate(s) if s.drift_ms == 0));
    }

    #[test]
    fn anchor_is_set_exactly_once_per_session() {
        let (mut engine, clock) = engine_at(50);
        engine.advise(7_000);
        let anchor = engine.anchor();

        for step in 1..20u64 {
            clock.advance(33);
            let advice = engine.advise(7_000 + step * 33_000);
            assert!(!matches!(advice, Advice::Anchored(_)));
        }
        assert_eq!(engine.anchor(), anchor);

        engine.reset();
        assert!(!engine.is_anchored());
        clock.set(9_000);
        assert!(matches!(engine.advise(1), Advice::Anchored(a) if a.first_host_time_ms == 9_000));
    }

    #[test]
    fn backwards_timestamp_degrades_to_zero_wait() {
        let (mut engine, clock) = engine_at(0);
        engine.advise(5_000_000);
        engine.advise(6_000_000);

        clock.set(10);
        let advice = engine.advise(5_500_000);
        assert_eq!(
            advice,
            Advice::Inconsistent(PipelineError::PacingInconsistency {
                previous_us: 6_000_000,
                current_us: 5_500_000,
            })
        );
        assert_eq!(advice.wait(), Duration::ZERO);

        // The next well-ordered frame is paced against the original anchor.
        let next = engine.advise(6_100_000);
        assert_eq!(next.wait(), Duration::from_millis(1_090));
    }

    #[test]
    fn non_decreasing_sequences_never_wait_negative() {
        let (mut engine, clock) = engine_at(1_000);
        let mut ts = 0u64;
        for step in 0..200u64 {
            // Irregular host and source cadence, duplicates included.
            clock.advance((step * 7919) % 61);
            ts += (step * 104_729) % 50_000;
            let advice = engine.advise(ts);
            if let Some(sample) = advice.sample() {
                assert_eq!(
                    advice.wait(),
                    Duration::from_millis(sample.drift_ms.max(0) as u64)
                );
            }
            assert!(!matches!(advice, Advice::Inconsistent(_)));
        }
    }

    #[test]
    fn lag_warning_does_not_change_advice() {
        let clock = Arc::new(ManualClock::new(0));
        let mut engine = PacingEngine::new(clock.clone()).with_lag_warning(Some(100));
        engine.advise(0);

        clock.set(1_000);
        assert!(matches!(engine.advise(10_000), Advice::Immediate(_)));
        assert!(engine.lagging);

        assert!(matches!(engine.advise(1_000_000), Advice::Immediate(_)));
        assert!(!engine.lagging);
    }
}

//! Clock and timing utilities.
//!
//! Segment names and rotation boundaries are wall-clock based, so the engine
//! reads time through the [`Clock`] trait. Uptime and pacing use a monotonic
//! [`RecordingClock`] anchored at session start.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

/// The system's local wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// A clock that only moves when told to. Used by tests and the synthetic camera.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Local>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Local>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, to: DateTime<Local>) {
        *self.now.lock().unwrap_or_else(|p| p.into_inner()) = to;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Local> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// A recording clock that provides monotonic timestamps relative to
/// a fixed epoch (the moment recording started).
#[derive(Debug, Clone)]
pub struct RecordingClock {
    /// The instant recording started.
    epoch: Instant,

    /// Wall-clock time at epoch (RFC 3339 string).
    epoch_wall: String,
}

impl RecordingClock {
    /// Create a new recording clock anchored to now.
    pub fn start() -> Self {
        Self {
            epoch: Instant::now(),
            epoch_wall: Local::now().to_rfc3339(),
        }
    }

    /// Get nanoseconds elapsed since recording start.
    pub fn elapsed_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    /// Get seconds elapsed since recording start.
    pub fn elapsed_secs(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    /// Wall-clock time at recording start.
    pub fn epoch_wall(&self) -> &str {
        &self.epoch_wall
    }

    /// Convert an elapsed nanosecond value to seconds.
    pub fn ns_to_secs(ns: u64) -> f64 {
        ns as f64 / 1_000_000_000.0
    }
}

/// Difference between a nominal and an observed duration.
#[derive(Debug, Clone, Copy)]
pub struct DriftMeasurement {
    /// Expected value (ns).
    pub reference_ns: u64,
    /// Observed value (ns).
    pub measured_ns: u64,
}

impl DriftMeasurement {
    pub fn between(reference: Duration, measured: Duration) -> Self {
        Self {
            reference_ns: reference.as_nanos() as u64,
            measured_ns: measured.as_nanos() as u64,
        }
    }

    /// Drift in nanoseconds (positive = measured is longer).
    pub fn drift_ns(&self) -> i64 {
        self.measured_ns as i64 - self.reference_ns as i64
    }

    /// Drift in milliseconds.
    pub fn drift_ms(&self) -> f64 {
        self.drift_ns() as f64 / 1_000_000.0
    }

    /// Whether drift exceeds an acceptable threshold.
    pub fn exceeds_threshold_ms(&self, threshold_ms: f64) -> bool {
        self.drift_ms().abs() > threshold_ms
    }
}

/// Rate limiter for periodic work inside a hot loop.
#[derive(Debug)]
pub struct RateController {
    target_interval_ns: u64,
    last_tick_ns: Option<u64>,
}

impl RateController {
    /// Create a controller targeting the given Hz rate.
    pub fn new(target_hz: u32) -> Self {
        Self {
            target_interval_ns: 1_000_000_000 / target_hz.max(1) as u64,
            last_tick_ns: None,
        }
    }

    /// Check if enough time has passed for the next tick.
    /// Returns true and updates internal state if ready.
    /// The first call always returns true.
    pub fn should_tick(&mut self, current_ns: u64) -> bool {
        match self.last_tick_ns {
            None => {
                self.last_tick_ns = Some(current_ns);
                true
            }
            Some(last) if current_ns >= last + self.target_interval_ns => {
                self.last_tick_ns = Some(current_ns);
                true
            }
            _ => false,
        }
    }

    /// Target interval in nanoseconds.
    pub fn interval_ns(&self) -> u64 {
        self.target_interval_ns
    }
}

/// Nominal spacing between frames at `fps` (0 is treated as 1).
pub fn frame_interval(fps: u32) -> Duration {
    Duration::from_nanos(1_000_000_000 / fps.max(1) as u64)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_clock_elapsed() {
        let clock = RecordingClock::start();
        assert!(clock.elapsed_ns() < 1_000_000_000);
    }

    #[test]
    fn test_manual_clock_advances() {
        let start = Local.with_ymd_and_hms(2025, 1, 21, 12, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.now().format("%H%M%S").to_string(), "120130");
    }

    #[test]
    fn test_drift_measurement() {
        let drift = DriftMeasurement::between(Duration::from_secs(60), Duration::from_millis(60_050));
        assert_eq!(drift.drift_ns(), 50_000_000);
        assert!((drift.drift_ms() - 50.0).abs() < 1e-9);
        assert!(drift.exceeds_threshold_ms(10.0));
        assert!(!drift.exceeds_threshold_ms(100.0));
    }

    #[test]
    fn test_rate_controller() {
        let mut ctrl = RateController::new(60);
        assert!(ctrl.should_tick(0));
        assert!(!ctrl.should_tick(1_000_000));
        assert!(ctrl.should_tick(17_000_000));
    }

    #[test]
    fn test_frame_interval() {
        assert_eq!(frame_interval(10), Duration::from_millis(100));
        assert_eq!(frame_interval(0), Duration::from_secs(1));
    }
}

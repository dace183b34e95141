//! Stationary detection.
//!
//! A fix counts as stopped only when the reported speed is low (or missing)
//! *and* the position has stayed within the drift tolerance of the anchor.
//! Low GPS speeds near intersections are unreliable on their own, so the
//! displacement check keeps slow driving from being credited as idle time.
//!
//! Stops shorter than the duration threshold (a quick light) contribute
//! nothing. Long stops are committed in threshold-sized or longer chunks,
//! rolling the start forward each time so nothing is counted twice.

use crate::geo_utils::{elapsed_seconds, haversine_distance};
use crate::TrackingConfig;

#[derive(Debug, Clone)]
pub struct StopDetector {
    speed_stopped_threshold_mps: f64,
    drift_tolerance_m: f64,
    stopped_duration_threshold_s: f64,

    stopped_since_ms: Option<i64>,
    stopped_seconds: f64,
    anchor: Option<(f64, f64)>,
}

impl StopDetector {
    pub fn new(config: &TrackingConfig) -> Self {
        Self {
            speed_stopped_threshold_mps: config.speed_stopped_threshold_mps,
            drift_tolerance_m: config.min_distance_threshold_m,
            stopped_duration_threshold_s: config.stopped_duration_threshold_s,
            stopped_since_ms: None,
            stopped_seconds: 0.0,
            anchor: None,
        }
    }

    /// Start from a previously checkpointed total (process restart).
    pub fn with_stopped_seconds(config: &TrackingConfig, stopped_seconds: f64) -> Self {
        Self {
            stopped_seconds: stopped_seconds.max(0.0),
            ..Self::new(config)
        }
    }

    /// Feed one accepted fix; returns cumulative stopped seconds.
    pub fn update(
        &mut self,
        speed_mps: Option<f64>,
        timestamp_ms: i64,
        latitude: f64,
        longitude: f64,
    ) -> f64 {
        let slow = match speed_mps {
            None => true,
            Some(speed) => speed < self.speed_stopped_threshold_mps,
        };
        let drift = self
            .anchor
            .map(|(lat, lon)| haversine_distance(lat, lon, latitude, longitude))
            .unwrap_or(0.0);
        let stopped = slow && drift <= self.drift_tolerance_m;

        if stopped {
            let since = match self.stopped_since_ms {
                Some(since) => since,
                None => {
                    self.stopped_since_ms = Some(timestamp_ms);
                    self.anchor = Some((latitude, longitude));
                    timestamp_ms
                }
            };

            let duration = elapsed_seconds(since, timestamp_ms);
            if duration >= self.stopped_duration_threshold_s {
                self.stopped_seconds += duration;
                self.stopped_since_ms = Some(timestamp_ms);
            }
        } else {
            if let Some(since) = self.stopped_since_ms.take() {
                let duration = elapsed_seconds(since, timestamp_ms);
                if duration >= self.stopped_duration_threshold_s {
                    self.stopped_seconds += duration;
                }
            }
            self.anchor = Some((latitude, longitude));
        }

        self.stopped_seconds
    }

    pub fn stopped_seconds(&self) -> f64 {
        self.stopped_seconds
    }

    /// True while a stop is pending (not yet necessarily committed).
    pub fn is_stationary(&self) -> bool {
        self.stopped_since_ms.is_some()
    }

    pub fn reset(&mut self) {
        self.stopped_since_ms = None;
        self.stopped_seconds = 0.0;
        self.anchor = None;
    }
}

impl Default for StopDetector {
    fn default() -> Self {
        Self::new(&TrackingConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAT: f64 = 40.0;
    const LON: f64 = -74.0;

    /// Feed a stationary sequence every `step_s` seconds from `from_s` to `to_s` inclusive.
    fn hold(detector: &mut StopDetector, from_s: i64, to_s: i64, step_s: i64) -> f64 {
        let mut total = detector.stopped_seconds();
        let mut t = from_s;
        while t <= to_s {
            total = detector.update(Some(0.0), t * 1000, LAT, LON);
            t += step_s;
        }
        total
    }

    #[test]
    fn test_long_stop_accrues_full_duration() {
        let mut detector = StopDetector::default();
        let total = hold(&mut detector, 0, 15, 3);
        assert!(total >= 15.0, "got {}", total);
        assert!(detector.is_stationary());
    }

    #[test]
    fn test_long_stop_rolls_forward_without_double_counting() {
        let mut detector = StopDetector::default();
        let total = hold(&mut detector, 0, 60, 3);
        // 0..15 commits 15, then 15..30, 30..45, 45..60
        assert_eq!(total, 60.0);
    }

    #[test]
    fn test_short_stop_then_move_contributes_nothing() {
        let mut detector = StopDetector::default();
        hold(&mut detector, 0, 5, 1);
        let total = detector.update(Some(8.0), 6_000, LAT + 0.001, LON);
        assert_eq!(total, 0.0);
        assert!(!detector.is_stationary());
    }

    #[test]
    fn test_pending_stop_committed_on_departure() {
        let mut detector = StopDetector::default();
        detector.update(Some(0.0), 0, LAT, LON);
        detector.update(Some(0.0), 12_000, LAT, LON);
        // Departs at 20s: the 20s pending stop clears the threshold
        let total = detector.update(Some(10.0), 20_000, LAT + 0.001, LON);
        assert_eq!(total, 20.0);
    }

    #[test]
    fn test_slow_but_drifting_is_not_stopped() {
        let mut detector = StopDetector::default();
        // Crawling at 0.3 m/s but covering ~11m between fixes
        for i in 0..10 {
            detector.update(Some(0.3), i * 5_000, LAT + i as f64 * 0.0001, LON);
        }
        assert_eq!(detector.stopped_seconds(), 0.0);
    }

    #[test]
    fn test_missing_speed_treated_as_slow() {
        let mut detector = StopDetector::default();
        detector.update(None, 0, LAT, LON);
        let total = detector.update(None, 20_000, LAT, LON);
        assert_eq!(total, 20.0);
    }

    #[test]
    fn test_stopped_seconds_monotonic() {
        let mut detector = StopDetector::default();
        let mut last = 0.0;
        let pattern = [
            (Some(0.0), 0.0),
            (Some(0.0), 0.0),
            (Some(12.0), 0.001),
            (Some(0.1), 0.001),
            (None, 0.001),
            (Some(20.0), 0.01),
        ];
        for (i, (speed, offset)) in pattern.iter().cycle().take(60).enumerate() {
            let total = detector.update(*speed, i as i64 * 4_000, LAT + offset, LON);
            assert!(total >= last);
            last = total;
        }
    }

    #[test]
    fn test_seeded_total_and_reset() {
        let mut detector = StopDetector::with_stopped_seconds(&TrackingConfig::default(), 42.0);
        assert_eq!(detector.stopped_seconds(), 42.0);
        detector.update(Some(0.0), 0, LAT, LON);
        detector.reset();
        assert_eq!(detector.stopped_seconds(), 0.0);
        assert!(!detector.is_stationary());
    }
}

//! # Trip Tracker
//!
//! Real-time GPS trip tracking for a single active driving session.
//!
//! This library provides:
//! - Noise rejection for raw OS location fixes (accuracy, jitter, teleport)
//! - Stop detection cross-checked against positional drift
//! - Gap-aware cumulative distance
//! - Batched route recording and periodic crash-safe checkpoints
//! - A uniform start/stop/status controller over Android and iOS location delivery
//!
//! ## Features
//!
//! - **`persistence`** - SQLite storage for session records, route points and gaps (default)
//! - **`ffi`** - FFI bindings for mobile platforms (iOS/Android)
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use trip_tracker::{
//!     MemoryTripStore, NullStatsSink, RawFix, SessionAggregator, TrackingConfig, TripStores,
//! };
//!
//! let store = Arc::new(MemoryTripStore::new());
//! let mut session = SessionAggregator::start(
//!     "trip-1",
//!     true,
//!     TrackingConfig::default(),
//!     TripStores::from_shared(store.clone()),
//!     Arc::new(NullStatsSink),
//! )
//! .unwrap();
//!
//! session.process_location_update(&RawFix::new(40.0000, -74.0, Some(10.0), Some(0.0), 0));
//! session.process_location_update(&RawFix::new(40.0001, -74.0, Some(10.0), Some(5.0), 6_000));
//!
//! let totals = session.teardown();
//! assert!((totals.distance_meters - 11.1).abs() < 0.1);
//! ```

use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{OptionExt, Result, TrackingError};

// Geographic utilities (haversine distance, elapsed time)
pub mod geo_utils;

// Noise rejection for raw fixes
pub mod filter;
pub use filter::{FilterDecision, PointFilter, RejectReason};

// Stationary detection
pub mod stop_detector;
pub use stop_detector::StopDetector;

// Collaborator contracts (UI sink, session/route/gap stores)
pub mod store;
pub use store::{
    ActiveSession, GapReason, GapStore, MemoryTripStore, NullStatsSink, RoutePointStore,
    SessionStore, StatsSink, TrackingGap, TripStores,
};

// Background persistence with failure supervision
pub mod writer;
pub use writer::{WriteCommand, WriteKind, WriteOutcome};

// Per-session orchestrator
pub mod aggregator;
pub use aggregator::{FixOutcome, SessionAggregator};

// Platform tracking controllers (Android / iOS)
pub mod platform;
pub use platform::{
    complete_session, ActivityType, AndroidProfile, IosProfile, LocationBackend, LocationPriority,
    LocationRequest, MotionState, NativeProfile, NativeTracker, PlatformOptions, PlatformProfile,
    PlatformTracker, StartConfig, TrackingController,
};

// SQLite storage for session state
#[cfg(feature = "persistence")]
pub mod persistence;
#[cfg(feature = "persistence")]
pub use persistence::SqliteTripStore;

// FFI bindings for mobile platforms (iOS/Android)
#[cfg(feature = "ffi")]
pub mod ffi;

#[cfg(feature = "ffi")]
uniffi::setup_scaffolding!();

/// Initialize logging for Android
#[cfg(target_os = "android")]
pub fn init_logging() {
    use android_logger::Config;
    use log::LevelFilter;

    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Debug)
            .with_tag("TripTracker"),
    );
}

/// Initialize logging for iOS (unified logging via os_log)
#[cfg(target_os = "ios")]
pub fn init_logging() {
    use log::LevelFilter;
    use once_cell::sync::OnceCell;
    use oslog::OsLogger;

    static LOGGER: OnceCell<()> = OnceCell::new();
    LOGGER.get_or_init(|| {
        // A host that already installed a logger wins
        let _ = OsLogger::new("com.triptracker.core")
            .level_filter(LevelFilter::Debug)
            .init();
    });
}

#[cfg(not(any(target_os = "android", target_os = "ios")))]
pub fn init_logging() {
    // No-op on desktop; hosts and tests install their own logger
}

// ============================================================================
// Core Types
// ============================================================================

/// A location fix as delivered by the OS. Untrusted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct RawFix {
    pub latitude: f64,
    pub longitude: f64,
    /// Reported horizontal accuracy radius in meters
    pub accuracy_meters: Option<f64>,
    /// Reported ground speed in m/s
    pub speed_mps: Option<f64>,
    /// Unix timestamp in milliseconds
    pub timestamp_ms: i64,
}

impl RawFix {
    pub fn new(
        latitude: f64,
        longitude: f64,
        accuracy_meters: Option<f64>,
        speed_mps: Option<f64>,
        timestamp_ms: i64,
    ) -> Self {
        Self {
            latitude,
            longitude,
            accuracy_meters,
            speed_mps,
            timestamp_ms,
        }
    }

    /// Check if the fix has valid coordinates.
    pub fn is_valid(&self) -> bool {
        geo_utils::is_valid_coordinate(self.latitude, self.longitude)
    }
}

/// A fix that passed the [`PointFilter`]. Accuracy is always known.
///
/// Fields are read-only; the only way to obtain one is through the filter
/// (or by loading a persisted route point).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AcceptedPoint {
    latitude: f64,
    longitude: f64,
    accuracy_meters: f64,
    speed_mps: Option<f64>,
    timestamp_ms: i64,
}

impl AcceptedPoint {
    pub(crate) fn from_fix(raw: &RawFix, accuracy_meters: f64) -> Self {
        Self {
            latitude: raw.latitude,
            longitude: raw.longitude,
            accuracy_meters,
            speed_mps: raw.speed_mps,
            timestamp_ms: raw.timestamp_ms,
        }
    }

    /// Rebuild a point read back from storage.
    #[cfg_attr(not(feature = "persistence"), allow(dead_code))]
    pub(crate) fn restore(
        latitude: f64,
        longitude: f64,
        accuracy_meters: f64,
        speed_mps: Option<f64>,
        timestamp_ms: i64,
    ) -> Self {
        Self {
            latitude,
            longitude,
            accuracy_meters,
            speed_mps,
            timestamp_ms,
        }
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    pub fn accuracy_meters(&self) -> f64 {
        self.accuracy_meters
    }

    pub fn speed_mps(&self) -> Option<f64> {
        self.speed_mps
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    /// Great-circle distance to another point in meters.
    pub fn distance_to(&self, other: &AcceptedPoint) -> f64 {
        geo_utils::haversine_distance(
            self.latitude,
            self.longitude,
            other.latitude,
            other.longitude,
        )
    }
}

/// UI-facing GPS quality, derived from a single fix's accuracy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
pub enum GpsSignalLevel {
    Good,
    Weak,
    Lost,
}

impl GpsSignalLevel {
    /// Classify a reported accuracy radius. Absent or non-finite is `Lost`.
    pub fn classify(accuracy_meters: Option<f64>, config: &TrackingConfig) -> Self {
        match accuracy_meters {
            Some(acc) if acc.is_finite() && acc <= config.accuracy_good_m => GpsSignalLevel::Good,
            Some(acc) if acc.is_finite() && acc <= config.accuracy_weak_m => GpsSignalLevel::Weak,
            _ => GpsSignalLevel::Lost,
        }
    }
}

/// Live totals pushed to the UI after every accepted fix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct TripStats {
    pub distance_meters: f64,
    pub stopped_seconds: f64,
    /// Seconds since tracking actually started (first accepted fix)
    pub elapsed_seconds: f64,
}

/// Final totals returned by teardown.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct SessionTotals {
    pub distance_meters: f64,
    pub stopped_seconds: f64,
    pub route_point_count: u32,
}

/// In-progress totals written periodically for crash recovery.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SessionCheckpoint {
    pub distance_meters: f64,
    pub stopped_seconds: f64,
    pub route_point_count: u32,
    /// Timestamp of the first accepted fix, if any
    pub tracking_started_at_ms: Option<i64>,
    /// Fix timestamp at which this checkpoint was taken
    pub checkpointed_at_ms: i64,
}

// ============================================================================
// Configuration
// ============================================================================

/// Tunable constants for the tracking pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
#[serde(default)]
pub struct TrackingConfig {
    /// OS sampling interval while moving.
    /// Default: 3000 ms
    pub moving_interval_ms: u32,

    /// OS sampling interval while stationary (Android only; iOS is distance driven).
    /// Default: 10000 ms
    pub stopped_interval_ms: u32,

    /// Minimum displacement the OS should wait for before delivering.
    /// Default: 5.0 meters
    pub min_displacement_m: f64,

    /// Fixes with a larger (or missing) accuracy radius are never trusted.
    /// Default: 50.0 meters
    pub min_accuracy_m: f64,

    /// Accuracy at or below this is shown as a good signal.
    /// Default: 30.0 meters
    pub accuracy_good_m: f64,

    /// Accuracy at or below this is shown as a weak signal.
    /// Default: 50.0 meters
    pub accuracy_weak_m: f64,

    /// Moves shorter than this from the last accepted point are jitter.
    /// Also the drift tolerance for stop detection.
    /// Default: 5.0 meters
    pub min_distance_threshold_m: f64,

    /// Implied speeds above this are GPS teleports.
    /// Default: 80.0 m/s (~288 km/h)
    pub max_speed_jump_mps: f64,

    /// Reported speeds below this count as stopped.
    /// Default: 0.5 m/s
    pub speed_stopped_threshold_mps: f64,

    /// A stop must last this long before it counts at all.
    /// Default: 15 seconds
    pub stopped_duration_threshold_s: f64,

    /// Accepted points further apart in time than this accrue no distance.
    /// Default: 30 seconds
    pub gap_time_threshold_s: f64,

    /// Route points are written in batches of this size.
    /// Default: 10
    pub batch_flush_size: u32,

    /// A checkpoint is written every N accepted points.
    /// Default: 5
    pub db_persist_interval: u32,

    /// Consecutive write failures before tracking is reported as degraded.
    /// Default: 3
    pub degraded_after_failures: u32,

    /// Upper bound on route points held for retry after failed batch writes.
    /// Default: 1000
    pub max_backlog_route_points: u32,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            moving_interval_ms: 3000,
            stopped_interval_ms: 10_000,
            min_displacement_m: 5.0,
            min_accuracy_m: 50.0,
            accuracy_good_m: 30.0,
            accuracy_weak_m: 50.0,
            min_distance_threshold_m: 5.0,
            max_speed_jump_mps: 80.0,
            speed_stopped_threshold_mps: 0.5,
            stopped_duration_threshold_s: 15.0,
            gap_time_threshold_s: 30.0,
            batch_flush_size: 10,
            db_persist_interval: 5,
            degraded_after_failures: 3,
            max_backlog_route_points: 1000,
        }
    }
}

impl TrackingConfig {
    /// Parse a (possibly partial) JSON config; missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: TrackingConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("min_accuracy_m", self.min_accuracy_m),
            ("accuracy_good_m", self.accuracy_good_m),
            ("accuracy_weak_m", self.accuracy_weak_m),
            ("max_speed_jump_mps", self.max_speed_jump_mps),
            ("gap_time_threshold_s", self.gap_time_threshold_s),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(TrackingError::config(format!(
                    "{} must be positive, got {}",
                    name, value
                )));
            }
        }

        let non_negative = [
            ("min_displacement_m", self.min_displacement_m),
            ("min_distance_threshold_m", self.min_distance_threshold_m),
            ("speed_stopped_threshold_mps", self.speed_stopped_threshold_mps),
            ("stopped_duration_threshold_s", self.stopped_duration_threshold_s),
        ];
        for (name, value) in non_negative {
            if !(value.is_finite() && value >= 0.0) {
                return Err(TrackingError::config(format!(
                    "{} must be non-negative, got {}",
                    name, value
                )));
            }
        }

        if self.accuracy_good_m > self.accuracy_weak_m {
            return Err(TrackingError::config(
                "accuracy_good_m must not exceed accuracy_weak_m",
            ));
        }
        if self.moving_interval_ms == 0 || self.stopped_interval_ms == 0 {
            return Err(TrackingError::config("sampling intervals must be non-zero"));
        }
        if self.batch_flush_size == 0 || self.db_persist_interval == 0 {
            return Err(TrackingError::config(
                "batch_flush_size and db_persist_interval must be non-zero",
            ));
        }
        if self.degraded_after_failures == 0 {
            return Err(TrackingError::config("degraded_after_failures must be non-zero"));
        }
        if self.max_backlog_route_points < self.batch_flush_size {
            return Err(TrackingError::config(
                "max_backlog_route_points must hold at least one batch",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_fix_validation() {
        assert!(RawFix::new(40.0, -74.0, Some(10.0), None, 0).is_valid());
        assert!(!RawFix::new(91.0, 0.0, Some(10.0), None, 0).is_valid());
        assert!(!RawFix::new(0.0, f64::INFINITY, Some(10.0), None, 0).is_valid());
    }

    #[test]
    fn test_signal_classification() {
        let config = TrackingConfig::default();
        assert_eq!(GpsSignalLevel::classify(Some(5.0), &config), GpsSignalLevel::Good);
        assert_eq!(GpsSignalLevel::classify(Some(30.0), &config), GpsSignalLevel::Good);
        assert_eq!(GpsSignalLevel::classify(Some(30.1), &config), GpsSignalLevel::Weak);
        assert_eq!(GpsSignalLevel::classify(Some(50.0), &config), GpsSignalLevel::Weak);
        assert_eq!(GpsSignalLevel::classify(Some(50.1), &config), GpsSignalLevel::Lost);
        assert_eq!(GpsSignalLevel::classify(None, &config), GpsSignalLevel::Lost);
        assert_eq!(
            GpsSignalLevel::classify(Some(f64::NAN), &config),
            GpsSignalLevel::Lost
        );
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(TrackingConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_config() {
        let config = TrackingConfig::from_json(r#"{"gap_time_threshold_s": 45.0}"#).unwrap();
        assert_eq!(config.gap_time_threshold_s, 45.0);
        assert_eq!(config.batch_flush_size, 10);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = TrackingConfig::from_json(r#"{"batch_flush_size": 0}"#).unwrap_err();
        assert!(matches!(err, TrackingError::InvalidConfig { .. }));

        let err = TrackingConfig::from_json(r#"{"accuracy_good_m": 80.0}"#).unwrap_err();
        assert!(matches!(err, TrackingError::InvalidConfig { .. }));

        assert!(TrackingConfig::from_json("not json").is_err());
    }
}

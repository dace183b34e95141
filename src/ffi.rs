//! FFI bindings for mobile platforms (iOS/Android).
//!
//! Exposes one [`TripTrackerHandle`] object to Kotlin and Swift. The host
//! implements [`LocationBridge`] over its OS location API and
//! [`TripStatsListener`] over its UI state, then forwards every delivery
//! batch to [`TripTrackerHandle::on_locations`].

use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};

use crate::error::{OptionExt, TrackingError};
use crate::persistence::SqliteTripStore;
use crate::platform::{
    complete_session, LocationBackend, LocationRequest, NativeProfile, NativeTracker,
    PlatformTracker, StartConfig, TrackingController,
};
use crate::store::{StatsSink, TripStores};
use crate::{init_logging, GpsSignalLevel, RawFix, SessionTotals, TrackingConfig, TripStats};

// ============================================================================
// Callback Interfaces (implemented in Kotlin/Swift)
// ============================================================================

/// OS location service, as seen from Rust.
#[uniffi::export(callback_interface)]
pub trait LocationBridge: Send + Sync {
    /// Start or reconfigure delivery. Return false if the OS refused
    /// (missing permission, services disabled).
    fn request_updates(&self, request: LocationRequest) -> bool;

    fn halt_updates(&self);
}

/// Receives live UI state. Called from the delivery thread and from the
/// background writer, so implementations must hop to the UI thread.
#[uniffi::export(callback_interface)]
pub trait TripStatsListener: Send + Sync {
    fn on_gps_signal(&self, level: GpsSignalLevel);

    fn on_stats(&self, stats: TripStats);

    fn on_tracking_degraded(&self, degraded: bool);
}

struct BridgeBackend(Box<dyn LocationBridge>);

impl LocationBackend for BridgeBackend {
    fn request_updates(&mut self, request: &LocationRequest) -> Result<(), TrackingError> {
        if self.0.request_updates(request.clone()) {
            Ok(())
        } else {
            Err(TrackingError::platform("location updates refused by the OS"))
        }
    }

    fn halt_updates(&mut self) -> Result<(), TrackingError> {
        self.0.halt_updates();
        Ok(())
    }
}

struct ListenerSink(Box<dyn TripStatsListener>);

impl StatsSink for ListenerSink {
    fn set_gps_signal(&self, level: GpsSignalLevel) {
        self.0.on_gps_signal(level);
    }

    fn update_stats(&self, stats: &TripStats) {
        self.0.on_stats(*stats);
    }

    fn set_tracking_degraded(&self, degraded: bool) {
        self.0.on_tracking_degraded(degraded);
    }
}

// ============================================================================
// Tracker Handle
// ============================================================================

/// Totals of a stopped session whose final write failed.
struct PendingCompletion {
    session_id: String,
    totals: SessionTotals,
}

/// Owns the tracker and its SQLite store for the lifetime of the app.
#[derive(uniffi::Object)]
pub struct TripTrackerHandle {
    tracker: Mutex<NativeTracker<BridgeBackend>>,
    store: Arc<SqliteTripStore>,
    pending: Mutex<Option<PendingCompletion>>,
}

impl TripTrackerHandle {
    fn lock(&self) -> Result<MutexGuard<'_, NativeTracker<BridgeBackend>>, TrackingError> {
        self.tracker.lock().map_err(|_| TrackingError::Internal {
            message: "tracker lock poisoned".to_string(),
        })
    }

    fn lock_pending(&self) -> Result<MutexGuard<'_, Option<PendingCompletion>>, TrackingError> {
        self.pending.lock().map_err(|_| TrackingError::Internal {
            message: "pending completion lock poisoned".to_string(),
        })
    }
}

#[uniffi::export]
impl TripTrackerHandle {
    #[uniffi::constructor]
    pub fn new(
        db_path: String,
        config: TrackingConfig,
        bridge: Box<dyn LocationBridge>,
        listener: Box<dyn TripStatsListener>,
    ) -> Result<Arc<Self>, TrackingError> {
        init_logging();
        let store = Arc::new(SqliteTripStore::new(&db_path)?);
        let tracker = PlatformTracker::new(
            NativeProfile::default(),
            BridgeBackend(bridge),
            config,
            TripStores::from_shared(store.clone()),
            Arc::new(ListenerSink(listener)),
        )?;
        info!("[TripTracker] Handle created for {}", db_path);

        Ok(Arc::new(Self {
            tracker: Mutex::new(tracker),
            store,
            pending: Mutex::new(None),
        }))
    }

    pub fn start(&self, session_id: String, route_enabled: bool) -> Result<(), TrackingError> {
        self.lock()?.start(StartConfig::new(session_id, route_enabled))
    }

    /// Forward one OS delivery batch. Returns how many fixes were accepted.
    pub fn on_locations(&self, fixes: Vec<RawFix>) -> u32 {
        match self.lock() {
            Ok(mut tracker) => tracker.on_locations(&fixes) as u32,
            Err(err) => {
                debug!("[TripTracker] Dropping {} fixes: {}", fixes.len(), err);
                0
            }
        }
    }

    /// Stop tracking and write the final totals.
    ///
    /// A failed final write is returned to the caller. The totals are kept
    /// on the handle (see [`Self::pending_completion`]) and the record stays
    /// incomplete until [`Self::retry_complete`] succeeds.
    pub fn stop_and_complete(&self) -> Result<SessionTotals, TrackingError> {
        let mut tracker = self.lock()?;
        let session_id = tracker
            .session()
            .map(|session| session.session_id().to_string())
            .ok_or_no_session()?;
        let totals = tracker.stop()?;
        if let Err(err) = complete_session(tracker.stores(), &session_id, &totals) {
            let mut pending = self.lock_pending()?;
            if let Some(previous) = pending.as_ref() {
                warn!(
                    "[TripTracker] Replacing pending completion of {}",
                    previous.session_id
                );
            }
            *pending = Some(PendingCompletion { session_id, totals });
            return Err(err);
        }
        Ok(totals)
    }

    /// Totals still waiting on their final write, if a completion failed.
    pub fn pending_completion(&self) -> Option<SessionTotals> {
        self.lock_pending()
            .ok()
            .and_then(|pending| pending.as_ref().map(|p| p.totals))
    }

    /// Retry the final write of a session whose completion failed.
    ///
    /// Returns the written totals, or `None` when nothing was pending. On
    /// failure the totals stay pending.
    pub fn retry_complete(&self) -> Result<Option<SessionTotals>, TrackingError> {
        let tracker = self.lock()?;
        let mut pending = self.lock_pending()?;
        let Some(completion) = pending.as_ref() else {
            return Ok(None);
        };
        complete_session(tracker.stores(), &completion.session_id, &completion.totals)?;
        info!("[TripTracker] Completed {} on retry", completion.session_id);
        Ok(pending.take().map(|completion| completion.totals))
    }

    /// Resume the session left active by a previous process, if any.
    pub fn resume(&self) -> Result<Option<String>, TrackingError> {
        self.lock()?.resume()
    }

    pub fn is_tracking(&self) -> bool {
        self.lock().map(|tracker| tracker.is_tracking()).unwrap_or(false)
    }

    /// Number of tracking gaps recorded for a session.
    pub fn gap_count(&self, session_id: String) -> Result<u32, TrackingError> {
        self.store.gap_count(&session_id)
    }

    /// Delete completed sessions older than `retention_days` (0 keeps all).
    pub fn cleanup_completed_sessions(&self, retention_days: u32) -> Result<u32, TrackingError> {
        self.store.cleanup_completed_sessions(retention_days)
    }
}

// ============================================================================
// Configuration
// ============================================================================

#[uniffi::export]
pub fn default_tracking_config() -> TrackingConfig {
    TrackingConfig::default()
}

/// Parse a partial JSON config; missing fields take defaults.
#[uniffi::export]
pub fn tracking_config_from_json(json: String) -> Result<TrackingConfig, TrackingError> {
    TrackingConfig::from_json(&json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingBridge {
        requests: Arc<AtomicU32>,
        allow: bool,
    }

    impl LocationBridge for CountingBridge {
        fn request_updates(&self, _request: LocationRequest) -> bool {
            self.requests.fetch_add(1, Ordering::SeqCst);
            self.allow
        }

        fn halt_updates(&self) {}
    }

    #[derive(Default)]
    struct StatsLog {
        stats: Mutex<Vec<TripStats>>,
    }

    struct SharedListener(Arc<StatsLog>);

    impl TripStatsListener for SharedListener {
        fn on_gps_signal(&self, _level: GpsSignalLevel) {}

        fn on_stats(&self, stats: TripStats) {
            self.0.stats.lock().unwrap().push(stats);
        }

        fn on_tracking_degraded(&self, _degraded: bool) {}
    }

    fn handle(allow: bool) -> (Arc<TripTrackerHandle>, Arc<AtomicU32>, Arc<StatsLog>) {
        let requests = Arc::new(AtomicU32::new(0));
        let log = Arc::new(StatsLog::default());
        let handle = TripTrackerHandle::new(
            ":memory:".to_string(),
            default_tracking_config(),
            Box::new(CountingBridge {
                requests: requests.clone(),
                allow,
            }),
            Box::new(SharedListener(log.clone())),
        )
        .unwrap();
        (handle, requests, log)
    }

    #[test]
    fn test_handle_round_trip() {
        let (handle, requests, log) = handle(true);
        handle.start("trip".to_string(), true).unwrap();
        assert!(handle.is_tracking());
        assert_eq!(requests.load(Ordering::SeqCst), 1);

        let accepted = handle.on_locations(vec![
            RawFix::new(40.0, -74.0, Some(10.0), Some(6.0), 0),
            RawFix::new(40.0001, -74.0, Some(10.0), Some(6.0), 2_000),
        ]);
        assert_eq!(accepted, 2);
        assert_eq!(log.stats.lock().unwrap().len(), 2);

        let totals = handle.stop_and_complete().unwrap();
        assert!((totals.distance_meters - 11.12).abs() < 0.1);
        assert!(!handle.is_tracking());
        assert_eq!(handle.gap_count("trip".to_string()).unwrap(), 0);
        assert_eq!(handle.stop_and_complete(), Err(TrackingError::NoActiveSession));
    }

    #[test]
    fn test_failed_complete_keeps_totals_for_retry() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("trips.db");
        let db_path = db_path.to_str().unwrap().to_string();
        let handle = TripTrackerHandle::new(
            db_path.clone(),
            default_tracking_config(),
            Box::new(CountingBridge {
                requests: Arc::new(AtomicU32::new(0)),
                allow: true,
            }),
            Box::new(SharedListener(Arc::new(StatsLog::default()))),
        )
        .unwrap();
        assert_eq!(handle.retry_complete().unwrap(), None);

        handle.start("trip".to_string(), false).unwrap();
        handle.on_locations(vec![
            RawFix::new(40.0, -74.0, Some(10.0), Some(6.0), 0),
            RawFix::new(40.0001, -74.0, Some(10.0), Some(6.0), 2_000),
        ]);

        // Reject the final write from a second connection
        let admin = rusqlite::Connection::open(&db_path).unwrap();
        admin
            .execute_batch(
                "CREATE TRIGGER refuse_complete BEFORE UPDATE OF completed_at ON sessions
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            )
            .unwrap();

        let err = handle.stop_and_complete().unwrap_err();
        assert!(matches!(err, TrackingError::Persistence { .. }));
        assert!(!handle.is_tracking());
        let pending = handle.pending_completion().unwrap();
        assert!((pending.distance_meters - 11.12).abs() < 0.1);
        assert!(handle.retry_complete().is_err());
        assert_eq!(handle.pending_completion(), Some(pending));

        admin.execute_batch("DROP TRIGGER refuse_complete;").unwrap();
        assert_eq!(handle.retry_complete().unwrap(), Some(pending));
        assert_eq!(handle.pending_completion(), None);

        let record = handle.store.session_record("trip").unwrap().unwrap();
        assert_eq!(record.totals, Some(pending));
        assert!(!record.active);
    }

    #[test]
    fn test_refused_bridge_surfaces_platform_error() {
        let (handle, _, _) = handle(false);
        let err = handle.start("trip".to_string(), false).unwrap_err();
        assert!(matches!(err, TrackingError::Platform { .. }));
        assert!(!handle.is_tracking());
    }
}

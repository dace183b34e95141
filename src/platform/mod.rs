//! # Platform Tracking Controller
//!
//! A uniform start/stop/status contract over the OS's background location
//! delivery. The OS bridge itself is a [`LocationBackend`]; what differs
//! between Android and iOS is only the [`LocationRequest`] each one asks
//! for, supplied by a [`PlatformProfile`]. [`PlatformTracker`] implements the
//! controller once for both.
//!
//! Fixes arrive through [`PlatformTracker::on_locations`] and are handed to
//! the active [`SessionAggregator`] in delivery order. When the stop detector
//! changes between moving and stationary, the tracker re-requests updates
//! with that state's sampling parameters if they actually differ.

mod android;
mod ios;

pub use android::AndroidProfile;
pub use ios::IosProfile;

use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::aggregator::SessionAggregator;
use crate::error::{OptionExt, Result, TrackingError};
use crate::store::{StatsSink, TripStores};
use crate::{RawFix, SessionTotals, TrackingConfig};

// ============================================================================
// Location requests
// ============================================================================

/// Whether the vehicle is currently moving, as judged by the stop detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
pub enum MotionState {
    Moving,
    Stationary,
}

/// Android fused-provider priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
pub enum LocationPriority {
    HighAccuracy,
    Balanced,
}

/// iOS activity type hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
pub enum ActivityType {
    AutomotiveNavigation,
    Fitness,
    Other,
}

/// Settings only one OS understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
pub enum PlatformOptions {
    Android {
        priority: LocationPriority,
        /// Keep delivery alive in the background with a persistent notification
        foreground_notification: bool,
    },
    Ios {
        activity_type: ActivityType,
        shows_background_indicator: bool,
        pauses_automatically: bool,
    },
}

/// What the OS bridge should ask the platform for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct LocationRequest {
    /// Desired delivery interval (ignored by distance-driven platforms)
    pub interval_ms: u32,
    /// Minimum movement before the OS delivers a new fix
    pub min_displacement_m: f64,
    pub options: PlatformOptions,
}

/// Builds the platform's location request for a motion state.
pub trait PlatformProfile: Send {
    fn name(&self) -> &'static str;

    fn location_request(&self, config: &TrackingConfig, motion: MotionState) -> LocationRequest;
}

#[cfg(target_os = "ios")]
pub type NativeProfile = IosProfile;

#[cfg(not(target_os = "ios"))]
pub type NativeProfile = AndroidProfile;

/// Tracker for the platform this crate was built for.
pub type NativeTracker<B> = PlatformTracker<NativeProfile, B>;

/// Bridge to the OS location service.
///
/// Implementations forward requests to the platform API; fixes come back
/// through [`PlatformTracker::on_locations`].
pub trait LocationBackend: Send {
    /// Start (or reconfigure) delivery.
    fn request_updates(&mut self, request: &LocationRequest) -> Result<()>;

    fn halt_updates(&mut self) -> Result<()>;
}

// ============================================================================
// Controller
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartConfig {
    pub session_id: String,
    pub route_enabled: bool,
}

impl StartConfig {
    pub fn new(session_id: impl Into<String>, route_enabled: bool) -> Self {
        Self {
            session_id: session_id.into(),
            route_enabled,
        }
    }
}

/// Uniform start/stop/status contract.
pub trait TrackingController {
    fn start(&mut self, config: StartConfig) -> Result<()>;

    /// Halt delivery, tear the session down and return its totals.
    ///
    /// The caller still owes the final [`complete_session`] write.
    fn stop(&mut self) -> Result<SessionTotals>;

    fn is_tracking(&self) -> bool;
}

pub struct PlatformTracker<P: PlatformProfile, B: LocationBackend> {
    profile: P,
    backend: B,
    config: TrackingConfig,
    stores: TripStores,
    sink: Arc<dyn StatsSink>,

    session: Option<SessionAggregator>,
    delivering: bool,
    motion: MotionState,
    current_request: Option<LocationRequest>,
}

impl<P: PlatformProfile, B: LocationBackend> PlatformTracker<P, B> {
    pub fn new(
        profile: P,
        backend: B,
        config: TrackingConfig,
        stores: TripStores,
        sink: Arc<dyn StatsSink>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            profile,
            backend,
            config,
            stores,
            sink,
            session: None,
            delivering: false,
            motion: MotionState::Moving,
            current_request: None,
        })
    }

    /// Feed one OS delivery batch, in order. Returns how many were accepted.
    ///
    /// Deliveries that race a stop (no active session) are dropped.
    pub fn on_locations(&mut self, fixes: &[RawFix]) -> usize {
        let Some(session) = self.session.as_mut() else {
            debug!(
                "[TripTracker] Dropping {} fixes delivered with no active session",
                fixes.len()
            );
            return 0;
        };

        let accepted = session.process_batch(fixes);
        let motion = if session.is_stationary() {
            MotionState::Stationary
        } else {
            MotionState::Moving
        };
        if motion != self.motion {
            self.adapt_sampling(motion);
        }
        accepted
    }

    /// Pick up the session that was active when the process last died.
    ///
    /// Returns the resumed session id, or `None` if there was nothing to
    /// resume.
    pub fn resume(&mut self) -> Result<Option<String>> {
        self.ensure_idle()?;
        let Some(active) = self.stores.sessions.active_session()? else {
            return Ok(None);
        };

        let session_id = active.session_id.clone();
        let session = SessionAggregator::resume(
            active,
            self.config.clone(),
            self.stores.clone(),
            self.sink.clone(),
        )?;
        self.session = Some(session);
        self.begin_delivery(false)?;
        info!(
            "[TripTracker] {} tracker resumed session {}",
            self.profile.name(),
            session_id
        );
        Ok(Some(session_id))
    }

    fn ensure_idle(&self) -> Result<()> {
        match &self.session {
            Some(active) => Err(TrackingError::SessionAlreadyActive {
                active_session_id: active.session_id().to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Ask the backend for moving-rate updates. On refusal the session is
    /// released; `clear_on_failure` decides whether its record stops being
    /// active. A resumed session keeps its marker so a later `resume` can
    /// pick it up once the OS allows delivery.
    fn begin_delivery(&mut self, clear_on_failure: bool) -> Result<()> {
        let request = self
            .profile
            .location_request(&self.config, MotionState::Moving);
        if let Err(err) = self.backend.request_updates(&request) {
            warn!("[TripTracker] Location request refused: {}", err);
            if let Some(session) = self.session.take() {
                if clear_on_failure {
                    session.teardown();
                } else {
                    info!(
                        "[TripTracker] Session {} left active for a later resume",
                        session.session_id()
                    );
                    drop(session);
                }
            }
            return Err(err);
        }
        self.delivering = true;
        self.motion = MotionState::Moving;
        self.current_request = Some(request);
        Ok(())
    }

    fn adapt_sampling(&mut self, motion: MotionState) {
        self.motion = motion;
        let request = self.profile.location_request(&self.config, motion);
        if self.current_request.as_ref() == Some(&request) {
            return;
        }
        match self.backend.request_updates(&request) {
            Ok(()) => {
                debug!(
                    "[TripTracker] {:?}: sampling every {}ms",
                    motion, request.interval_ms
                );
                self.current_request = Some(request);
            }
            // Delivery continues with the previous request
            Err(err) => warn!("[TripTracker] Sampling change refused: {}", err),
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn session(&self) -> Option<&SessionAggregator> {
        self.session.as_ref()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn profile(&self) -> &P {
        &self.profile
    }

    pub fn stores(&self) -> &TripStores {
        &self.stores
    }

    pub fn config(&self) -> &TrackingConfig {
        &self.config
    }

    pub fn motion_state(&self) -> MotionState {
        self.motion
    }

    /// The request the backend is currently delivering with.
    pub fn current_request(&self) -> Option<&LocationRequest> {
        self.current_request.as_ref()
    }
}

impl<P: PlatformProfile, B: LocationBackend> TrackingController for PlatformTracker<P, B> {
    fn start(&mut self, config: StartConfig) -> Result<()> {
        self.ensure_idle()?;
        let session = SessionAggregator::start(
            config.session_id,
            config.route_enabled,
            self.config.clone(),
            self.stores.clone(),
            self.sink.clone(),
        )?;
        self.session = Some(session);
        self.begin_delivery(true)
    }

    fn stop(&mut self) -> Result<SessionTotals> {
        let session = self.session.take().ok_or_no_session()?;
        if self.delivering {
            // Teardown proceeds regardless; a stuck OS subscription must not
            // cost the user their totals
            if let Err(err) = self.backend.halt_updates() {
                warn!("[TripTracker] Failed to halt location updates: {}", err);
            }
            self.delivering = false;
        }
        self.current_request = None;
        self.motion = MotionState::Moving;
        Ok(session.teardown())
    }

    fn is_tracking(&self) -> bool {
        self.session.is_some()
    }
}

/// Authoritative final write of a torn-down session.
///
/// Unlike live writes this is not best-effort: the error goes back to the
/// caller so the user can be told their trip was not saved.
pub fn complete_session(stores: &TripStores, session_id: &str, totals: &SessionTotals) -> Result<()> {
    stores
        .sessions
        .complete(session_id, totals)
        .inspect_err(|err| warn!("[TripTracker] Completing {} failed: {}", session_id, err))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryTripStore, NullStatsSink, RoutePointStore, SessionStore};
    use crate::SessionCheckpoint;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockBackend {
        requests: Arc<Mutex<Vec<LocationRequest>>>,
        halts: Arc<Mutex<u32>>,
        refuse: Arc<AtomicBool>,
    }

    impl LocationBackend for MockBackend {
        fn request_updates(&mut self, request: &LocationRequest) -> Result<()> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(TrackingError::platform("permission denied"));
            }
            self.requests.lock().unwrap().push(request.clone());
            Ok(())
        }

        fn halt_updates(&mut self) -> Result<()> {
            *self.halts.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn tracker<P: PlatformProfile>(
        profile: P,
        backend: MockBackend,
    ) -> (PlatformTracker<P, MockBackend>, Arc<MemoryTripStore>) {
        let store = Arc::new(MemoryTripStore::new());
        let tracker = PlatformTracker::new(
            profile,
            backend,
            TrackingConfig::default(),
            TripStores::from_shared(store.clone()),
            Arc::new(NullStatsSink),
        )
        .unwrap();
        (tracker, store)
    }

    fn fix(lat: f64, speed: f64, t_s: i64) -> RawFix {
        RawFix::new(lat, -74.0, Some(8.0), Some(speed), t_s * 1000)
    }

    #[test]
    fn test_start_requests_moving_updates() {
        let backend = MockBackend::default();
        let requests = backend.requests.clone();
        let (mut tracker, _) = tracker(AndroidProfile, backend);

        tracker.start(StartConfig::new("s1", true)).unwrap();
        assert!(tracker.is_tracking());
        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].interval_ms, 3000);
    }

    #[test]
    fn test_second_start_is_refused() {
        let (mut tracker, _) = tracker(AndroidProfile, MockBackend::default());
        tracker.start(StartConfig::new("s1", true)).unwrap();

        let err = tracker.start(StartConfig::new("s2", true)).unwrap_err();
        assert_eq!(
            err,
            TrackingError::SessionAlreadyActive {
                active_session_id: "s1".to_string()
            }
        );
        assert_eq!(tracker.session().unwrap().session_id(), "s1");
    }

    #[test]
    fn test_stop_without_session() {
        let (mut tracker, _) = tracker(AndroidProfile, MockBackend::default());
        assert_eq!(tracker.stop(), Err(TrackingError::NoActiveSession));
    }

    #[test]
    fn test_stop_halts_and_returns_totals() {
        let backend = MockBackend::default();
        let halts = backend.halts.clone();
        let (mut tracker, store) = tracker(AndroidProfile, backend);

        tracker.start(StartConfig::new("s1", true)).unwrap();
        let accepted = tracker.on_locations(&[fix(40.0, 7.0, 0), fix(40.0002, 7.0, 3)]);
        assert_eq!(accepted, 2);

        let totals = tracker.stop().unwrap();
        assert!(!tracker.is_tracking());
        assert_eq!(*halts.lock().unwrap(), 1);
        assert!((totals.distance_meters - 22.24).abs() < 0.1);
        assert_eq!(totals.route_point_count, 2);
        assert_eq!(store.route_points("s1").unwrap().len(), 2);

        // Late delivery after stop is dropped
        assert_eq!(tracker.on_locations(&[fix(40.0004, 7.0, 6)]), 0);

        complete_session(tracker.stores(), "s1", &totals).unwrap();
        assert_eq!(store.session("s1").unwrap().totals, Some(totals));
    }

    #[test]
    fn test_refused_request_aborts_start() {
        let backend = MockBackend::default();
        backend.refuse.store(true, Ordering::SeqCst);
        let (mut tracker, store) = tracker(IosProfile, backend);

        let err = tracker.start(StartConfig::new("s1", false)).unwrap_err();
        assert!(matches!(err, TrackingError::Platform { .. }));
        assert!(!tracker.is_tracking());
        assert!(store.active_session().unwrap().is_none());
    }

    #[test]
    fn test_android_adapts_sampling_to_motion() {
        let backend = MockBackend::default();
        let requests = backend.requests.clone();
        let (mut tracker, _) = tracker(AndroidProfile, backend);
        tracker.start(StartConfig::new("s1", false)).unwrap();

        // Parked at start: first fix is stationary
        tracker.on_locations(&[fix(40.0, 0.0, 0)]);
        assert_eq!(tracker.motion_state(), MotionState::Stationary);
        assert_eq!(tracker.current_request().unwrap().interval_ms, 10_000);

        tracker.on_locations(&[fix(40.0002, 7.0, 20)]);
        assert_eq!(tracker.motion_state(), MotionState::Moving);

        let intervals: Vec<u32> = requests.lock().unwrap().iter().map(|r| r.interval_ms).collect();
        assert_eq!(intervals, vec![3000, 10_000, 3000]);
    }

    #[test]
    fn test_ios_does_not_rerequest_identical_settings() {
        let backend = MockBackend::default();
        let requests = backend.requests.clone();
        let (mut tracker, _) = tracker(IosProfile, backend);
        tracker.start(StartConfig::new("s1", false)).unwrap();

        tracker.on_locations(&[fix(40.0, 0.0, 0)]);
        assert_eq!(tracker.motion_state(), MotionState::Stationary);
        assert_eq!(requests.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_resume_continues_active_session() {
        let (mut tracker, store) = tracker(AndroidProfile, MockBackend::default());
        assert_eq!(tracker.resume().unwrap(), None);

        store.begin_session("crashed", true, 0).unwrap();
        store
            .checkpoint(
                "crashed",
                &SessionCheckpoint {
                    distance_meters: 1200.0,
                    stopped_seconds: 45.0,
                    route_point_count: 30,
                    tracking_started_at_ms: Some(0),
                    checkpointed_at_ms: 300_000,
                },
            )
            .unwrap();

        assert_eq!(tracker.resume().unwrap().as_deref(), Some("crashed"));
        assert!(tracker.is_tracking());
        assert!(matches!(
            tracker.resume(),
            Err(TrackingError::SessionAlreadyActive { .. })
        ));

        let totals = tracker.stop().unwrap();
        assert_eq!(totals.distance_meters, 1200.0);
        assert_eq!(totals.stopped_seconds, 45.0);
        assert_eq!(totals.route_point_count, 30);
    }

    #[test]
    fn test_refused_resume_keeps_session_resumable() {
        let backend = MockBackend::default();
        let refuse = backend.refuse.clone();
        refuse.store(true, Ordering::SeqCst);
        let (mut tracker, store) = tracker(AndroidProfile, backend);

        store.begin_session("crashed", true, 0).unwrap();
        store
            .checkpoint(
                "crashed",
                &SessionCheckpoint {
                    distance_meters: 800.0,
                    stopped_seconds: 0.0,
                    route_point_count: 12,
                    tracking_started_at_ms: Some(0),
                    checkpointed_at_ms: 120_000,
                },
            )
            .unwrap();

        let err = tracker.resume().unwrap_err();
        assert!(matches!(err, TrackingError::Platform { .. }));
        assert!(!tracker.is_tracking());
        let active = store.active_session().unwrap().unwrap();
        assert_eq!(active.session_id, "crashed");
        assert_eq!(active.checkpoint.unwrap().distance_meters, 800.0);
        assert!(store.session("crashed").unwrap().totals.is_none());

        // Permission granted later: the same session comes back
        refuse.store(false, Ordering::SeqCst);
        assert_eq!(tracker.resume().unwrap().as_deref(), Some("crashed"));
        let totals = tracker.stop().unwrap();
        assert_eq!(totals.distance_meters, 800.0);
        assert_eq!(totals.route_point_count, 12);
    }

    #[test]
    fn test_complete_session_propagates_failure() {
        let store = Arc::new(MemoryTripStore::new());
        let stores = TripStores::from_shared(store);
        let totals = SessionTotals {
            distance_meters: 10.0,
            stopped_seconds: 0.0,
            route_point_count: 0,
        };
        assert!(matches!(
            complete_session(&stores, "never-started", &totals),
            Err(TrackingError::Persistence { .. })
        ));
    }
}

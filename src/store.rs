//! Collaborator contracts for the tracking pipeline.
//!
//! The pipeline pushes live values to a [`StatsSink`] and writes durable
//! state through three stores. Hosts implement these over their own UI and
//! database, or use [`MemoryTripStore`] / [`crate::SqliteTripStore`].
//!
//! All traits are `Send + Sync`: the UI sink is called from the delivery
//! thread and from the background writer, and stores are only ever called
//! from the writer (plus the caller's final `complete`).

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrackingError};
use crate::{AcceptedPoint, GpsSignalLevel, SessionCheckpoint, SessionTotals, TripStats};

// ============================================================================
// Types
// ============================================================================

/// Why distance was not accrued over a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GapReason {
    /// Consecutive accepted points were further apart than the gap threshold
    SignalLoss,
    /// The process was killed and relaunched mid-session
    ProcessRestart,
}

impl GapReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            GapReason::SignalLoss => "signal_loss",
            GapReason::ProcessRestart => "process_restart",
        }
    }
}

impl fmt::Display for GapReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GapReason {
    type Err = TrackingError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "signal_loss" => Ok(GapReason::SignalLoss),
            "process_restart" => Ok(GapReason::ProcessRestart),
            other => Err(TrackingError::persistence(format!(
                "unknown gap reason '{}'",
                other
            ))),
        }
    }
}

/// A span during which no distance was accrued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingGap {
    pub id: i64,
    pub session_id: String,
    pub started_at_ms: i64,
    pub ended_at_ms: Option<i64>,
    pub reason: GapReason,
}

/// A session that was still marked active in durable storage.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveSession {
    pub session_id: String,
    pub route_enabled: bool,
    pub checkpoint: Option<SessionCheckpoint>,
}

// ============================================================================
// Traits
// ============================================================================

/// Push-only, best-effort UI state sink.
pub trait StatsSink: Send + Sync {
    fn set_gps_signal(&self, level: GpsSignalLevel);

    fn update_stats(&self, stats: &TripStats);

    /// Repeated write failures mean in-memory totals are no longer safe
    /// against a crash.
    fn set_tracking_degraded(&self, _degraded: bool) {}
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStatsSink;

impl StatsSink for NullStatsSink {
    fn set_gps_signal(&self, _level: GpsSignalLevel) {}

    fn update_stats(&self, _stats: &TripStats) {}
}

/// Durable session record.
pub trait SessionStore: Send + Sync {
    /// Create (or re-open) the record and mark it as the active session.
    fn begin_session(&self, session_id: &str, route_enabled: bool, created_at_ms: i64)
        -> Result<()>;

    /// First GPS lock; distinct from creation, which may precede it.
    fn mark_tracking_started(&self, session_id: &str, at_ms: i64) -> Result<()>;

    fn checkpoint(&self, session_id: &str, checkpoint: &SessionCheckpoint) -> Result<()>;

    /// Drop the active marker so a relaunch does not resume this session.
    fn clear_active(&self, session_id: &str) -> Result<()>;

    /// Authoritative final write. Failure must reach the user.
    fn complete(&self, session_id: &str, totals: &SessionTotals) -> Result<()>;

    fn load_checkpoint(&self, session_id: &str) -> Result<Option<SessionCheckpoint>>;

    fn active_session(&self) -> Result<Option<ActiveSession>>;
}

/// Route-point storage; written in ordered batches only.
pub trait RoutePointStore: Send + Sync {
    /// `first_sequence` is the 0-based index of `points[0]` within the session.
    fn insert_batch(
        &self,
        session_id: &str,
        first_sequence: u32,
        points: &[AcceptedPoint],
    ) -> Result<()>;

    fn route_points(&self, session_id: &str) -> Result<Vec<AcceptedPoint>>;

    /// Sequence the next batch for this session starts at (one past the
    /// highest stored point).
    fn next_sequence(&self, session_id: &str) -> Result<u32> {
        Ok(self.route_points(session_id)?.len() as u32)
    }
}

/// Tracking-gap storage.
pub trait GapStore: Send + Sync {
    fn start_gap(&self, session_id: &str, started_at_ms: i64, reason: GapReason) -> Result<i64>;

    fn end_gap(&self, gap_id: i64, ended_at_ms: i64) -> Result<()>;

    fn gaps_for_session(&self, session_id: &str) -> Result<Vec<TrackingGap>>;
}

/// The three stores the pipeline writes to, cheaply cloneable.
#[derive(Clone)]
pub struct TripStores {
    pub sessions: Arc<dyn SessionStore>,
    pub route_points: Arc<dyn RoutePointStore>,
    pub gaps: Arc<dyn GapStore>,
}

impl TripStores {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        route_points: Arc<dyn RoutePointStore>,
        gaps: Arc<dyn GapStore>,
    ) -> Self {
        Self {
            sessions,
            route_points,
            gaps,
        }
    }

    /// Use one backend for all three roles.
    pub fn from_shared<S>(store: Arc<S>) -> Self
    where
        S: SessionStore + RoutePointStore + GapStore + 'static,
    {
        Self {
            sessions: store.clone(),
            route_points: store.clone(),
            gaps: store,
        }
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// Session record as kept by the bundled stores.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub session_id: String,
    pub route_enabled: bool,
    pub created_at_ms: i64,
    pub tracking_started_at_ms: Option<i64>,
    pub checkpoint: Option<SessionCheckpoint>,
    pub totals: Option<SessionTotals>,
    pub active: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    sessions: HashMap<String, SessionRecord>,
    route_points: HashMap<String, Vec<AcceptedPoint>>,
    batch_sizes: HashMap<String, Vec<usize>>,
    gaps: Vec<TrackingGap>,
    checkpoint_count: usize,
}

/// Mutex-guarded in-memory implementation of all stores.
///
/// Loses everything with the process, so it provides no crash recovery;
/// useful for tests and hosts that persist totals themselves.
#[derive(Debug, Default)]
pub struct MemoryTripStore {
    state: Mutex<MemoryState>,
}

impl MemoryTripStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| TrackingError::persistence("memory store lock poisoned"))
    }

    pub fn session(&self, session_id: &str) -> Option<SessionRecord> {
        self.lock().ok()?.sessions.get(session_id).cloned()
    }

    /// Sizes of every `insert_batch` call for a session, in call order.
    pub fn batch_sizes(&self, session_id: &str) -> Vec<usize> {
        self.lock()
            .ok()
            .and_then(|s| s.batch_sizes.get(session_id).cloned())
            .unwrap_or_default()
    }

    /// Number of checkpoint writes received (all sessions).
    pub fn checkpoint_count(&self) -> usize {
        self.lock().map(|s| s.checkpoint_count).unwrap_or(0)
    }
}

impl SessionStore for MemoryTripStore {
    fn begin_session(
        &self,
        session_id: &str,
        route_enabled: bool,
        created_at_ms: i64,
    ) -> Result<()> {
        let mut state = self.lock()?;
        let record = state
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionRecord {
                session_id: session_id.to_string(),
                route_enabled,
                created_at_ms,
                tracking_started_at_ms: None,
                checkpoint: None,
                totals: None,
                active: true,
            });
        record.route_enabled = route_enabled;
        record.active = true;
        Ok(())
    }

    fn mark_tracking_started(&self, session_id: &str, at_ms: i64) -> Result<()> {
        let mut state = self.lock()?;
        let record = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| TrackingError::persistence(format!("unknown session {}", session_id)))?;
        record.tracking_started_at_ms.get_or_insert(at_ms);
        Ok(())
    }

    fn checkpoint(&self, session_id: &str, checkpoint: &SessionCheckpoint) -> Result<()> {
        let mut state = self.lock()?;
        state.checkpoint_count += 1;
        let record = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| TrackingError::persistence(format!("unknown session {}", session_id)))?;
        record.checkpoint = Some(*checkpoint);
        Ok(())
    }

    fn clear_active(&self, session_id: &str) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(record) = state.sessions.get_mut(session_id) {
            record.active = false;
        }
        Ok(())
    }

    fn complete(&self, session_id: &str, totals: &SessionTotals) -> Result<()> {
        let mut state = self.lock()?;
        let record = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| TrackingError::persistence(format!("unknown session {}", session_id)))?;
        record.totals = Some(*totals);
        record.active = false;
        Ok(())
    }

    fn load_checkpoint(&self, session_id: &str) -> Result<Option<SessionCheckpoint>> {
        Ok(self
            .lock()?
            .sessions
            .get(session_id)
            .and_then(|r| r.checkpoint))
    }

    fn active_session(&self) -> Result<Option<ActiveSession>> {
        let state = self.lock()?;
        Ok(state
            .sessions
            .values()
            .filter(|r| r.active)
            .max_by_key(|r| r.created_at_ms)
            .map(|r| ActiveSession {
                session_id: r.session_id.clone(),
                route_enabled: r.route_enabled,
                checkpoint: r.checkpoint,
            }))
    }
}

impl RoutePointStore for MemoryTripStore {
    fn insert_batch(
        &self,
        session_id: &str,
        first_sequence: u32,
        points: &[AcceptedPoint],
    ) -> Result<()> {
        let mut state = self.lock()?;
        let stored = state
            .route_points
            .entry(session_id.to_string())
            .or_default();
        // Re-sent points (retry after a partial failure) overwrite in place
        stored.truncate(first_sequence as usize);
        stored.extend_from_slice(points);
        state
            .batch_sizes
            .entry(session_id.to_string())
            .or_default()
            .push(points.len());
        Ok(())
    }

    fn route_points(&self, session_id: &str) -> Result<Vec<AcceptedPoint>> {
        Ok(self
            .lock()?
            .route_points
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }
}

impl GapStore for MemoryTripStore {
    fn start_gap(&self, session_id: &str, started_at_ms: i64, reason: GapReason) -> Result<i64> {
        let mut state = self.lock()?;
        let id = state.gaps.len() as i64 + 1;
        state.gaps.push(TrackingGap {
            id,
            session_id: session_id.to_string(),
            started_at_ms,
            ended_at_ms: None,
            reason,
        });
        Ok(id)
    }

    fn end_gap(&self, gap_id: i64, ended_at_ms: i64) -> Result<()> {
        let mut state = self.lock()?;
        let gap = state
            .gaps
            .iter_mut()
            .find(|g| g.id == gap_id)
            .ok_or_else(|| TrackingError::persistence(format!("unknown gap {}", gap_id)))?;
        gap.ended_at_ms = Some(ended_at_ms);
        Ok(())
    }

    fn gaps_for_session(&self, session_id: &str) -> Result<Vec<TrackingGap>> {
        Ok(self
            .lock()?
            .gaps
            .iter()
            .filter(|g| g.session_id == session_id)
            .cloned()
            .collect())
    }
}

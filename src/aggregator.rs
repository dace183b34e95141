//! # Session Aggregator
//!
//! Owns all state for the one active tracking session and turns each raw fix
//! into updated totals.
//!
//! ## Per-fix pipeline
//!
//! 1. Classify GPS signal and push it to the UI (every fix, accepted or not)
//! 2. Point filter; rejected fixes stop here and leave state untouched
//! 3. First accepted fix marks "tracking started" on the session record
//! 4. Gap-aware distance: only consecutive accepted points at most
//!    `gap_time_threshold_s` apart accrue distance; longer spans are recorded
//!    as tracking gaps
//! 5. Stop detection
//! 6. Push totals to the UI
//! 7. Route buffering, written in fixed-size batches
//! 8. Periodic checkpoint of totals for crash recovery
//!
//! Steps 3, 4 (gaps), 7 and 8 are queued to the background writer and never
//! block this path.
//!
//! ## Lifecycle
//!
//! An aggregator is created Active by [`SessionAggregator::start`] (or
//! [`SessionAggregator::resume`] after a process restart) and torn down by
//! [`SessionAggregator::teardown`], which consumes it.

use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, warn};

use crate::error::Result;
use crate::filter::{FilterDecision, PointFilter, RejectReason};
use crate::geo_utils::elapsed_seconds;
use crate::stop_detector::StopDetector;
use crate::store::{ActiveSession, GapReason, StatsSink, TripStores};
use crate::writer::{WriteCommand, WriteQueue};
use crate::{
    AcceptedPoint, GpsSignalLevel, RawFix, SessionCheckpoint, SessionTotals, TrackingConfig,
    TripStats,
};

/// What happened to a single raw fix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FixOutcome {
    Rejected(RejectReason),
    Accepted {
        point: AcceptedPoint,
        /// Meters added to the cumulative distance by this fix
        distance_added: f64,
        /// The span since the previous accepted point was a tracking gap
        gap: bool,
    },
}

impl FixOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, FixOutcome::Accepted { .. })
    }
}

pub struct SessionAggregator {
    session_id: String,
    route_enabled: bool,
    config: TrackingConfig,

    filter: PointFilter,
    stop_detector: StopDetector,

    sink: Arc<dyn StatsSink>,
    writer: WriteQueue,

    distance_meters: f64,
    last_accepted: Option<AcceptedPoint>,
    pending_route_points: Vec<AcceptedPoint>,
    route_point_count: u32,
    first_fix_recorded: bool,
    accepted_point_count: u32,
    tracking_started_at_ms: Option<i64>,
    gap_count: u32,

    /// Set after a resume: checkpoint time, closed by the next accepted fix
    restart_gap_started_at_ms: Option<i64>,
}

impl SessionAggregator {
    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Begin a fresh session.
    pub fn start(
        session_id: impl Into<String>,
        route_enabled: bool,
        config: TrackingConfig,
        stores: TripStores,
        sink: Arc<dyn StatsSink>,
    ) -> Result<Self> {
        let session = Self::build(session_id.into(), route_enabled, config, stores, sink)?;
        info!(
            "[TripTracker] Session {} started (route recording {})",
            session.session_id,
            if route_enabled { "on" } else { "off" }
        );
        Ok(session)
    }

    /// Continue a session that was active when the process died.
    ///
    /// Cumulative totals come back from the last checkpoint. The last
    /// accepted point is not recoverable: the first fix after a resume
    /// bootstraps the filter again, and the span since the checkpoint is
    /// recorded as a [`GapReason::ProcessRestart`] gap with no distance.
    /// Anything accrued after the last checkpoint is lost, except route
    /// batches already written: numbering continues after them so they are
    /// never overwritten.
    pub fn resume(
        active: ActiveSession,
        config: TrackingConfig,
        stores: TripStores,
        sink: Arc<dyn StatsSink>,
    ) -> Result<Self> {
        let stored_route_points = stores.route_points.next_sequence(&active.session_id)?;
        let mut session = Self::build(active.session_id, active.route_enabled, config, stores, sink)?;

        if let Some(checkpoint) = active.checkpoint {
            session.distance_meters = checkpoint.distance_meters;
            session.stop_detector =
                StopDetector::with_stopped_seconds(&session.config, checkpoint.stopped_seconds);
            session.route_point_count = checkpoint.route_point_count;
            session.tracking_started_at_ms = checkpoint.tracking_started_at_ms;
            session.first_fix_recorded = checkpoint.tracking_started_at_ms.is_some();
            session.restart_gap_started_at_ms = Some(checkpoint.checkpointed_at_ms);
        }
        session.route_point_count = session.route_point_count.max(stored_route_points);

        info!(
            "[TripTracker] Session {} resumed at {:.1}m, {:.0}s stopped, {} route points",
            session.session_id,
            session.distance_meters,
            session.stop_detector.stopped_seconds(),
            session.route_point_count
        );
        Ok(session)
    }

    fn build(
        session_id: String,
        route_enabled: bool,
        config: TrackingConfig,
        stores: TripStores,
        sink: Arc<dyn StatsSink>,
    ) -> Result<Self> {
        config.validate()?;
        let writer = WriteQueue::spawn(
            stores,
            sink.clone(),
            config.degraded_after_failures,
            config.max_backlog_route_points,
        )?;
        writer.submit(WriteCommand::BeginSession {
            session_id: session_id.clone(),
            route_enabled,
            created_at_ms: Utc::now().timestamp_millis(),
        });

        Ok(Self {
            filter: PointFilter::new(&config),
            stop_detector: StopDetector::new(&config),
            pending_route_points: Vec::with_capacity(config.batch_flush_size as usize),
            session_id,
            route_enabled,
            config,
            sink,
            writer,
            distance_meters: 0.0,
            last_accepted: None,
            route_point_count: 0,
            first_fix_recorded: false,
            accepted_point_count: 0,
            tracking_started_at_ms: None,
            gap_count: 0,
            restart_gap_started_at_ms: None,
        })
    }

    /// Flush remaining route points, wait for every queued write, and
    /// return the final totals.
    ///
    /// The caller still owes the authoritative `complete` write; see
    /// [`crate::complete_session`].
    pub fn teardown(mut self) -> SessionTotals {
        self.flush_route_points();
        self.writer.submit(WriteCommand::ClearActive {
            session_id: self.session_id.clone(),
        });

        let report = self.writer.close();
        if report.failed_writes > 0 || report.unsaved_route_points > 0 {
            warn!(
                "[TripTracker] Session {} closed with {} failed writes, {} route points unsaved, {} dropped",
                self.session_id,
                report.failed_writes,
                report.unsaved_route_points,
                report.dropped_route_points
            );
        }

        let totals = self.totals();
        info!(
            "[TripTracker] Session {} torn down: {:.1}m, {:.0}s stopped, {} route points, {} gaps",
            self.session_id,
            totals.distance_meters,
            totals.stopped_seconds,
            totals.route_point_count,
            self.gap_count
        );
        totals
    }

    // ========================================================================
    // Per-fix processing
    // ========================================================================

    /// Run one raw fix through the pipeline.
    pub fn process_location_update(&mut self, raw: &RawFix) -> FixOutcome {
        self.sink
            .set_gps_signal(GpsSignalLevel::classify(raw.accuracy_meters, &self.config));

        let point = match self.filter.evaluate(raw, self.last_accepted.as_ref()) {
            FilterDecision::Accepted(point) => point,
            FilterDecision::Rejected(reason) => return FixOutcome::Rejected(reason),
        };

        if !self.first_fix_recorded {
            self.first_fix_recorded = true;
            self.tracking_started_at_ms = Some(point.timestamp_ms());
            self.writer.submit(WriteCommand::MarkTrackingStarted {
                session_id: self.session_id.clone(),
                at_ms: point.timestamp_ms(),
            });
        }

        if let Some(started_at_ms) = self.restart_gap_started_at_ms.take() {
            self.record_gap(started_at_ms, point.timestamp_ms(), GapReason::ProcessRestart);
        }

        let (distance_added, gap) = self.accrue_distance(&point);

        let stopped_seconds = self.stop_detector.update(
            raw.speed_mps,
            raw.timestamp_ms,
            raw.latitude,
            raw.longitude,
        );

        let elapsed = self
            .tracking_started_at_ms
            .map(|start| elapsed_seconds(start, point.timestamp_ms()).max(0.0))
            .unwrap_or(0.0);
        self.sink.update_stats(&TripStats {
            distance_meters: self.distance_meters,
            stopped_seconds,
            elapsed_seconds: elapsed,
        });

        self.last_accepted = Some(point);
        self.accepted_point_count += 1;

        if self.route_enabled {
            self.pending_route_points.push(point);
            self.route_point_count += 1;
            if self.pending_route_points.len() >= self.config.batch_flush_size as usize {
                self.flush_route_points();
            }
        }

        if self.accepted_point_count % self.config.db_persist_interval == 0 {
            self.writer.submit(WriteCommand::Checkpoint {
                session_id: self.session_id.clone(),
                checkpoint: self.checkpoint(point.timestamp_ms()),
            });
        }

        FixOutcome::Accepted {
            point,
            distance_added,
            gap,
        }
    }

    /// Process a delivery batch in order.
    pub fn process_batch(&mut self, fixes: &[RawFix]) -> usize {
        fixes
            .iter()
            .filter(|raw| self.process_location_update(raw).is_accepted())
            .count()
    }

    fn accrue_distance(&mut self, point: &AcceptedPoint) -> (f64, bool) {
        let Some(prev) = self.last_accepted else {
            return (0.0, false);
        };

        let dt = elapsed_seconds(prev.timestamp_ms(), point.timestamp_ms());
        if dt <= 0.0 {
            debug!(
                "[TripTracker] Non-increasing timestamp ({}ms -> {}ms), no distance added",
                prev.timestamp_ms(),
                point.timestamp_ms()
            );
            return (0.0, false);
        }

        if dt > self.config.gap_time_threshold_s {
            debug!(
                "[TripTracker] {:.0}s since last accepted point, recording gap",
                dt
            );
            self.record_gap(prev.timestamp_ms(), point.timestamp_ms(), GapReason::SignalLoss);
            return (0.0, true);
        }

        let distance = prev.distance_to(point);
        self.distance_meters += distance;
        (distance, false)
    }

    fn record_gap(&mut self, started_at_ms: i64, ended_at_ms: i64, reason: GapReason) {
        self.gap_count += 1;
        self.writer.submit(WriteCommand::RecordGap {
            session_id: self.session_id.clone(),
            started_at_ms,
            ended_at_ms,
            reason,
        });
    }

    fn flush_route_points(&mut self) {
        if self.pending_route_points.is_empty() {
            return;
        }
        let points = std::mem::replace(
            &mut self.pending_route_points,
            Vec::with_capacity(self.config.batch_flush_size as usize),
        );
        let first_sequence = self.route_point_count - points.len() as u32;
        self.writer.submit(WriteCommand::InsertRoutePoints {
            session_id: self.session_id.clone(),
            first_sequence,
            points,
        });
    }

    fn checkpoint(&self, at_ms: i64) -> SessionCheckpoint {
        SessionCheckpoint {
            distance_meters: self.distance_meters,
            stopped_seconds: self.stop_detector.stopped_seconds(),
            route_point_count: self.route_point_count,
            tracking_started_at_ms: self.tracking_started_at_ms,
            checkpointed_at_ms: at_ms,
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn route_enabled(&self) -> bool {
        self.route_enabled
    }

    pub fn config(&self) -> &TrackingConfig {
        &self.config
    }

    pub fn distance_meters(&self) -> f64 {
        self.distance_meters
    }

    pub fn stopped_seconds(&self) -> f64 {
        self.stop_detector.stopped_seconds()
    }

    pub fn route_point_count(&self) -> u32 {
        self.route_point_count
    }

    pub fn accepted_point_count(&self) -> u32 {
        self.accepted_point_count
    }

    pub fn gap_count(&self) -> u32 {
        self.gap_count
    }

    pub fn last_accepted(&self) -> Option<&AcceptedPoint> {
        self.last_accepted.as_ref()
    }

    /// Route points accepted but not yet handed to the writer.
    pub fn pending_route_points(&self) -> &[AcceptedPoint] {
        &self.pending_route_points
    }

    pub fn is_stationary(&self) -> bool {
        self.stop_detector.is_stationary()
    }

    /// Repeated checkpoint/route write failures; totals may not survive a crash.
    pub fn is_degraded(&self) -> bool {
        self.writer.is_degraded()
    }

    pub fn totals(&self) -> SessionTotals {
        SessionTotals {
            distance_meters: self.distance_meters,
            stopped_seconds: self.stop_detector.stopped_seconds(),
            route_point_count: self.route_point_count,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

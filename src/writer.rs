//! # Background Writer
//!
//! Durable writes issued while tracking never run on the delivery thread.
//! The aggregator sends [`WriteCommand`]s over a channel to a single writer
//! thread, which applies them in order and reports each [`WriteOutcome`] to a
//! [`WriteSupervisor`] living on the same thread.
//!
//! ## Failure handling
//!
//! - Every failure is logged and swallowed; the next checkpoint self-heals.
//! - Repeated checkpoint or route-batch failures flip the session into a
//!   degraded state that is pushed to the UI sink, and cleared again on the
//!   next success.
//! - Route points from failed batches are kept in a bounded backlog and
//!   re-sent (in order) ahead of the next batch. When the backlog exceeds its
//!   cap, the oldest points are dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, info, warn};

use crate::error::{Result, TrackingError};
use crate::store::{GapReason, StatsSink, TripStores};
use crate::{AcceptedPoint, SessionCheckpoint};

// ============================================================================
// Types
// ============================================================================

/// A durable write requested by the aggregator.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteCommand {
    BeginSession {
        session_id: String,
        route_enabled: bool,
        created_at_ms: i64,
    },
    MarkTrackingStarted {
        session_id: String,
        at_ms: i64,
    },
    Checkpoint {
        session_id: String,
        checkpoint: SessionCheckpoint,
    },
    InsertRoutePoints {
        session_id: String,
        first_sequence: u32,
        points: Vec<AcceptedPoint>,
    },
    RecordGap {
        session_id: String,
        started_at_ms: i64,
        ended_at_ms: i64,
        reason: GapReason,
    },
    ClearActive {
        session_id: String,
    },
}

impl WriteCommand {
    pub fn kind(&self) -> WriteKind {
        match self {
            WriteCommand::BeginSession { .. }
            | WriteCommand::MarkTrackingStarted { .. }
            | WriteCommand::ClearActive { .. } => WriteKind::SessionRecord,
            WriteCommand::Checkpoint { .. } => WriteKind::Checkpoint,
            WriteCommand::InsertRoutePoints { .. } => WriteKind::RoutePoints,
            WriteCommand::RecordGap { .. } => WriteKind::Gap,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteKind {
    SessionRecord,
    Checkpoint,
    RoutePoints,
    Gap,
}

impl WriteKind {
    /// Failures of these kinds put crash recovery at risk.
    fn escalates(&self) -> bool {
        matches!(self, WriteKind::Checkpoint | WriteKind::RoutePoints)
    }
}

/// Result of applying one command.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome {
    pub kind: WriteKind,
    pub result: Result<()>,
}

/// Summary returned when the writer shuts down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterReport {
    pub writes: u32,
    pub failed_writes: u32,
    /// Route points evicted from the retry backlog
    pub dropped_route_points: u32,
    /// Route points still unsaved after the final retry
    pub unsaved_route_points: u32,
}

// ============================================================================
// Supervisor
// ============================================================================

/// Watches write outcomes and escalates repeated failures.
pub struct WriteSupervisor {
    threshold: u32,
    consecutive_failures: HashMap<WriteKind, u32>,
    degraded: Arc<AtomicBool>,
    sink: Arc<dyn StatsSink>,
}

impl WriteSupervisor {
    pub fn new(threshold: u32, degraded: Arc<AtomicBool>, sink: Arc<dyn StatsSink>) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive_failures: HashMap::new(),
            degraded,
            sink,
        }
    }

    pub fn observe(&mut self, outcome: &WriteOutcome) {
        match &outcome.result {
            Ok(()) => {
                self.consecutive_failures.remove(&outcome.kind);
                let still_failing = self
                    .consecutive_failures
                    .iter()
                    .any(|(kind, count)| kind.escalates() && *count >= self.threshold);
                if outcome.kind.escalates() && !still_failing && self.is_degraded() {
                    info!("[TripWriter] {:?} write recovered, tracking healthy", outcome.kind);
                    self.degraded.store(false, Ordering::SeqCst);
                    self.sink.set_tracking_degraded(false);
                }
            }
            Err(e) => {
                let count = self.consecutive_failures.entry(outcome.kind).or_insert(0);
                *count += 1;
                let count = *count;
                warn!(
                    "[TripWriter] {:?} write failed ({} in a row): {}",
                    outcome.kind, count, e
                );
                if outcome.kind.escalates() && count >= self.threshold && !self.is_degraded() {
                    warn!(
                        "[TripWriter] {} consecutive {:?} failures, tracking degraded",
                        count, outcome.kind
                    );
                    self.degraded.store(true, Ordering::SeqCst);
                    self.sink.set_tracking_degraded(true);
                }
            }
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Route-point backlog
// ============================================================================

/// Route points whose batch write failed, awaiting retry.
struct RouteBacklog {
    cap: usize,
    first_sequence: u32,
    points: VecDeque<AcceptedPoint>,
    dropped: u32,
}

impl RouteBacklog {
    fn new(cap: u32) -> Self {
        Self {
            cap: cap as usize,
            first_sequence: 0,
            points: VecDeque::new(),
            dropped: 0,
        }
    }

    /// Prepend any backlog to a fresh batch.
    fn merge(
        &mut self,
        first_sequence: u32,
        points: Vec<AcceptedPoint>,
    ) -> (u32, Vec<AcceptedPoint>) {
        if self.points.is_empty() {
            return (first_sequence, points);
        }
        let start = self.first_sequence;
        let mut merged: Vec<AcceptedPoint> = self.points.drain(..).collect();
        merged.extend(points);
        (start, merged)
    }

    /// Keep a failed batch for the next attempt, evicting the oldest over the cap.
    fn retain(&mut self, first_sequence: u32, points: Vec<AcceptedPoint>) {
        self.first_sequence = first_sequence;
        self.points = points.into();
        let mut evicted = 0u32;
        while self.points.len() > self.cap {
            self.points.pop_front();
            self.first_sequence += 1;
            evicted += 1;
        }
        if evicted > 0 {
            self.dropped += evicted;
            warn!(
                "[TripWriter] Route backlog over {} points, dropped {} oldest",
                self.cap, evicted
            );
        }
    }

    fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

// ============================================================================
// Writer thread
// ============================================================================

struct Writer {
    stores: TripStores,
    supervisor: WriteSupervisor,
    backlog: RouteBacklog,
    report: WriterReport,
    last_session_id: Option<String>,
}

impl Writer {
    fn run(mut self, receiver: mpsc::Receiver<WriteCommand>) -> WriterReport {
        for command in receiver {
            let kind = command.kind();
            let result = self.apply(command);
            self.record(WriteOutcome { kind, result });
        }

        // Channel closed: one last chance for anything still backlogged
        if !self.backlog.is_empty() {
            if let Some(session_id) = self.last_session_id.take() {
                let result = self.insert_route_points(&session_id, 0, Vec::new());
                self.record(WriteOutcome {
                    kind: WriteKind::RoutePoints,
                    result,
                });
            }
        }

        self.report.dropped_route_points = self.backlog.dropped;
        self.report.unsaved_route_points = self.backlog.points.len() as u32;
        self.report
    }

    fn record(&mut self, outcome: WriteOutcome) {
        self.report.writes += 1;
        if outcome.result.is_err() {
            self.report.failed_writes += 1;
        }
        self.supervisor.observe(&outcome);
    }

    fn apply(&mut self, command: WriteCommand) -> Result<()> {
        match command {
            WriteCommand::BeginSession {
                session_id,
                route_enabled,
                created_at_ms,
            } => self
                .stores
                .sessions
                .begin_session(&session_id, route_enabled, created_at_ms),
            WriteCommand::MarkTrackingStarted { session_id, at_ms } => {
                self.stores.sessions.mark_tracking_started(&session_id, at_ms)
            }
            WriteCommand::Checkpoint {
                session_id,
                checkpoint,
            } => {
                debug!(
                    "[TripWriter] Checkpoint {}: {:.1}m, {:.0}s stopped, {} points",
                    session_id,
                    checkpoint.distance_meters,
                    checkpoint.stopped_seconds,
                    checkpoint.route_point_count
                );
                self.stores.sessions.checkpoint(&session_id, &checkpoint)
            }
            WriteCommand::InsertRoutePoints {
                session_id,
                first_sequence,
                points,
            } => {
                self.last_session_id = Some(session_id.clone());
                self.insert_route_points(&session_id, first_sequence, points)
            }
            WriteCommand::RecordGap {
                session_id,
                started_at_ms,
                ended_at_ms,
                reason,
            } => {
                let gap_id = self
                    .stores
                    .gaps
                    .start_gap(&session_id, started_at_ms, reason)?;
                self.stores.gaps.end_gap(gap_id, ended_at_ms)
            }
            WriteCommand::ClearActive { session_id } => {
                self.stores.sessions.clear_active(&session_id)
            }
        }
    }

    fn insert_route_points(
        &mut self,
        session_id: &str,
        first_sequence: u32,
        points: Vec<AcceptedPoint>,
    ) -> Result<()> {
        let (start, batch) = self.backlog.merge(first_sequence, points);
        if batch.is_empty() {
            return Ok(());
        }
        match self.stores.route_points.insert_batch(session_id, start, &batch) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.backlog.retain(start, batch);
                Err(e)
            }
        }
    }
}

/// Sending half of the writer, owned by the aggregator.
pub(crate) struct WriteQueue {
    sender: Option<mpsc::Sender<WriteCommand>>,
    handle: Option<JoinHandle<WriterReport>>,
    degraded: Arc<AtomicBool>,
}

impl WriteQueue {
    /// Spawn the writer thread.
    pub(crate) fn spawn(
        stores: TripStores,
        sink: Arc<dyn StatsSink>,
        degraded_after_failures: u32,
        max_backlog_route_points: u32,
    ) -> Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let degraded = Arc::new(AtomicBool::new(false));

        let writer = Writer {
            stores,
            supervisor: WriteSupervisor::new(degraded_after_failures, degraded.clone(), sink),
            backlog: RouteBacklog::new(max_backlog_route_points),
            report: WriterReport::default(),
            last_session_id: None,
        };

        let handle = thread::Builder::new()
            .name("trip-writer".to_string())
            .spawn(move || writer.run(receiver))
            .map_err(|e| TrackingError::Internal {
                message: format!("failed to spawn writer thread: {}", e),
            })?;

        Ok(Self {
            sender: Some(sender),
            handle: Some(handle),
            degraded,
        })
    }

    /// Queue a write; never blocks.
    pub(crate) fn submit(&self, command: WriteCommand) {
        let Some(sender) = self.sender.as_ref() else {
            warn!("[TripWriter] Write queue closed, dropping {:?}", command.kind());
            return;
        };
        if let Err(mpsc::SendError(command)) = sender.send(command) {
            warn!("[TripWriter] Writer thread gone, dropping {:?}", command.kind());
        }
    }

    pub(crate) fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Close the channel and wait until every queued write has been applied.
    pub(crate) fn close(&mut self) -> WriterReport {
        self.sender.take();
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                warn!("[TripWriter] Writer thread panicked");
                WriterReport::default()
            }),
            None => WriterReport::default(),
        }
    }
}

impl Drop for WriteQueue {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.close();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{
        ActiveSession, GapStore, MemoryTripStore, NullStatsSink, RoutePointStore, SessionStore,
        TrackingGap,
    };
    use crate::{GpsSignalLevel, RawFix, SessionTotals, TripStats};
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    fn point(i: u32) -> AcceptedPoint {
        let raw = RawFix::new(40.0 + i as f64 * 1e-4, -74.0, Some(8.0), None, i as i64 * 3000);
        AcceptedPoint::from_fix(&raw, 8.0)
    }

    /// Store whose writes fail while `failing` is set, and whose next
    /// `failed_inserts` route batches fail regardless.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryTripStore,
        failing: AtomicBool,
        failed_inserts: AtomicU32,
    }

    impl FlakyStore {
        fn check(&self) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                Err(TrackingError::persistence("disk I/O error"))
            } else {
                Ok(())
            }
        }

        fn check_insert(&self) -> Result<()> {
            let remaining = self.failed_inserts.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failed_inserts.store(remaining - 1, Ordering::SeqCst);
                return Err(TrackingError::persistence("database is locked"));
            }
            self.check()
        }
    }

    impl SessionStore for FlakyStore {
        fn begin_session(&self, id: &str, route: bool, at: i64) -> Result<()> {
            self.inner.begin_session(id, route, at)
        }
        fn mark_tracking_started(&self, id: &str, at: i64) -> Result<()> {
            self.inner.mark_tracking_started(id, at)
        }
        fn checkpoint(&self, id: &str, cp: &SessionCheckpoint) -> Result<()> {
            self.check()?;
            self.inner.checkpoint(id, cp)
        }
        fn clear_active(&self, id: &str) -> Result<()> {
            self.inner.clear_active(id)
        }
        fn complete(&self, id: &str, totals: &SessionTotals) -> Result<()> {
            self.inner.complete(id, totals)
        }
        fn load_checkpoint(&self, id: &str) -> Result<Option<SessionCheckpoint>> {
            self.inner.load_checkpoint(id)
        }
        fn active_session(&self) -> Result<Option<ActiveSession>> {
            self.inner.active_session()
        }
    }

    impl RoutePointStore for FlakyStore {
        fn insert_batch(&self, id: &str, first: u32, points: &[AcceptedPoint]) -> Result<()> {
            self.check_insert()?;
            self.inner.insert_batch(id, first, points)
        }
        fn route_points(&self, id: &str) -> Result<Vec<AcceptedPoint>> {
            self.inner.route_points(id)
        }
    }

    impl GapStore for FlakyStore {
        fn start_gap(&self, id: &str, at: i64, reason: GapReason) -> Result<i64> {
            self.inner.start_gap(id, at, reason)
        }
        fn end_gap(&self, gap_id: i64, at: i64) -> Result<()> {
            self.inner.end_gap(gap_id, at)
        }
        fn gaps_for_session(&self, id: &str) -> Result<Vec<TrackingGap>> {
            self.inner.gaps_for_session(id)
        }
    }

    #[derive(Default)]
    struct DegradedLog {
        flips: Mutex<Vec<bool>>,
    }

    impl StatsSink for DegradedLog {
        fn set_gps_signal(&self, _level: GpsSignalLevel) {}
        fn update_stats(&self, _stats: &TripStats) {}
        fn set_tracking_degraded(&self, degraded: bool) {
            self.flips.lock().unwrap().push(degraded);
        }
    }

    fn checkpoint(i: i64) -> WriteCommand {
        WriteCommand::Checkpoint {
            session_id: "s1".to_string(),
            checkpoint: SessionCheckpoint {
                distance_meters: i as f64,
                stopped_seconds: 0.0,
                route_point_count: 0,
                tracking_started_at_ms: Some(0),
                checkpointed_at_ms: i,
            },
        }
    }

    fn begin() -> WriteCommand {
        WriteCommand::BeginSession {
            session_id: "s1".to_string(),
            route_enabled: true,
            created_at_ms: 0,
        }
    }

    #[test]
    fn test_commands_applied_in_order_before_close_returns() {
        let store = Arc::new(MemoryTripStore::new());
        let mut queue = WriteQueue::spawn(
            TripStores::from_shared(store.clone()),
            Arc::new(NullStatsSink),
            3,
            100,
        )
        .unwrap();

        queue.submit(begin());
        for first in [0u32, 10] {
            queue.submit(WriteCommand::InsertRoutePoints {
                session_id: "s1".to_string(),
                first_sequence: first,
                points: (first..first + 10).map(point).collect(),
            });
        }
        queue.submit(checkpoint(7));
        queue.submit(WriteCommand::RecordGap {
            session_id: "s1".to_string(),
            started_at_ms: 1_000,
            ended_at_ms: 45_000,
            reason: GapReason::SignalLoss,
        });

        let report = queue.close();
        assert_eq!(report.writes, 5);
        assert_eq!(report.failed_writes, 0);

        let stored = store.route_points("s1").unwrap();
        assert_eq!(stored, (0..20).map(point).collect::<Vec<_>>());
        assert_eq!(
            store.load_checkpoint("s1").unwrap().unwrap().distance_meters,
            7.0
        );
        let gaps = store.gaps_for_session("s1").unwrap();
        assert_eq!(gaps[0].ended_at_ms, Some(45_000));
    }

    #[test]
    fn test_repeated_failures_escalate_then_recover() {
        let store = Arc::new(FlakyStore::default());
        let sink = Arc::new(DegradedLog::default());
        let mut queue =
            WriteQueue::spawn(TripStores::from_shared(store.clone()), sink.clone(), 3, 100)
                .unwrap();

        queue.submit(begin());
        store.failing.store(true, Ordering::SeqCst);
        for i in 0..4 {
            queue.submit(checkpoint(i));
        }
        let report = queue.close();
        assert_eq!(report.failed_writes, 4);
        assert_eq!(*sink.flips.lock().unwrap(), vec![true]);

        let mut supervisor =
            WriteSupervisor::new(3, Arc::new(AtomicBool::new(true)), sink.clone());
        supervisor.observe(&WriteOutcome {
            kind: WriteKind::Checkpoint,
            result: Ok(()),
        });
        assert!(!supervisor.is_degraded());
        assert_eq!(*sink.flips.lock().unwrap(), vec![true, false]);
    }

    #[test]
    fn test_gap_failures_do_not_escalate() {
        let sink = Arc::new(DegradedLog::default());
        let mut supervisor =
            WriteSupervisor::new(2, Arc::new(AtomicBool::new(false)), sink.clone());
        for _ in 0..5 {
            supervisor.observe(&WriteOutcome {
                kind: WriteKind::Gap,
                result: Err(TrackingError::persistence("nope")),
            });
        }
        assert!(!supervisor.is_degraded());
        assert!(sink.flips.lock().unwrap().is_empty());
    }

    #[test]
    fn test_failed_batch_retried_ahead_of_next() {
        let store = Arc::new(FlakyStore::default());
        store.failed_inserts.store(1, Ordering::SeqCst);
        let mut queue = WriteQueue::spawn(
            TripStores::from_shared(store.clone()),
            Arc::new(NullStatsSink),
            3,
            100,
        )
        .unwrap();

        queue.submit(begin());
        for first in [0u32, 10] {
            queue.submit(WriteCommand::InsertRoutePoints {
                session_id: "s1".to_string(),
                first_sequence: first,
                points: (first..first + 10).map(point).collect(),
            });
        }
        let report = queue.close();

        assert_eq!(report.failed_writes, 1);
        assert_eq!(report.unsaved_route_points, 0);
        assert_eq!(store.inner.batch_sizes("s1"), vec![20]);
        assert_eq!(
            store.route_points("s1").unwrap(),
            (0..20).map(point).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_unsaved_points_reported_on_close() {
        let store = Arc::new(FlakyStore::default());
        let mut queue = WriteQueue::spawn(
            TripStores::from_shared(store.clone()),
            Arc::new(NullStatsSink),
            3,
            100,
        )
        .unwrap();

        queue.submit(begin());
        store.failing.store(true, Ordering::SeqCst);
        queue.submit(WriteCommand::InsertRoutePoints {
            session_id: "s1".to_string(),
            first_sequence: 0,
            points: (0..10).map(point).collect(),
        });
        let report = queue.close();
        // The batch itself plus the final retry on close
        assert_eq!(report.failed_writes, 2);
        assert_eq!(report.unsaved_route_points, 10);
        assert!(store.route_points("s1").unwrap().is_empty());
    }

    #[test]
    fn test_backlog_cap_drops_oldest() {
        let mut backlog = RouteBacklog::new(15);
        backlog.retain(0, (0..10).map(point).collect());
        let (start, merged) = backlog.merge(10, (10..20).map(point).collect());
        assert_eq!(start, 0);
        assert_eq!(merged.len(), 20);

        backlog.retain(start, merged);
        assert_eq!(backlog.points.len(), 15);
        assert_eq!(backlog.first_sequence, 5);
        assert_eq!(backlog.dropped, 5);
        assert_eq!(backlog.points.front(), Some(&point(5)));
    }
}

//! # SQLite Trip Store
//!
//! Durable storage for the tracking pipeline, implementing all three store
//! traits on one SQLite database.
//!
//! ## Tables
//!
//! 1. **sessions** - one row per session: creation and first-fix times, the
//!    latest checkpointed totals, final totals once completed, and the
//!    `active` marker used to resume after a process restart
//! 2. **route_points** - accepted points keyed by (session, sequence),
//!    written in batches inside a transaction
//! 3. **tracking_gaps** - spans with no distance accrued
//!
//! The connection sits behind a mutex: in practice the background writer is
//! the only caller while a session runs, and the host calls `complete` after
//! teardown.

use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use log::info;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Result, TrackingError};
use crate::store::{
    ActiveSession, GapReason, GapStore, RoutePointStore, SessionRecord, SessionStore, TrackingGap,
};
use crate::{AcceptedPoint, SessionCheckpoint, SessionTotals};

/// SQLite-backed session, route-point and gap store.
pub struct SqliteTripStore {
    db: Mutex<Connection>,
    db_path: String,
}

impl SqliteTripStore {
    // ========================================================================
    // Initialization
    // ========================================================================

    /// Open (or create) the database at the given path.
    pub fn new(db_path: &str) -> Result<Self> {
        let db = Connection::open(db_path)?;
        Self::init_schema(&db)?;
        info!("[TripStore] Opened {}", db_path);

        Ok(Self {
            db: Mutex::new(db),
            db_path: db_path.to_string(),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::new(":memory:")
    }

    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    /// Initialize the database schema.
    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            -- Enable foreign keys
            PRAGMA foreign_keys = ON;

            -- One row per driving session
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                route_enabled INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                tracking_started_at INTEGER,
                distance_meters REAL NOT NULL DEFAULT 0,
                stopped_seconds REAL NOT NULL DEFAULT 0,
                route_points_count INTEGER NOT NULL DEFAULT 0,
                checkpointed_at INTEGER,
                completed_at INTEGER,
                active INTEGER NOT NULL DEFAULT 1,
                updated_at INTEGER DEFAULT (strftime('%s', 'now'))
            );

            -- Recorded route, written in batches
            CREATE TABLE IF NOT EXISTS route_points (
                session_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                accuracy_meters REAL NOT NULL,
                speed_mps REAL,
                timestamp_ms INTEGER NOT NULL,
                PRIMARY KEY (session_id, seq),
                FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
            );

            -- Spans where no distance was accrued
            CREATE TABLE IF NOT EXISTS tracking_gaps (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                ended_at INTEGER,
                reason TEXT NOT NULL,
                FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
            );

            -- Indexes
            CREATE INDEX IF NOT EXISTS idx_sessions_active ON sessions(active, created_at);
            CREATE INDEX IF NOT EXISTS idx_gaps_session ON tracking_gaps(session_id);
        "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| TrackingError::persistence("database lock poisoned"))
    }

    // ========================================================================
    // Queries for the surrounding app
    // ========================================================================

    /// Full session row, if the session exists.
    pub fn session_record(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let db = self.lock()?;
        let record = db
            .query_row(
                "SELECT id, route_enabled, created_at, tracking_started_at,
                        distance_meters, stopped_seconds, route_points_count,
                        checkpointed_at, completed_at, active
                 FROM sessions WHERE id = ?",
                params![session_id],
                |row| {
                    let tracking_started_at_ms: Option<i64> = row.get(3)?;
                    let distance_meters: f64 = row.get(4)?;
                    let stopped_seconds: f64 = row.get(5)?;
                    let route_point_count: u32 = row.get(6)?;
                    let checkpointed_at: Option<i64> = row.get(7)?;
                    let completed_at: Option<i64> = row.get(8)?;

                    let checkpoint = checkpointed_at.map(|at| SessionCheckpoint {
                        distance_meters,
                        stopped_seconds,
                        route_point_count,
                        tracking_started_at_ms,
                        checkpointed_at_ms: at,
                    });
                    let totals = completed_at.map(|_| SessionTotals {
                        distance_meters,
                        stopped_seconds,
                        route_point_count,
                    });

                    Ok(SessionRecord {
                        session_id: row.get(0)?,
                        route_enabled: row.get(1)?,
                        created_at_ms: row.get(2)?,
                        tracking_started_at_ms,
                        checkpoint,
                        totals,
                        active: row.get(9)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Number of tracking gaps recorded for a session.
    pub fn gap_count(&self, session_id: &str) -> Result<u32> {
        let db = self.lock()?;
        let count: u32 = db.query_row(
            "SELECT COUNT(*) FROM tracking_gaps WHERE session_id = ?",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Remove completed sessions older than the specified retention period.
    ///
    /// Cascade deletes remove their route points and gaps. Sessions still
    /// marked active are never touched.
    ///
    /// # Arguments
    /// * `retention_days` - Number of days to retain (0 = keep all)
    ///
    /// # Returns
    /// Number of sessions deleted
    pub fn cleanup_completed_sessions(&self, retention_days: u32) -> Result<u32> {
        if retention_days == 0 {
            return Ok(0);
        }
        let cutoff_ms =
            Utc::now().timestamp_millis() - i64::from(retention_days) * 24 * 60 * 60 * 1000;

        let db = self.lock()?;
        let deleted = db.execute(
            "DELETE FROM sessions WHERE completed_at IS NOT NULL AND active = 0 AND completed_at < ?",
            params![cutoff_ms],
        )?;
        if deleted > 0 {
            info!(
                "[TripStore] Cleanup removed {} sessions older than {} days",
                deleted, retention_days
            );
        }
        Ok(deleted as u32)
    }
}

fn unknown_session(session_id: &str) -> TrackingError {
    TrackingError::persistence(format!("unknown session '{}'", session_id))
}

impl SessionStore for SqliteTripStore {
    fn begin_session(
        &self,
        session_id: &str,
        route_enabled: bool,
        created_at_ms: i64,
    ) -> Result<()> {
        let db = self.lock()?;
        db.execute(
            "INSERT INTO sessions (id, route_enabled, created_at, active)
             VALUES (?1, ?2, ?3, 1)
             ON CONFLICT(id) DO UPDATE SET active = 1, route_enabled = excluded.route_enabled",
            params![session_id, route_enabled, created_at_ms],
        )?;
        Ok(())
    }

    fn mark_tracking_started(&self, session_id: &str, at_ms: i64) -> Result<()> {
        let db = self.lock()?;
        let updated = db.execute(
            "UPDATE sessions SET tracking_started_at = COALESCE(tracking_started_at, ?1)
             WHERE id = ?2",
            params![at_ms, session_id],
        )?;
        if updated == 0 {
            return Err(unknown_session(session_id));
        }
        Ok(())
    }

    fn checkpoint(&self, session_id: &str, checkpoint: &SessionCheckpoint) -> Result<()> {
        let db = self.lock()?;
        let updated = db.execute(
            "UPDATE sessions
             SET distance_meters = ?1, stopped_seconds = ?2, route_points_count = ?3,
                 tracking_started_at = COALESCE(tracking_started_at, ?4),
                 checkpointed_at = ?5, updated_at = strftime('%s', 'now')
             WHERE id = ?6",
            params![
                checkpoint.distance_meters,
                checkpoint.stopped_seconds,
                checkpoint.route_point_count,
                checkpoint.tracking_started_at_ms,
                checkpoint.checkpointed_at_ms,
                session_id
            ],
        )?;
        if updated == 0 {
            return Err(unknown_session(session_id));
        }
        Ok(())
    }

    fn clear_active(&self, session_id: &str) -> Result<()> {
        let db = self.lock()?;
        db.execute(
            "UPDATE sessions SET active = 0 WHERE id = ?",
            params![session_id],
        )?;
        Ok(())
    }

    fn complete(&self, session_id: &str, totals: &SessionTotals) -> Result<()> {
        let db = self.lock()?;
        let updated = db.execute(
            "UPDATE sessions
             SET distance_meters = ?1, stopped_seconds = ?2, route_points_count = ?3,
                 completed_at = ?4, active = 0, updated_at = strftime('%s', 'now')
             WHERE id = ?5",
            params![
                totals.distance_meters,
                totals.stopped_seconds,
                totals.route_point_count,
                Utc::now().timestamp_millis(),
                session_id
            ],
        )?;
        if updated == 0 {
            return Err(unknown_session(session_id));
        }
        info!(
            "[TripStore] Completed {}: {:.1}m, {:.0}s stopped",
            session_id, totals.distance_meters, totals.stopped_seconds
        );
        Ok(())
    }

    fn load_checkpoint(&self, session_id: &str) -> Result<Option<SessionCheckpoint>> {
        Ok(self
            .session_record(session_id)?
            .and_then(|record| record.checkpoint))
    }

    fn active_session(&self) -> Result<Option<ActiveSession>> {
        let session_id: Option<String> = {
            let db = self.lock()?;
            db.query_row(
                "SELECT id FROM sessions
                 WHERE active = 1 AND completed_at IS NULL
                 ORDER BY created_at DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?
        };

        let Some(session_id) = session_id else {
            return Ok(None);
        };
        Ok(self.session_record(&session_id)?.map(|record| ActiveSession {
            session_id: record.session_id,
            route_enabled: record.route_enabled,
            checkpoint: record.checkpoint,
        }))
    }
}

impl RoutePointStore for SqliteTripStore {
    fn insert_batch(
        &self,
        session_id: &str,
        first_sequence: u32,
        points: &[AcceptedPoint],
    ) -> Result<()> {
        let mut db = self.lock()?;
        let tx = db.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO route_points
                    (session_id, seq, latitude, longitude, accuracy_meters, speed_mps, timestamp_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for (offset, point) in points.iter().enumerate() {
                stmt.execute(params![
                    session_id,
                    first_sequence + offset as u32,
                    point.latitude(),
                    point.longitude(),
                    point.accuracy_meters(),
                    point.speed_mps(),
                    point.timestamp_ms()
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn route_points(&self, session_id: &str) -> Result<Vec<AcceptedPoint>> {
        let db = self.lock()?;
        let mut stmt = db.prepare(
            "SELECT latitude, longitude, accuracy_meters, speed_mps, timestamp_ms
             FROM route_points WHERE session_id = ? ORDER BY seq",
        )?;
        let points = stmt
            .query_map(params![session_id], |row| {
                Ok(AcceptedPoint::restore(
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(points)
    }

    fn next_sequence(&self, session_id: &str) -> Result<u32> {
        let db = self.lock()?;
        let next: u32 = db.query_row(
            "SELECT COALESCE(MAX(seq) + 1, 0) FROM route_points WHERE session_id = ?",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(next)
    }
}

impl GapStore for SqliteTripStore {
    fn start_gap(&self, session_id: &str, started_at_ms: i64, reason: GapReason) -> Result<i64> {
        let db = self.lock()?;
        db.execute(
            "INSERT INTO tracking_gaps (session_id, started_at, reason) VALUES (?1, ?2, ?3)",
            params![session_id, started_at_ms, reason.as_str()],
        )?;
        Ok(db.last_insert_rowid())
    }

    fn end_gap(&self, gap_id: i64, ended_at_ms: i64) -> Result<()> {
        let db = self.lock()?;
        let updated = db.execute(
            "UPDATE tracking_gaps SET ended_at = ?1 WHERE id = ?2",
            params![ended_at_ms, gap_id],
        )?;
        if updated == 0 {
            return Err(TrackingError::persistence(format!("unknown gap {}", gap_id)));
        }
        Ok(())
    }

    fn gaps_for_session(&self, session_id: &str) -> Result<Vec<TrackingGap>> {
        let db = self.lock()?;
        let mut stmt = db.prepare(
            "SELECT id, session_id, started_at, ended_at, reason
             FROM tracking_gaps WHERE session_id = ? ORDER BY started_at, id",
        )?;
        let rows = stmt
            .query_map(params![session_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(id, session_id, started_at_ms, ended_at_ms, reason)| {
                Ok(TrackingGap {
                    id,
                    session_id,
                    started_at_ms,
                    ended_at_ms,
                    reason: reason.parse()?,
                })
            })
            .collect()
    }
}

// ============================================================================
// Tests
// ============================================================================

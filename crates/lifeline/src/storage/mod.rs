//! Storage layer for lifeline.
//!
//! A single `SQLite` database holds every emergency event, its per-channel
//! delivery state, an append-only audit log, and a small namespaced key-value
//! table. Every mutation is committed before the call returns, so a process
//! that dies mid-dispatch restarts from exactly what was acknowledged.

pub mod migrations;
pub mod schema;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::event::{
    ChannelKind, ChannelResult, ChannelState, DiagnosticSnapshot, EmergencyEvent, EventId,
    EventSource, EventStatus, Location,
};

/// Storage shared between the queue, the safety switch, and the coordinator.
pub type SharedStorage = Arc<Mutex<Storage>>;

/// Wrap a storage instance for sharing.
#[must_use]
pub fn shared(storage: Storage) -> SharedStorage {
    Arc::new(Mutex::new(storage))
}

/// Lock shared storage, turning a poisoned lock into an error.
///
/// # Errors
///
/// Returns [`Error::Internal`] if a previous holder panicked.
pub fn lock(storage: &SharedStorage) -> Result<MutexGuard<'_, Storage>> {
    storage
        .lock()
        .map_err(|_| Error::internal("storage lock poisoned"))
}

const EVENT_COLUMNS: &str = "id, source, status, created_at, location_lat, location_lng, \
                             snapshot, snapshot_hash, merged_signals";

const TERMINAL_STATUSES: &str = "('delivered', 'cancelled', 'abandoned')";

/// Severity of an audit log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Normal lifecycle step.
    Info,
    /// Something failed but will be retried or is tolerated.
    Warn,
    /// Something failed for good.
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// One line of an event's audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    /// Row id, increasing in insertion order.
    pub id: i64,
    /// Event the entry belongs to.
    pub event_id: EventId,
    /// When it was written.
    pub timestamp: DateTime<Utc>,
    /// Short machine-readable action (`enqueued`, `attempt`, ...).
    pub action: String,
    /// Severity.
    pub level: String,
    /// Human-readable detail.
    pub message: String,
}

/// An event together with its audit trail, as exported for follow-up.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    /// The event.
    pub event: EmergencyEvent,
    /// Its log, oldest first.
    pub log: Vec<LogEntry>,
}

/// Statistics about the storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    /// Total number of events stored.
    pub total_events: i64,
    /// Number of events per status, in lifecycle order.
    pub by_status: Vec<(EventStatus, i64)>,
    /// Creation time of the oldest event.
    pub oldest_event: Option<DateTime<Utc>>,
    /// Creation time of the newest event.
    pub newest_event: Option<DateTime<Utc>>,
    /// Size of the database file in bytes.
    pub db_size_bytes: u64,
}

impl StorageStats {
    /// Number of events currently in `status`.
    #[must_use]
    pub fn count_for(&self, status: EventStatus) -> i64 {
        self.by_status
            .iter()
            .find(|(s, _)| *s == status)
            .map_or(0, |(_, n)| *n)
    }
}

/// Raw columns of an `events` row before validation.
struct EventRow {
    id: String,
    source: String,
    status: String,
    created_at: String,
    lat: Option<f64>,
    lng: Option<f64>,
    snapshot: String,
    snapshot_hash: String,
    merged_signals: i64,
}

/// Storage engine for emergency events.
#[derive(Debug)]
pub struct Storage {
    path: PathBuf,
    conn: Connection,
}

impl Storage {
    /// Open or create a storage database at the given path.
    ///
    /// Creates the parent directories and database file if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or schema initialization fails.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| Error::DirectoryCreate {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        debug!("Opening database at {}", path.display());
        let conn = Connection::open(&path).map_err(|source| Error::DatabaseOpen {
            path: path.clone(),
            source,
        })?;

        // FULL: an acknowledged enqueue must survive power loss, not just a crash.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")?;

        migrations::initialize_schema(&conn)?;

        info!("Database opened at {}", path.display());
        Ok(Self { path, conn })
    }

    /// Create an in-memory storage instance for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|source| Error::DatabaseOpen {
            path: PathBuf::from(":memory:"),
            source,
        })?;

        migrations::initialize_schema(&conn)?;

        Ok(Self {
            path: PathBuf::from(":memory:"),
            conn,
        })
    }

    /// Get the path to the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Refuse (or allow again) all writes on this connection.
    ///
    /// Inspection commands set this so they can never disturb a live queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the pragma cannot be applied.
    pub fn set_query_only(&self, on: bool) -> Result<()> {
        self.conn
            .pragma_update(None, "query_only", if on { "ON" } else { "OFF" })?;
        Ok(())
    }

    // === Events ===

    /// Insert `event` unless a row with its id already exists.
    ///
    /// The event row and its channel rows are written in one transaction.
    /// Returns `true` if the event was inserted.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn insert_event_if_absent(&self, event: &EmergencyEvent) -> Result<bool> {
        let tx = self.conn.unchecked_transaction()?;
        let now = encode_time(&Utc::now());
        let snapshot = serde_json::to_string(event.snapshot())?;

        let inserted = tx.execute(
            r"
            INSERT OR IGNORE INTO events
                (id, source, status, created_at, updated_at, location_lat, location_lng,
                 snapshot, snapshot_hash, merged_signals)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ",
            params![
                event.id.as_str(),
                event.source.to_string(),
                event.status.to_string(),
                encode_time(&event.created_at),
                now,
                event.location.map(|l| l.lat),
                event.location.map(|l| l.lng),
                snapshot,
                event.snapshot_digest(),
                i64::from(event.merged_signals),
            ],
        )?;

        if inserted == 0 {
            debug!(event_id = %event.id, "Event already stored, insert skipped");
            return Ok(false);
        }

        for (kind, state) in &event.channels {
            write_channel_state(&tx, &event.id, *kind, state)?;
        }

        tx.commit()?;
        debug!(event_id = %event.id, "Inserted event");
        Ok(true)
    }

    /// Get an event by its id, with its channel states.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails or the row is corrupt.
    pub fn get_event(&self, id: &EventId) -> Result<Option<EmergencyEvent>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1"),
                [id.as_str()],
                Self::read_event_row,
            )
            .optional()?;

        row.map(|row| self.hydrate(row)).transpose()
    }

    /// Ids of events whose id starts with `prefix`, at most `limit` of them.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn find_ids_by_prefix(&self, prefix: &str, limit: usize) -> Result<Vec<EventId>> {
        let escaped = prefix
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        let pattern = format!("{escaped}%");
        let limit_i64 = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(
            "SELECT id FROM events WHERE id LIKE ?1 ESCAPE '\\' ORDER BY created_at DESC LIMIT ?2",
        )?;
        let ids = stmt
            .query_map(params![pattern, limit_i64], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids.into_iter().map(EventId::from).collect())
    }

    /// Events in `status`, oldest first.
    ///
    /// Rows that cannot be decoded are logged and skipped so one damaged
    /// record never hides the others.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn events_by_status(&self, status: EventStatus) -> Result<Vec<EmergencyEvent>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE status = ?1 ORDER BY created_at ASC"
        ))?;
        let rows = stmt.query_map([status.to_string()], Self::read_event_row)?;
        self.hydrate_all(rows)
    }

    /// Get the most recent events, newest first. Undecodable rows are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn recent(&self, limit: usize) -> Result<Vec<EmergencyEvent>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events ORDER BY created_at DESC LIMIT ?1"
        ))?;
        let limit_i64 = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map([limit_i64], Self::read_event_row)?;
        self.hydrate_all(rows)
    }

    /// Count total events in storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn count(&self) -> Result<i64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Overwrite the status of an event.
    ///
    /// Returns `false` if no such event exists. Transition rules are enforced
    /// by the caller.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn set_status(&self, id: &EventId, status: EventStatus) -> Result<bool> {
        let affected = self.conn.execute(
            "UPDATE events SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id.as_str(), status.to_string(), encode_time(&Utc::now())],
        )?;
        Ok(affected > 0)
    }

    /// Attach coordinates to an event.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn set_location(&self, id: &EventId, location: Location) -> Result<bool> {
        let affected = self.conn.execute(
            r"
            UPDATE events SET location_lat = ?2, location_lng = ?3, updated_at = ?4
            WHERE id = ?1
            ",
            params![
                id.as_str(),
                location.lat,
                location.lng,
                encode_time(&Utc::now())
            ],
        )?;
        Ok(affected > 0)
    }

    /// Record how many later signals were folded into an event.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn set_merged_signals(&self, id: &EventId, merged: u32) -> Result<bool> {
        let affected = self.conn.execute(
            "UPDATE events SET merged_signals = ?2, updated_at = ?3 WHERE id = ?1",
            params![id.as_str(), i64::from(merged), encode_time(&Utc::now())],
        )?;
        Ok(affected > 0)
    }

    /// Persist the state of one channel after an attempt.
    ///
    /// A channel already recorded as `sent` is never overwritten; in that case
    /// nothing changes and `false` is returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn record_attempt(
        &self,
        id: &EventId,
        kind: ChannelKind,
        state: &ChannelState,
    ) -> Result<bool> {
        let tx = self.conn.unchecked_transaction()?;
        let changed = write_channel_state(&tx, id, kind, state)?;
        if changed {
            tx.execute(
                "UPDATE events SET updated_at = ?2 WHERE id = ?1",
                params![id.as_str(), encode_time(&Utc::now())],
            )?;
        }
        tx.commit()?;
        Ok(changed)
    }

    // === Audit log ===

    /// Append a line to an event's audit trail.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn append_log(
        &self,
        id: &EventId,
        level: LogLevel,
        action: &str,
        message: &str,
    ) -> Result<()> {
        self.conn.execute(
            r"
            INSERT INTO event_log (event_id, timestamp, action, level, message)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ",
            params![
                id.as_str(),
                encode_time(&Utc::now()),
                action,
                level.to_string(),
                message
            ],
        )?;
        Ok(())
    }

    /// The audit trail of an event, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn log_for(&self, id: &EventId) -> Result<Vec<LogEntry>> {
        let mut stmt = self.conn.prepare(
            r"
            SELECT id, event_id, timestamp, action, level, message
            FROM event_log WHERE event_id = ?1 ORDER BY id ASC
            ",
        )?;
        let rows = stmt
            .query_map([id.as_str()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, event_id, timestamp, action, level, message)| {
                Ok(LogEntry {
                    id,
                    event_id: EventId::from(event_id),
                    timestamp: decode_time(&timestamp)?,
                    action,
                    level,
                    message,
                })
            })
            .collect()
    }

    /// Every event with its audit trail, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn export(&self, limit: usize) -> Result<Vec<EventRecord>> {
        self.recent(limit)?
            .into_iter()
            .map(|event| {
                let log = self.log_for(&event.id)?;
                Ok(EventRecord { event, log })
            })
            .collect()
    }

    // === Maintenance ===

    /// Get database statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn stats(&self) -> Result<StorageStats> {
        let total_events = self.count()?;

        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM events GROUP BY status")?;
        let grouped = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let by_status = EventStatus::ALL
            .into_iter()
            .map(|status| {
                let label = status.to_string();
                let n = grouped
                    .iter()
                    .find(|(s, _)| *s == label)
                    .map_or(0, |(_, n)| *n);
                (status, n)
            })
            .collect();

        let oldest: Option<String> = self
            .conn
            .query_row(
                "SELECT created_at FROM events ORDER BY created_at ASC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let newest: Option<String> = self
            .conn
            .query_row(
                "SELECT created_at FROM events ORDER BY created_at DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        let db_size_bytes = if self.path.to_string_lossy() == ":memory:" {
            0
        } else {
            std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
        };

        Ok(StorageStats {
            total_events,
            by_status,
            oldest_event: oldest.as_deref().map(decode_time).transpose()?,
            newest_event: newest.as_deref().map(decode_time).transpose()?,
            db_size_bytes,
        })
    }

    /// Delete finished events last touched more than `max_age` ago.
    ///
    /// Events still confirming or dispatching are never pruned. Returns the
    /// number of events deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn prune_older_than(&self, max_age: Duration) -> Result<usize> {
        let cutoff = encode_time(&(Utc::now() - max_age));
        let doomed = format!(
            "SELECT id FROM events WHERE status IN {TERMINAL_STATUSES} AND updated_at < ?1"
        );

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            &format!("DELETE FROM channel_states WHERE event_id IN ({doomed})"),
            [&cutoff],
        )?;
        tx.execute(
            &format!("DELETE FROM event_log WHERE event_id IN ({doomed})"),
            [&cutoff],
        )?;
        let affected = tx.execute(
            &format!("DELETE FROM events WHERE id IN ({doomed})"),
            [&cutoff],
        )?;
        tx.commit()?;

        if affected > 0 {
            info!("Pruned {} finished events", affected);
        }
        Ok(affected)
    }

    // === Key-value ===

    /// Read a namespaced value.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn kv_get(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    /// Write a namespaced value, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn kv_put(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            [key, value],
        )?;
        Ok(())
    }

    /// Remove a namespaced value. Returns `true` if it existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn kv_delete(&self, key: &str) -> Result<bool> {
        let affected = self.conn.execute("DELETE FROM kv WHERE key = ?1", [key])?;
        Ok(affected > 0)
    }

    // === Row mapping ===

    fn read_event_row(row: &rusqlite::Row) -> rusqlite::Result<EventRow> {
        Ok(EventRow {
            id: row.get(0)?,
            source: row.get(1)?,
            status: row.get(2)?,
            created_at: row.get(3)?,
            lat: row.get(4)?,
            lng: row.get(5)?,
            snapshot: row.get(6)?,
            snapshot_hash: row.get(7)?,
            merged_signals: row.get(8)?,
        })
    }

    fn hydrate_all(
        &self,
        rows: impl Iterator<Item = rusqlite::Result<EventRow>>,
    ) -> Result<Vec<EmergencyEvent>> {
        let mut events = Vec::new();
        for row in rows {
            let row = match row {
                Ok(row) => row,
                Err(err) => {
                    warn!(error = %err, "Skipping unreadable event row");
                    continue;
                }
            };
            let id = row.id.clone();
            match self.hydrate(row) {
                Ok(event) => events.push(event),
                Err(err) => warn!(event_id = %id, error = %err, "Skipping corrupt event"),
            }
        }
        Ok(events)
    }

    fn hydrate(&self, row: EventRow) -> Result<EmergencyEvent> {
        let corrupt = |what: &str| Error::internal(format!("corrupt {what} in event {}", row.id));

        let source: EventSource = row.source.parse().map_err(|_| corrupt("source"))?;
        let status: EventStatus = row.status.parse().map_err(|_| corrupt("status"))?;
        let created_at = decode_time(&row.created_at)?;
        // The recorded digest is kept, so a replaced snapshot reads as tampered.
        let snapshot = serde_json::from_str::<DiagnosticSnapshot>(&row.snapshot).unwrap_or_else(|err| {
            warn!(event_id = %row.id, error = %err, "Unreadable diagnostic snapshot, using an empty one");
            DiagnosticSnapshot::default()
        });
        let location = match (row.lat, row.lng) {
            (Some(lat), Some(lng)) => Some(Location { lat, lng }),
            _ => None,
        };
        let merged = u32::try_from(row.merged_signals).unwrap_or(u32::MAX);

        let id = EventId::from(row.id);
        let mut event = EmergencyEvent::from_parts(
            id.clone(),
            source,
            created_at,
            location,
            snapshot,
            row.snapshot_hash,
            status,
            merged,
        );
        if !event.snapshot_intact() {
            warn!(event_id = %id, "Diagnostic snapshot does not match its digest");
        }

        for (kind, state) in self.channel_states(&id)? {
            event.channels.insert(kind, state);
        }
        Ok(event)
    }

    fn channel_states(&self, id: &EventId) -> Result<Vec<(ChannelKind, ChannelState)>> {
        let mut stmt = self.conn.prepare(
            r"
            SELECT channel, result, reason, attempts, next_attempt_at, last_attempt_at
            FROM channel_states WHERE event_id = ?1
            ",
        )?;
        let rows = stmt
            .query_map([id.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut states = Vec::with_capacity(rows.len());
        for (channel, result, reason, attempts, next_at, last_at) in rows {
            let Ok(kind) = channel.parse::<ChannelKind>() else {
                warn!(event_id = %id, channel = %channel, "Ignoring unknown channel");
                continue;
            };
            states.push((
                kind,
                ChannelState {
                    result: ChannelResult::from_parts(&result, reason),
                    attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
                    next_attempt_at: next_at.as_deref().map(decode_time).transpose()?,
                    last_attempt_at: last_at.as_deref().map(decode_time).transpose()?,
                },
            ));
        }
        Ok(states)
    }
}

/// Upsert one channel row, leaving `sent` rows untouched.
fn write_channel_state(
    conn: &Connection,
    id: &EventId,
    kind: ChannelKind,
    state: &ChannelState,
) -> Result<bool> {
    let reason = match &state.result {
        ChannelResult::Failed(reason) => Some(reason.as_str()),
        _ => None,
    };
    let affected = conn.execute(
        r"
        INSERT INTO channel_states
            (event_id, channel, result, reason, attempts, next_attempt_at, last_attempt_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(event_id, channel) DO UPDATE SET
            result = excluded.result,
            reason = excluded.reason,
            attempts = excluded.attempts,
            next_attempt_at = excluded.next_attempt_at,
            last_attempt_at = excluded.last_attempt_at
        WHERE channel_states.result != 'sent'
        ",
        params![
            id.as_str(),
            kind.to_string(),
            state.result.label(),
            reason,
            i64::from(state.attempts),
            state.next_attempt_at.as_ref().map(encode_time),
            state.last_attempt_at.as_ref().map(encode_time),
        ],
    )?;
    Ok(affected > 0)
}

/// Fixed-width RFC 3339 so that text ordering matches time ordering.
pub(crate) fn encode_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn decode_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::internal(format!("invalid stored timestamp {value}: {e}")))
}

//! `SQLite` schema definitions for lifeline.

/// Emergency events, one row per incident.
pub const CREATE_EVENTS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    source TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    location_lat REAL,
    location_lng REAL,
    snapshot TEXT NOT NULL,
    snapshot_hash TEXT NOT NULL,
    merged_signals INTEGER NOT NULL DEFAULT 0
)
";

/// Per-channel delivery state of each event.
pub const CREATE_CHANNEL_STATES_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS channel_states (
    event_id TEXT NOT NULL,
    channel TEXT NOT NULL,
    result TEXT NOT NULL DEFAULT 'not_attempted',
    reason TEXT,
    attempts INTEGER NOT NULL DEFAULT 0,
    next_attempt_at TEXT,
    last_attempt_at TEXT,
    PRIMARY KEY (event_id, channel)
)
";

/// Append-only audit trail of what happened to each event.
pub const CREATE_EVENT_LOG_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS event_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    action TEXT NOT NULL,
    level TEXT NOT NULL,
    message TEXT NOT NULL
)
";

/// Namespaced key-value records (schema version, armed safety switch).
pub const CREATE_KV_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
";

/// Index used by the queue to find events still being dispatched.
pub const CREATE_STATUS_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_events_status ON events(status, created_at)
";

/// Index for listing recent events.
pub const CREATE_CREATED_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_events_created ON events(created_at DESC)
";

/// Index for reading an event's log in order.
pub const CREATE_LOG_EVENT_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_event_log_event ON event_log(event_id, id)
";

/// All schema creation statements in order.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    CREATE_EVENTS_TABLE,
    CREATE_CHANNEL_STATES_TABLE,
    CREATE_EVENT_LOG_TABLE,
    CREATE_KV_TABLE,
    CREATE_STATUS_INDEX,
    CREATE_CREATED_INDEX,
    CREATE_LOG_EVENT_INDEX,
];

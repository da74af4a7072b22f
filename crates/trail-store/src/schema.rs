/// SQL DDL for the trail-store database.
/// WAL mode + foreign keys enabled at connection time. Timestamps are
/// integer milliseconds since the Unix epoch.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    name TEXT,
    started_at INTEGER NOT NULL,
    ended_at INTEGER,
    is_active INTEGER NOT NULL DEFAULT 1,
    is_saved INTEGER NOT NULL DEFAULT 0,
    expires_at INTEGER,
    tab_count INTEGER NOT NULL DEFAULT 0,
    window_count INTEGER NOT NULL DEFAULT 0,
    visit_count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS windows (
    id TEXT PRIMARY KEY,
    volatile_id INTEGER NOT NULL,
    fingerprint TEXT,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    created_at INTEGER NOT NULL,
    last_active_at INTEGER NOT NULL,
    active_duration_ms INTEGER NOT NULL DEFAULT 0,
    closed_at INTEGER,
    tags TEXT NOT NULL DEFAULT '[]',
    notes TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    kind TEXT NOT NULL DEFAULT 'normal',
    focused INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS tabs (
    id TEXT PRIMARY KEY,
    volatile_id INTEGER NOT NULL,
    fingerprint TEXT,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    created_at INTEGER NOT NULL,
    last_active_at INTEGER NOT NULL,
    active_duration_ms INTEGER NOT NULL DEFAULT 0,
    closed_at INTEGER,
    tags TEXT NOT NULL DEFAULT '[]',
    notes TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    window_id TEXT,
    opener_id TEXT,
    url TEXT NOT NULL DEFAULT '',
    title TEXT NOT NULL DEFAULT '',
    idx INTEGER NOT NULL DEFAULT 0,
    pinned INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS visits (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    url TEXT NOT NULL,
    start_at INTEGER NOT NULL,
    end_at INTEGER,
    duration_ms INTEGER
);

CREATE TABLE IF NOT EXISTS focus_events (
    id TEXT PRIMARY KEY,
    owner_kind TEXT NOT NULL,
    owner_id TEXT NOT NULL,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    start_at INTEGER NOT NULL,
    end_at INTEGER,
    duration_ms INTEGER
);

CREATE TABLE IF NOT EXISTS relationships (
    source_id TEXT NOT NULL,
    target_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    strength REAL NOT NULL,
    created_at INTEGER NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    PRIMARY KEY (source_id, target_id, kind)
);

CREATE TABLE IF NOT EXISTS tags (
    name TEXT PRIMARY KEY,
    use_count INTEGER NOT NULL DEFAULT 0,
    last_used_at INTEGER NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_tabs_live_volatile ON tabs(volatile_id) WHERE closed_at IS NULL;
CREATE UNIQUE INDEX IF NOT EXISTS idx_windows_live_volatile ON windows(volatile_id) WHERE closed_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_tabs_fingerprint ON tabs(fingerprint, closed_at);
CREATE INDEX IF NOT EXISTS idx_windows_fingerprint ON windows(fingerprint, closed_at);
CREATE INDEX IF NOT EXISTS idx_tabs_session ON tabs(session_id);
CREATE INDEX IF NOT EXISTS idx_tabs_window ON tabs(window_id);
CREATE INDEX IF NOT EXISTS idx_tabs_created ON tabs(created_at);
CREATE INDEX IF NOT EXISTS idx_windows_session ON windows(session_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_visits_open ON visits(owner_id) WHERE end_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_visits_owner ON visits(owner_id, start_at);
CREATE UNIQUE INDEX IF NOT EXISTS idx_focus_open ON focus_events(owner_id) WHERE end_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_focus_owner ON focus_events(owner_id, start_at);
CREATE INDEX IF NOT EXISTS idx_relationships_target ON relationships(target_id, kind);
CREATE INDEX IF NOT EXISTS idx_relationships_kind ON relationships(kind, strength);
CREATE INDEX IF NOT EXISTS idx_sessions_active ON sessions(is_active, started_at);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;

use rusqlite::Connection;

use crate::error::LedgerError;

pub const SCHEMA_VERSION: i32 = 1;

pub fn init_schema(conn: &Connection) -> Result<(), LedgerError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
    ",
    )?;
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);
INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, unixepoch());

CREATE TABLE IF NOT EXISTS pools (
    pool_key TEXT PRIMARY KEY,
    status TEXT NOT NULL CHECK (status IN ('open', 'sealed')),
    declared_count INTEGER NOT NULL DEFAULT 0 CHECK (declared_count >= 0)
);

CREATE TABLE IF NOT EXISTS parcels (
    tracking_code TEXT PRIMARY KEY CHECK (length(tracking_code) > 0),
    description TEXT NOT NULL,
    weight_grams INTEGER CHECK (weight_grams IS NULL OR weight_grams >= 0),
    order_ref TEXT,
    attributes BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS custody (
    record_id INTEGER PRIMARY KEY AUTOINCREMENT,
    tracking_code TEXT NOT NULL UNIQUE REFERENCES parcels (tracking_code),
    pool_key TEXT NOT NULL REFERENCES pools (pool_key),
    assigned_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_custody_pool ON custody (pool_key, record_id);
";

//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS user_sessions (
            id TEXT PRIMARY KEY,
            mac_address TEXT NOT NULL,
            ip_address TEXT,
            device_type TEXT,
            user_agent TEXT,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'active', 'expired', 'terminated')),
            created_at TEXT NOT NULL,
            session_start TEXT,
            session_end TEXT,
            data_used_mb REAL NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_sessions_mac_status ON user_sessions(mac_address, status);
        CREATE INDEX IF NOT EXISTS idx_sessions_status_start ON user_sessions(status, session_start);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_one_active
            ON user_sessions(mac_address) WHERE status = 'active';

        CREATE TABLE IF NOT EXISTS ad_impressions (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            ad_id TEXT NOT NULL,
            ad_duration_seconds INTEGER NOT NULL CHECK (ad_duration_seconds > 0),
            mac_address TEXT NOT NULL,
            impression_time TEXT NOT NULL,
            watched_duration_seconds INTEGER NOT NULL DEFAULT 0,
            completed INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (session_id) REFERENCES user_sessions(id)
        );

        CREATE INDEX IF NOT EXISTS idx_impressions_session ON ad_impressions(session_id);
        CREATE INDEX IF NOT EXISTS idx_impressions_mac_time ON ad_impressions(mac_address, impression_time);

        CREATE TABLE IF NOT EXISTS radcheck (
            id INTEGER PRIMARY KEY,
            username TEXT NOT NULL,
            attribute TEXT NOT NULL,
            op TEXT NOT NULL DEFAULT ':=',
            value TEXT NOT NULL,
            UNIQUE (username, attribute)
        );

        CREATE TABLE IF NOT EXISTS radreply (
            id INTEGER PRIMARY KEY,
            username TEXT NOT NULL,
            attribute TEXT NOT NULL,
            op TEXT NOT NULL DEFAULT ':=',
            value TEXT NOT NULL,
            UNIQUE (username, attribute)
        );",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (1)",
        [],
    )?;

    Ok(())
}

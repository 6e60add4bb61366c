//! Versioned schema migrations, `apply_schema_v1` / `migrate_vN_to_vN+1`
//! style. Only one schema version exists today; the naming is kept so a
//! future column or table addition has an obvious home.

use rusqlite::Connection;

use super::StoreError;

const CURRENT_SCHEMA_VERSION: i64 = 1;

pub fn run(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS metadata (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );",
    )?;

    let version = schema_version(conn)?;
    if version == 0 {
        apply_schema_v1(conn)?;
        set_schema_version(conn, CURRENT_SCHEMA_VERSION)?;
    } else if version != CURRENT_SCHEMA_VERSION {
        return Err(StoreError::Storage(format!(
            "database schema version {version} is incompatible with the version this binary supports ({CURRENT_SCHEMA_VERSION})"
        )));
    }

    Ok(())
}

fn schema_version(conn: &Connection) -> Result<i64, StoreError> {
    let v: Option<String> = conn
        .query_row(
            "SELECT value FROM metadata WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .ok();
    Ok(v.and_then(|s| s.parse().ok()).unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i64) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO metadata (key, value) VALUES ('schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        rusqlite::params![version.to_string()],
    )?;
    Ok(())
}

fn apply_schema_v1(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE sessions (
            session_id  INTEGER PRIMARY KEY AUTOINCREMENT,
            channel_id  INTEGER NOT NULL,
            alias       TEXT,
            started_at  INTEGER NOT NULL,
            ended_at    INTEGER,
            status      TEXT NOT NULL CHECK (status IN ('active', 'ended'))
        );

        CREATE UNIQUE INDEX idx_sessions_one_active_per_channel
            ON sessions(channel_id) WHERE status = 'active';

        CREATE INDEX idx_sessions_channel ON sessions(channel_id);

        CREATE TABLE exceptions (
            session_id          INTEGER NOT NULL REFERENCES sessions(session_id),
            allowed_channel_id  INTEGER NOT NULL,
            alias               TEXT,
            created_at          INTEGER NOT NULL,
            PRIMARY KEY (session_id, allowed_channel_id)
        );

        CREATE TABLE attempts (
            attempt_id           INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id           INTEGER NOT NULL REFERENCES sessions(session_id),
            observed_at          INTEGER NOT NULL,
            incoming_channel_id  INTEGER NOT NULL,
            outgoing_channel_id  INTEGER NOT NULL,
            amount_msat          INTEGER NOT NULL,
            incoming_htlc_index  INTEGER NOT NULL,
            outgoing_htlc_index  INTEGER NOT NULL,
            decision             TEXT NOT NULL CHECK (decision IN ('resume', 'fail')),
            reason               TEXT NOT NULL
        );

        CREATE INDEX idx_attempts_session ON attempts(session_id, observed_at);",
    )?;
    Ok(())
}

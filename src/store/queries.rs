//! Row-level SQL for each Store operation, kept apart from connection and
//! pool management in `mod.rs`.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::model::{Attempt, ChannelId, Decision, Exception, Reason, Session, SessionStatus, Statistics};

use super::StoreError;

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

pub fn create_session(
    conn: &Connection,
    channel_id: ChannelId,
    alias: Option<String>,
) -> Result<i64, StoreError> {
    if active_session_for_channel(conn, channel_id)?.is_some() {
        return Err(StoreError::AlreadyActive(channel_id.to_string()));
    }

    conn.execute(
        "INSERT INTO sessions (channel_id, alias, started_at, ended_at, status)
         VALUES (?1, ?2, ?3, NULL, 'active')",
        params![channel_id.0 as i64, alias, now_ms()],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn end_session(conn: &Connection, channel_id: ChannelId) -> Result<i64, StoreError> {
    let session_id = active_session_for_channel(conn, channel_id)?
        .ok_or_else(|| StoreError::NotActive(channel_id.to_string()))?;

    conn.execute(
        "UPDATE sessions SET status = 'ended', ended_at = ?1 WHERE session_id = ?2",
        params![now_ms(), session_id],
    )?;
    Ok(session_id)
}

pub fn active_session_for_channel(
    conn: &Connection,
    channel_id: ChannelId,
) -> Result<Option<i64>, StoreError> {
    conn.query_row(
        "SELECT session_id FROM sessions WHERE channel_id = ?1 AND status = 'active'",
        params![channel_id.0 as i64],
        |row| row.get(0),
    )
    .optional()
    .map_err(StoreError::from)
}

fn session_status(conn: &Connection, session_id: i64) -> Result<Option<SessionStatus>, StoreError> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM sessions WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(status.and_then(|s| s.parse().ok()))
}

pub fn add_exception(
    conn: &Connection,
    session_id: i64,
    allowed_channel_id: ChannelId,
    alias: Option<String>,
) -> Result<(), StoreError> {
    match session_status(conn, session_id)? {
        Some(SessionStatus::Active) => {}
        _ => return Err(StoreError::SessionNotActive(session_id.to_string())),
    }

    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM exceptions WHERE session_id = ?1 AND allowed_channel_id = ?2",
            params![session_id, allowed_channel_id.0 as i64],
            |row| row.get(0),
        )
        .optional()?;
    if exists.is_some() {
        return Err(StoreError::duplicate_exception(session_id, allowed_channel_id));
    }

    conn.execute(
        "INSERT INTO exceptions (session_id, allowed_channel_id, alias, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![session_id, allowed_channel_id.0 as i64, alias, now_ms()],
    )?;
    Ok(())
}

pub fn remove_exception(
    conn: &Connection,
    session_id: i64,
    allowed_channel_id: ChannelId,
) -> Result<(), StoreError> {
    let changed = conn.execute(
        "DELETE FROM exceptions WHERE session_id = ?1 AND allowed_channel_id = ?2",
        params![session_id, allowed_channel_id.0 as i64],
    )?;
    if changed == 0 {
        return Err(StoreError::exception_not_found(session_id, allowed_channel_id));
    }
    Ok(())
}

fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<Session> {
    let channel_id: i64 = row.get("channel_id")?;
    let started_at: i64 = row.get("started_at")?;
    let ended_at: Option<i64> = row.get("ended_at")?;
    let status: String = row.get("status")?;
    Ok(Session {
        session_id: row.get("session_id")?,
        channel_id: ChannelId(channel_id as u64),
        alias: row.get("alias")?,
        started_at: to_datetime(started_at),
        ended_at: ended_at.map(to_datetime),
        status: status.parse().unwrap_or(SessionStatus::Ended),
    })
}

pub fn list_active_sessions(conn: &Connection) -> Result<Vec<Session>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT session_id, channel_id, alias, started_at, ended_at, status
         FROM sessions WHERE status = 'active' ORDER BY started_at",
    )?;
    let rows = stmt.query_map([], row_to_session)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn session_history(
    conn: &Connection,
    channel_id: Option<ChannelId>,
) -> Result<Vec<Session>, StoreError> {
    let mut stmt;
    let rows: Vec<Session> = match channel_id {
        Some(cid) => {
            stmt = conn.prepare(
                "SELECT session_id, channel_id, alias, started_at, ended_at, status
                 FROM sessions WHERE channel_id = ?1 ORDER BY started_at DESC",
            )?;
            stmt.query_map(params![cid.0 as i64], row_to_session)?
                .collect::<Result<Vec<_>, _>>()?
        }
        None => {
            stmt = conn.prepare(
                "SELECT session_id, channel_id, alias, started_at, ended_at, status
                 FROM sessions ORDER BY started_at DESC",
            )?;
            stmt.query_map([], row_to_session)?
                .collect::<Result<Vec<_>, _>>()?
        }
    };
    Ok(rows)
}

pub fn list_exceptions(conn: &Connection, session_id: i64) -> Result<Vec<Exception>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT session_id, allowed_channel_id, alias, created_at
         FROM exceptions WHERE session_id = ?1 ORDER BY created_at",
    )?;
    let rows = stmt.query_map(params![session_id], |row| {
        let allowed: i64 = row.get("allowed_channel_id")?;
        let created_at: i64 = row.get("created_at")?;
        Ok(Exception {
            session_id: row.get("session_id")?,
            allowed_channel_id: ChannelId(allowed as u64),
            alias: row.get("alias")?,
            created_at: to_datetime(created_at),
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// A prepared attempt row, built by the Intercept Engine at decision time.
#[derive(Debug, Clone)]
pub struct NewAttempt {
    pub session_id: i64,
    pub incoming_channel_id: ChannelId,
    pub outgoing_channel_id: ChannelId,
    pub amount_msat: u64,
    pub incoming_htlc_index: u64,
    pub outgoing_htlc_index: u64,
    pub decision: Decision,
    pub reason: Reason,
}

pub fn insert_attempt(conn: &Connection, attempt: &NewAttempt) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO attempts (
            session_id, observed_at, incoming_channel_id, outgoing_channel_id,
            amount_msat, incoming_htlc_index, outgoing_htlc_index, decision, reason
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            attempt.session_id,
            now_ms(),
            attempt.incoming_channel_id.0 as i64,
            attempt.outgoing_channel_id.0 as i64,
            attempt.amount_msat as i64,
            attempt.incoming_htlc_index as i64,
            attempt.outgoing_htlc_index as i64,
            attempt.decision.as_str(),
            attempt.reason.as_str(),
        ],
    )?;
    Ok(())
}

pub fn attempts_for_session(
    conn: &Connection,
    session_id: i64,
    limit: Option<u32>,
) -> Result<Vec<Attempt>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT attempt_id, session_id, observed_at, incoming_channel_id, outgoing_channel_id,
                amount_msat, incoming_htlc_index, outgoing_htlc_index, decision, reason
         FROM attempts WHERE session_id = ?1 ORDER BY observed_at DESC LIMIT ?2",
    )?;
    let rows = stmt.query_map(
        params![session_id, limit.unwrap_or(u32::MAX)],
        |row| {
            let observed_at: i64 = row.get("observed_at")?;
            let incoming: i64 = row.get("incoming_channel_id")?;
            let outgoing: i64 = row.get("outgoing_channel_id")?;
            let decision: String = row.get("decision")?;
            let reason: String = row.get("reason")?;
            Ok(Attempt {
                attempt_id: row.get("attempt_id")?,
                session_id: row.get("session_id")?,
                observed_at: to_datetime(observed_at),
                incoming_channel_id: ChannelId(incoming as u64),
                outgoing_channel_id: ChannelId(outgoing as u64),
                amount_msat: row.get::<_, i64>("amount_msat")? as u64,
                incoming_htlc_index: row.get::<_, i64>("incoming_htlc_index")? as u64,
                outgoing_htlc_index: row.get::<_, i64>("outgoing_htlc_index")? as u64,
                decision: if decision == "resume" { Decision::Resume } else { Decision::Fail },
                reason: match reason.as_str() {
                    "exception-match" => Reason::ExceptionMatch,
                    "no-exception" => Reason::NoException,
                    _ => Reason::NotIsolated,
                },
            })
        },
    )?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn statistics(conn: &Connection) -> Result<Statistics, StoreError> {
    let total_sessions: i64 = conn.query_row("SELECT COUNT(*) FROM sessions", [], |r| r.get(0))?;
    let active_sessions: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sessions WHERE status = 'active'",
        [],
        |r| r.get(0),
    )?;
    let total_attempts: i64 = conn.query_row("SELECT COUNT(*) FROM attempts", [], |r| r.get(0))?;
    let resumed: i64 = conn.query_row(
        "SELECT COUNT(*) FROM attempts WHERE decision = 'resume'",
        [],
        |r| r.get(0),
    )?;
    let failed: i64 = conn.query_row(
        "SELECT COUNT(*) FROM attempts WHERE decision = 'fail'",
        [],
        |r| r.get(0),
    )?;

    Ok(Statistics {
        total_sessions: total_sessions as u64,
        active_sessions: active_sessions as u64,
        total_attempts: total_attempts as u64,
        resumed: resumed as u64,
        failed: failed as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    fn store() -> Store {
        Store::in_memory().expect("in-memory store")
    }

    #[test]
    fn create_session_rejects_double_isolation() {
        let s = store();
        let chan = ChannelId(700001);
        s.create_session(chan, None).unwrap();
        let err = s.create_session(chan, None).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyActive(_)));
    }

    #[test]
    fn end_session_rejects_unknown_channel() {
        let s = store();
        let err = s.end_session(ChannelId(1)).unwrap_err();
        assert!(matches!(err, StoreError::NotActive(_)));
    }

    #[test]
    fn add_exception_then_duplicate_fails() {
        let s = store();
        let chan = ChannelId(1);
        let allowed = ChannelId(2);
        s.create_session(chan, None).unwrap();
        let sid = s.active_session_for_channel(chan).unwrap().unwrap();
        s.add_exception(sid, allowed, None).unwrap();
        let err = s.add_exception(sid, allowed, None).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateException(_)));
    }

    #[test]
    fn remove_missing_exception_fails() {
        let s = store();
        let chan = ChannelId(1);
        s.create_session(chan, None).unwrap();
        let sid = s.active_session_for_channel(chan).unwrap().unwrap();
        let err = s.remove_exception(sid, ChannelId(9)).unwrap_err();
        assert!(matches!(err, StoreError::ExceptionNotFound(_)));
    }

    #[test]
    fn ending_a_session_allows_reisolation() {
        let s = store();
        let chan = ChannelId(42);
        s.create_session(chan, None).unwrap();
        s.end_session(chan).unwrap();
        s.create_session(chan, None).unwrap();
    }

    #[test]
    fn statistics_reflect_attempts() {
        let s = store();
        let chan = ChannelId(1);
        s.create_session(chan, None).unwrap();
        let sid = s.active_session_for_channel(chan).unwrap().unwrap();
        s.append_attempt(NewAttempt {
            session_id: sid,
            incoming_channel_id: ChannelId(2),
            outgoing_channel_id: chan,
            amount_msat: 1000,
            incoming_htlc_index: 0,
            outgoing_htlc_index: 0,
            decision: Decision::Fail,
            reason: Reason::NoException,
        });
        let stats = s.statistics().unwrap();
        assert_eq!(stats.total_attempts, 1);
        assert_eq!(stats.failed, 1);
    }
}

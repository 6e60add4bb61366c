//! Core data model: channels, isolation sessions, exceptions and attempts.
//!
//! These types are the shared vocabulary between Store, Policy Index,
//! Control API and Intercept Engine. None of them know how to persist or
//! classify themselves; that lives in `store` and `policy`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Short-channel-id as assigned by the node. Equality is numeric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ChannelId {
    fn from(v: u64) -> Self {
        ChannelId(v)
    }
}

impl std::str::FromStr for ChannelId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>().map(ChannelId)
    }
}

/// Status of an isolation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Ended,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Ended => "ended",
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "ended" => Ok(SessionStatus::Ended),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// A contiguous interval during which a channel was (or is) isolated.
///
/// Invariant: for any `channel_id`, at most one row with
/// `status == Active` exists at any instant (enforced by Store via a
/// partial uniqueness constraint).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: i64,
    pub channel_id: ChannelId,
    pub alias: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
}

/// A rule permitting forwards from `allowed_channel_id` into the
/// isolated channel owning `session_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exception {
    pub session_id: i64,
    pub allowed_channel_id: ChannelId,
    pub alias: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The policy outcome for one intercepted HTLC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Resume,
    Fail,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Resume => "resume",
            Decision::Fail => "fail",
        }
    }
}

/// Why a decision was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Reason {
    ExceptionMatch,
    NoException,
    NotIsolated,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::ExceptionMatch => "exception-match",
            Reason::NoException => "no-exception",
            Reason::NotIsolated => "not-isolated",
        }
    }
}

/// An immutable audit row, written for every intercept request observed
/// against an active session (outgoing channel isolated at the time of
/// the decision).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub attempt_id: i64,
    pub session_id: i64,
    pub observed_at: DateTime<Utc>,
    pub incoming_channel_id: ChannelId,
    pub outgoing_channel_id: ChannelId,
    pub amount_msat: u64,
    pub incoming_htlc_index: u64,
    pub outgoing_htlc_index: u64,
    pub decision: Decision,
    pub reason: Reason,
}

/// Aggregate counters exposed by `stats`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Statistics {
    pub total_sessions: u64,
    pub active_sessions: u64,
    pub total_attempts: u64,
    pub resumed: u64,
    pub failed: u64,
}

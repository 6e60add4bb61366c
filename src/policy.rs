//! Policy Index: the in-memory, lock-free snapshot the Intercept Engine
//! consults on every HTLC. Rebuilt wholesale from the Store after each
//! mutation and published with a single pointer swap.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::model::{ChannelId, Decision, Exception, Reason, Session};

/// One immutable view of which channels are isolated and which
/// exceptions apply. `classify` never touches the Store or blocks.
#[derive(Debug, Default)]
pub struct Snapshot {
    /// Isolated channel -> its active session id.
    active: HashMap<ChannelId, i64>,
    /// (isolated channel, allowed incoming channel) pairs.
    allowed: HashSet<(ChannelId, ChannelId)>,
}

impl Snapshot {
    fn build(sessions: &[Session], exceptions: &[Exception]) -> Self {
        let mut active = HashMap::with_capacity(sessions.len());
        for s in sessions {
            active.insert(s.channel_id, s.session_id);
        }

        let mut allowed = HashSet::with_capacity(exceptions.len());
        for e in exceptions {
            if let Some(session) = sessions.iter().find(|s| s.session_id == e.session_id) {
                allowed.insert((session.channel_id, e.allowed_channel_id));
            }
        }

        Snapshot { active, allowed }
    }

    /// The core classification rule:
    /// - the outgoing channel isn't isolated -> Resume / NotIsolated
    /// - it's isolated and the incoming channel has an exception -> Resume / ExceptionMatch
    /// - it's isolated and there's no exception -> Fail / NoException
    ///
    /// Returns the active session id alongside the decision so the caller
    /// can attribute the attempt row without a second lookup.
    pub fn classify(&self, incoming: ChannelId, outgoing: ChannelId) -> (Option<i64>, Decision, Reason) {
        match self.active.get(&outgoing) {
            None => (None, Decision::Resume, Reason::NotIsolated),
            Some(&session_id) => {
                if self.allowed.contains(&(outgoing, incoming)) {
                    (Some(session_id), Decision::Resume, Reason::ExceptionMatch)
                } else {
                    (Some(session_id), Decision::Fail, Reason::NoException)
                }
            }
        }
    }

    pub fn is_isolated(&self, channel: ChannelId) -> bool {
        self.active.contains_key(&channel)
    }

    pub fn active_session_count(&self) -> usize {
        self.active.len()
    }
}

/// Shared, swappable handle to the current `Snapshot`.
pub struct PolicyIndex {
    current: ArcSwap<Snapshot>,
}

impl PolicyIndex {
    pub fn empty() -> Self {
        PolicyIndex {
            current: ArcSwap::from_pointee(Snapshot::default()),
        }
    }

    pub fn from_store(store: &crate::store::Store) -> Result<Self, crate::store::StoreError> {
        let index = Self::empty();
        index.rebuild(store)?;
        Ok(index)
    }

    /// Re-reads active sessions and exceptions from the Store and
    /// publishes the result as the new current snapshot. Must be called
    /// under the Control API's mutator lock immediately after any write
    /// that can change isolation state, so readers never observe a Store
    /// write without the matching Policy Index update.
    pub fn rebuild(&self, store: &crate::store::Store) -> Result<(), crate::store::StoreError> {
        let (sessions, exceptions) = store.policy_snapshot_data()?;
        self.current.store(Arc::new(Snapshot::build(&sessions, &exceptions)));
        Ok(())
    }

    pub fn load(&self) -> arc_swap::Guard<Arc<Snapshot>> {
        self.current.load()
    }

    pub fn classify(&self, incoming: ChannelId, outgoing: ChannelId) -> (Option<i64>, Decision, Reason) {
        self.current.load().classify(incoming, outgoing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn session(id: i64, channel: u64) -> Session {
        Session {
            session_id: id,
            channel_id: ChannelId(channel),
            alias: None,
            started_at: Utc::now(),
            ended_at: None,
            status: crate::model::SessionStatus::Active,
        }
    }

    fn exception(session_id: i64, allowed: u64) -> Exception {
        Exception {
            session_id,
            allowed_channel_id: ChannelId(allowed),
            alias: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn unisolated_channel_always_resumes() {
        let snap = Snapshot::build(&[], &[]);
        let (sid, decision, reason) = snap.classify(ChannelId(1), ChannelId(2));
        assert_eq!(sid, None);
        assert_eq!(decision, Decision::Resume);
        assert_eq!(reason, Reason::NotIsolated);
    }

    #[test]
    fn isolated_without_exception_fails() {
        let snap = Snapshot::build(&[session(1, 100)], &[]);
        let (sid, decision, reason) = snap.classify(ChannelId(5), ChannelId(100));
        assert_eq!(sid, Some(1));
        assert_eq!(decision, Decision::Fail);
        assert_eq!(reason, Reason::NoException);
    }

    #[test]
    fn isolated_with_matching_exception_resumes() {
        let snap = Snapshot::build(&[session(1, 100)], &[exception(1, 5)]);
        let (sid, decision, reason) = snap.classify(ChannelId(5), ChannelId(100));
        assert_eq!(sid, Some(1));
        assert_eq!(decision, Decision::Resume);
        assert_eq!(reason, Reason::ExceptionMatch);
    }

    #[test]
    fn exception_on_a_different_isolated_channel_does_not_leak() {
        let snap = Snapshot::build(
            &[session(1, 100), session(2, 200)],
            &[exception(2, 5)],
        );
        let (_, decision, reason) = snap.classify(ChannelId(5), ChannelId(100));
        assert_eq!(decision, Decision::Fail);
        assert_eq!(reason, Reason::NoException);
    }

    #[test]
    fn self_loop_is_classified_like_any_other_pair() {
        let snap = Snapshot::build(&[session(1, 100)], &[]);
        let (_, decision, _) = snap.classify(ChannelId(100), ChannelId(100));
        assert_eq!(decision, Decision::Fail);
    }
}

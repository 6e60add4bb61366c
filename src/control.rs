//! Control API: the operations that mutate or query
//! isolation state. Write operations serialize under `mutator`, a single
//! async lock, so that Store write and Policy Index publish happen as
//! one critical section with respect to other writers; reads bypass it
//! entirely.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::spawn_blocking;

use crate::error::{Error, Result};
use crate::model::{Attempt, ChannelId, Exception, Session, Statistics};
use crate::policy::PolicyIndex;
use crate::store::Store;

pub struct ControlApi {
    store: Arc<Store>,
    policy: Arc<PolicyIndex>,
    mutator: Mutex<()>,
}

impl ControlApi {
    pub fn new(store: Arc<Store>, policy: Arc<PolicyIndex>) -> Self {
        ControlApi {
            store,
            policy,
            mutator: Mutex::new(()),
        }
    }

    /// Runs a Store mutation then republishes the Policy Index, holding
    /// `mutator` across both so no other writer observes the Store
    /// change before the snapshot is updated.
    async fn mutate<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Store) -> std::result::Result<R, crate::store::StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let _guard = self.mutator.lock().await;
        let store = self.store.clone();
        let result = spawn_blocking(move || f(&store))
            .await
            .map_err(|e| Error::Storage(format!("mutator task panicked: {e}")))??;
        self.policy.rebuild(&self.store)?;
        Ok(result)
    }

    pub async fn isolate(&self, channel_id: ChannelId, alias: Option<String>) -> Result<i64> {
        let alias = normalize_alias(alias);
        self.mutate(move |store| store.create_session(channel_id, alias)).await
    }

    pub async fn stop(&self, channel_id: ChannelId) -> Result<i64> {
        self.mutate(move |store| store.end_session(channel_id)).await
    }

    pub async fn add_exception(
        &self,
        isolated_chan: ChannelId,
        allowed_chan: ChannelId,
        alias: Option<String>,
    ) -> Result<()> {
        let alias = normalize_alias(alias);
        self.mutate(move |store| {
            let session_id = store
                .active_session_for_channel(isolated_chan)?
                .ok_or_else(|| crate::store::StoreError::NotActive(isolated_chan.to_string()))?;
            store.add_exception(session_id, allowed_chan, alias)
        })
        .await
    }

    pub async fn remove_exception(&self, isolated_chan: ChannelId, allowed_chan: ChannelId) -> Result<()> {
        self.mutate(move |store| {
            let session_id = store
                .active_session_for_channel(isolated_chan)?
                .ok_or_else(|| crate::store::StoreError::NotActive(isolated_chan.to_string()))?;
            store.remove_exception(session_id, allowed_chan)
        })
        .await
    }

    pub async fn list(&self) -> Result<Vec<Session>> {
        let store = self.store.clone();
        Ok(spawn_blocking(move || store.list_active_sessions())
            .await
            .map_err(|e| Error::Storage(e.to_string()))??)
    }

    /// Exceptions for the active session on `channel_id`.
    pub async fn exceptions(&self, channel_id: ChannelId) -> Result<Vec<Exception>> {
        let store = self.store.clone();
        let result = spawn_blocking(move || {
            let session_id = store
                .active_session_for_channel(channel_id)?
                .ok_or_else(|| crate::store::StoreError::NotActive(channel_id.to_string()))?;
            store.list_exceptions(session_id)
        })
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(result?)
    }

    pub async fn history(&self, channel_id: Option<ChannelId>) -> Result<Vec<Session>> {
        let store = self.store.clone();
        Ok(spawn_blocking(move || store.session_history(channel_id))
            .await
            .map_err(|e| Error::Storage(e.to_string()))??)
    }

    pub async fn attempts(&self, session_id: i64, limit: Option<u32>) -> Result<Vec<Attempt>> {
        let store = self.store.clone();
        Ok(spawn_blocking(move || store.attempts_for_session(session_id, limit))
            .await
            .map_err(|e| Error::Storage(e.to_string()))??)
    }

    pub async fn stats(&self) -> Result<Statistics> {
        let store = self.store.clone();
        Ok(spawn_blocking(move || store.statistics())
            .await
            .map_err(|e| Error::Storage(e.to_string()))??)
    }
}

/// Trims, truncates to 256 bytes, and turns an empty alias into `None`.
fn normalize_alias(alias: Option<String>) -> Option<String> {
    alias.map(|a| a.trim().to_string()).and_then(|a| {
        if a.is_empty() {
            None
        } else if a.len() > 256 {
            Some(a[..floor_char_boundary(&a, 256)].to_string())
        } else {
            Some(a)
        }
    })
}

/// The largest byte index `<= limit` that lands on a UTF-8 char boundary,
/// so truncation never splits a multi-byte character.
fn floor_char_boundary(s: &str, limit: usize) -> usize {
    let mut idx = limit.min(s.len());
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Decision;

    async fn api() -> ControlApi {
        let store = Arc::new(Store::in_memory().unwrap());
        let policy = Arc::new(PolicyIndex::from_store(&store).unwrap());
        ControlApi::new(store, policy)
    }

    #[tokio::test]
    async fn isolate_then_exception_allows_the_excepted_channel() {
        let api = api().await;
        let isolated = ChannelId(700);
        let allowed = ChannelId(800);

        api.isolate(isolated, None).await.unwrap();
        api.add_exception(isolated, allowed, None).await.unwrap();

        let (_, decision, _) = api.policy.classify(allowed, isolated);
        assert_eq!(decision, Decision::Resume);
    }

    #[tokio::test]
    async fn remove_exception_then_classify_fails_again() {
        let api = api().await;
        let isolated = ChannelId(700);
        let allowed = ChannelId(800);

        api.isolate(isolated, None).await.unwrap();
        api.add_exception(isolated, allowed, None).await.unwrap();
        api.remove_exception(isolated, allowed).await.unwrap();

        let (_, decision, _) = api.policy.classify(allowed, isolated);
        assert_eq!(decision, Decision::Fail);
    }

    #[tokio::test]
    async fn stop_then_classify_resumes() {
        let api = api().await;
        let isolated = ChannelId(700);

        api.isolate(isolated, None).await.unwrap();
        api.stop(isolated).await.unwrap();

        let (_, decision, _) = api.policy.classify(ChannelId(1), isolated);
        assert_eq!(decision, Decision::Resume);
    }

    #[tokio::test]
    async fn double_isolate_is_rejected() {
        let api = api().await;
        let isolated = ChannelId(700);
        api.isolate(isolated, None).await.unwrap();
        let err = api.isolate(isolated, None).await.unwrap_err();
        assert_eq!(err.exit_code(), 4);
    }

    #[tokio::test]
    async fn alias_is_trimmed_and_truncated() {
        assert_eq!(normalize_alias(Some("  hi  ".into())), Some("hi".into()));
        assert_eq!(normalize_alias(Some("   ".into())), None);
        let long = "a".repeat(300);
        assert_eq!(normalize_alias(Some(long)).unwrap().len(), 256);
    }
}

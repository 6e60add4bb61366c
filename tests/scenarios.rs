//! Integration coverage driving Store + Policy Index + Control API
//! together the way the Supervisor wires them at startup.

use std::sync::Arc;

use channel_isolator::control::ControlApi;
use channel_isolator::intercept::fake;
use channel_isolator::intercept::{CircuitKey, Engine, InterceptRequest, ResolveAction};
use channel_isolator::model::{ChannelId, Decision, Reason};
use channel_isolator::policy::PolicyIndex;
use channel_isolator::store::queue::AttemptQueue;
use channel_isolator::store::Store;

fn control() -> (Arc<Store>, Arc<PolicyIndex>, ControlApi) {
    let store = Arc::new(Store::in_memory().unwrap());
    let policy = Arc::new(PolicyIndex::from_store(&store).unwrap());
    let control = ControlApi::new(store.clone(), policy.clone());
    (store, policy, control)
}

// Scenario 1: isolate a channel, request from an unexcepted incoming
// channel fails and is recorded with reason no-exception.
#[tokio::test]
async fn scenario_1_unexcepted_request_fails_and_is_recorded() {
    let (store, policy, control) = control();
    let isolated = ChannelId(700_000_000_000_000_000);
    control.isolate(isolated, None).await.unwrap();

    let (_, decision, reason) = policy.classify(ChannelId(800), isolated);
    assert_eq!(decision, Decision::Fail);
    assert_eq!(reason, Reason::NoException);

    let session_id = store.active_session_for_channel(isolated).unwrap().unwrap();
    let attempts = AttemptQueue::new(16);
    attempts.push(channel_isolator::store::NewAttempt {
        session_id,
        incoming_channel_id: ChannelId(800),
        outgoing_channel_id: isolated,
        amount_msat: 1000,
        incoming_htlc_index: 0,
        outgoing_htlc_index: 0,
        decision,
        reason,
    });
    let queue_drain = channel_isolator::store::queue::spawn_drain(store.clone(), attempts.clone());
    attempts.close();
    queue_drain.await.unwrap();

    let recorded = store.attempts_for_session(session_id, None).unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].reason, Reason::NoException);
}

// Scenario 2: add an exception, the formerly-failing request now resumes
// and is still recorded (reason exception-match).
#[tokio::test]
async fn scenario_2_exception_allows_forward() {
    let (_store, policy, control) = control();
    let isolated = ChannelId(700_000_000_000_000_000);
    control.isolate(isolated, None).await.unwrap();
    control.add_exception(isolated, ChannelId(800), None).await.unwrap();

    let (session_id, decision, reason) = policy.classify(ChannelId(800), isolated);
    assert!(session_id.is_some());
    assert_eq!(decision, Decision::Resume);
    assert_eq!(reason, Reason::ExceptionMatch);
}

// Scenario 3: no isolation at all; always resume, no attempt written.
#[tokio::test]
async fn scenario_3_no_isolation_means_no_attempt() {
    let (_store, policy, _control) = control();
    let (session_id, decision, reason) = policy.classify(ChannelId(800), ChannelId(900));
    assert_eq!(session_id, None);
    assert_eq!(decision, Decision::Resume);
    assert_eq!(reason, Reason::NotIsolated);
}

// Scenario 5: isolate, add exception, stop - one session row transitions
// to ended; its exceptions remain in storage but stop affecting policy.
#[tokio::test]
async fn scenario_5_stopping_ends_the_session_not_the_exceptions() {
    let (store, policy, control) = control();
    let isolated = ChannelId(42);
    control.isolate(isolated, None).await.unwrap();
    control.add_exception(isolated, ChannelId(7), None).await.unwrap();
    let session_id = store.active_session_for_channel(isolated).unwrap().unwrap();

    control.stop(isolated).await.unwrap();

    let history = store.session_history(Some(isolated)).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, channel_isolator::model::SessionStatus::Ended);

    let exceptions = store.list_exceptions(session_id).unwrap();
    assert_eq!(exceptions.len(), 1);

    let (_, decision, reason) = policy.classify(ChannelId(7), isolated);
    assert_eq!(decision, Decision::Resume);
    assert_eq!(reason, Reason::NotIsolated);
}

// Scenario (testable property): isolate twice is rejected, state unchanged.
#[tokio::test]
async fn double_isolate_rejected_state_unchanged() {
    let (store, _policy, control) = control();
    let chan = ChannelId(1);
    control.isolate(chan, Some("first".into())).await.unwrap();
    let err = control.isolate(chan, Some("second".into())).await.unwrap_err();
    assert_eq!(err.exit_code(), 4);

    let sessions = store.list_active_sessions().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].alias.as_deref(), Some("first"));
}

// Scenario 4: rules survive a simulated restart (new Store handle over
// the same file-backed... here an in-memory store standing in for a
// fresh process, since the state itself - not the process - is what
// must survive).
#[tokio::test]
async fn scenario_4_rules_survive_reopening_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("policy.db");

    {
        let store = Store::open(&db_path).unwrap();
        store.create_session(ChannelId(5), None).unwrap();
    }

    let reopened = Store::open(&db_path).unwrap();
    let policy = PolicyIndex::from_store(&reopened).unwrap();
    let (_, decision, reason) = policy.classify(ChannelId(1), ChannelId(5));
    assert_eq!(decision, Decision::Fail);
    assert_eq!(reason, Reason::NoException);
}

// Engine-level check that a fail decision carries the configured
// failure code on the wire.
#[tokio::test]
async fn engine_emits_configured_failure_code() {
    let store = Arc::new(Store::in_memory().unwrap());
    store.create_session(ChannelId(9), None).unwrap();
    let policy = Arc::new(PolicyIndex::from_store(&store).unwrap());

    let attempts = AttemptQueue::new(16);
    let (transport, mut node) = fake::pair(4);
    let mut engine = Engine::new(transport, policy, attempts, "TemporaryChannelFailure".into());

    let (_stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    node.requests
        .send(InterceptRequest {
            incoming_circuit_key: CircuitKey { chan_id: ChannelId(1), htlc_id: 1 },
            incoming_amount_msat: 500,
            outgoing_amount_msat: 500,
            outgoing_chan_id: ChannelId(9),
            outgoing_htlc_id: 1,
        })
        .await
        .unwrap();
    drop(node.requests);

    engine.run_once(stop_rx).await;
    let resolution = node.resolutions.recv().await.unwrap();
    assert_eq!(resolution.action, ResolveAction::Fail);
    assert_eq!(resolution.failure_code.as_deref(), Some("TemporaryChannelFailure"));
}

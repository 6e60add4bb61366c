//! The Intercept Engine: owns the bidirectional stream to the node,
//! consults the Policy Index per request, records attempts, and manages
//! reconnection under exponential backoff.

pub mod backoff;
pub mod transport;

pub use transport::{
    CircuitKey, GrpcTransport, InterceptRequest, InterceptResolution, InterceptTransport,
    ResolveAction,
};

#[cfg(any(test, feature = "test-util"))]
pub use transport::fake;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::model::{ChannelId, Reason};
use crate::policy::PolicyIndex;
use crate::store::queue::AttemptQueue;
use crate::store::NewAttempt;
use backoff::Backoff;

/// `idle -> streaming -> draining -> idle`, with any state able to move
/// to the terminal `stopped` on supervisor stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Streaming,
    Draining,
    Stopped,
}

/// Drives one transport connection's worth of request/resolution
/// traffic. A fresh `Engine` is constructed per reconnect attempt by
/// whoever owns the retry loop (the Supervisor); `run_once` drives a
/// single `idle -> streaming -> draining` pass and returns the next
/// state plus how long the stream survived.
pub struct Engine<T: InterceptTransport> {
    transport: T,
    policy: Arc<PolicyIndex>,
    attempts: Arc<AttemptQueue>,
    failure_code: String,
    state: EngineState,
}

const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

impl<T: InterceptTransport> Engine<T> {
    pub fn new(transport: T, policy: Arc<PolicyIndex>, attempts: Arc<AttemptQueue>, failure_code: String) -> Self {
        Engine {
            transport,
            policy,
            attempts,
            failure_code,
            state: EngineState::Idle,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Opens the stream and services requests until a recv/send error, a
    /// clean close, or `stop` fires. Returns how long the stream was up,
    /// for the caller's backoff bookkeeping.
    pub async fn run_once(&mut self, mut stop: watch::Receiver<bool>) -> Duration {
        let started = Instant::now();

        if let Err(e) = self.transport.open().await {
            tracing::warn!(error = %e, "failed to open intercept stream");
            self.state = EngineState::Draining;
            return started.elapsed();
        }
        self.state = EngineState::Streaming;

        loop {
            tokio::select! {
                biased;

                changed = stop.changed() => {
                    if changed.is_ok() && *stop.borrow() {
                        self.state = EngineState::Draining;
                        self.drain(stop.clone()).await;
                        self.state = EngineState::Stopped;
                        break;
                    }
                }

                req = self.transport.recv() => {
                    match req {
                        Ok(Some(req)) => self.handle(req).await,
                        Ok(None) => { self.state = EngineState::Draining; break; }
                        Err(e) => {
                            tracing::warn!(error = %e, "intercept stream error");
                            self.state = EngineState::Draining;
                            break;
                        }
                    }
                }
            }
        }

        self.transport.close().await;
        started.elapsed()
    }

    /// One request: classify, resolve, optionally record an attempt.
    async fn handle(&mut self, req: InterceptRequest) {
        let incoming = req.incoming_circuit_key.chan_id;
        let outgoing = req.outgoing_chan_id;

        let (session_id, decision, reason) = self.policy.classify(incoming, outgoing);

        let resolution = match decision {
            crate::model::Decision::Resume => InterceptResolution::resume(req.incoming_circuit_key),
            crate::model::Decision::Fail => {
                InterceptResolution::fail(req.incoming_circuit_key, self.failure_code.clone())
            }
        };

        if let Err(e) = self.transport.send(resolution).await {
            tracing::warn!(error = %e, "failed to send resolution");
            return;
        }

        if reason != Reason::NotIsolated {
            if let Some(session_id) = session_id {
                self.attempts.push(NewAttempt {
                    session_id,
                    incoming_channel_id: incoming,
                    outgoing_channel_id: outgoing,
                    amount_msat: req.incoming_amount_msat,
                    incoming_htlc_index: req.incoming_circuit_key.htlc_id,
                    outgoing_htlc_index: req.outgoing_htlc_id,
                    decision,
                    reason,
                });
            }
        }
    }

    /// Closes the send side, drains remaining in-flight requests with
    /// `resume` for up to `DRAIN_TIMEOUT` so nothing is black-holed, then
    /// stops. No more than one drain pass.
    async fn drain(&mut self, _stop: watch::Receiver<bool>) {
        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.transport.recv()).await {
                Ok(Ok(Some(req))) => {
                    let _ = self
                        .transport
                        .send(InterceptResolution::resume(req.incoming_circuit_key))
                        .await;
                }
                _ => break,
            }
        }
    }
}

/// Runs the Engine under the backoff/reconnect loop until `stop` fires.
/// Owned by the Supervisor, which restarts the Engine under this
/// schedule whenever it terminates with an error.
pub async fn run_with_backoff<F, T>(
    mut make_transport: F,
    policy: Arc<PolicyIndex>,
    attempts: Arc<AttemptQueue>,
    failure_code: String,
    mut stop: watch::Receiver<bool>,
) where
    F: FnMut() -> T,
    T: InterceptTransport,
{
    let mut backoff = Backoff::new();

    loop {
        if *stop.borrow() {
            break;
        }

        let transport = make_transport();
        let mut engine = Engine::new(transport, policy.clone(), attempts.clone(), failure_code.clone());
        let survived = engine.run_once(stop.clone()).await;

        if *stop.borrow() {
            break;
        }

        backoff.record_stream_duration(survived);
        let delay = backoff.next_delay();
        tracing::info!(delay_ms = delay.as_millis() as u64, "reconnecting intercept stream");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop.changed() => {
                if *stop.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ChannelId as Chan;
    use crate::store::Store;
    use std::sync::Arc as StdArc;

    async fn setup() -> (Arc<PolicyIndex>, Arc<Store>) {
        let store = StdArc::new(Store::in_memory().unwrap());
        let policy = Arc::new(PolicyIndex::from_store(&store).unwrap());
        (policy, store)
    }

    #[tokio::test]
    async fn unisolated_request_resumes_with_no_attempt() {
        let (policy, store) = setup().await;
        let attempts = AttemptQueue::new(16);
        let (transport, mut node) = transport::fake::pair(4);
        let mut engine = Engine::new(transport, policy, attempts.clone(), "TemporaryChannelFailure".into());

        let (_stop_tx, stop_rx) = watch::channel(false);
        let key = CircuitKey { chan_id: Chan(800), htlc_id: 1 };
        node.requests
            .send(InterceptRequest {
                incoming_circuit_key: key,
                incoming_amount_msat: 1000,
                outgoing_amount_msat: 1000,
                outgoing_chan_id: Chan(900),
                outgoing_htlc_id: 1,
            })
            .await
            .unwrap();
        drop(node.requests);

        engine.run_once(stop_rx).await;
        let resolution = node.resolutions.recv().await.unwrap();
        assert_eq!(resolution.action, ResolveAction::Resume);
        assert_eq!(attempts.dropped_count(), 0);
        let _ = store;
    }

    #[tokio::test]
    async fn isolated_channel_without_exception_fails_and_records() {
        let (policy, store) = setup().await;
        store.create_session(Chan(700), None).unwrap();
        policy.rebuild(&store).unwrap();

        let attempts = AttemptQueue::new(16);
        let (transport, mut node) = transport::fake::pair(4);
        let mut engine = Engine::new(transport, policy, attempts.clone(), "TemporaryChannelFailure".into());

        let (_stop_tx, stop_rx) = watch::channel(false);
        let key = CircuitKey { chan_id: Chan(800), htlc_id: 1 };
        node.requests
            .send(InterceptRequest {
                incoming_circuit_key: key,
                incoming_amount_msat: 1000,
                outgoing_amount_msat: 1000,
                outgoing_chan_id: Chan(700),
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
}

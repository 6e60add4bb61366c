//! Process lifecycle: starts Store, builds the initial Policy Index,
//! starts Control API and Intercept Engine, restarts the Engine under
//! backoff on terminal error, and drives orderly shutdown on signal.

use std::sync::Arc;

use tokio::sync::watch;

use crate::config::Config;
use crate::control::ControlApi;
use crate::credentials::NodeCredentials;
use crate::intercept::{self, GrpcTransport};
use crate::policy::PolicyIndex;
use crate::store::queue::{spawn_drain, AttemptQueue};
use crate::store::Store;

const ATTEMPT_QUEUE_CAPACITY: usize = 1024;

pub struct Supervisor {
    pub store: Arc<Store>,
    pub control: Arc<ControlApi>,
    policy: Arc<PolicyIndex>,
    attempts: Arc<AttemptQueue>,
    config: Config,
}

impl Supervisor {
    pub fn start(config: Config) -> Result<Self, crate::error::Error> {
        let store = Arc::new(Store::open(&config.db_path).map_err(crate::error::Error::from)?);
        let policy = Arc::new(PolicyIndex::from_store(&store).map_err(crate::error::Error::from)?);
        let control = Arc::new(ControlApi::new(store.clone(), policy.clone()));
        let attempts = AttemptQueue::new(ATTEMPT_QUEUE_CAPACITY);

        crate::startup::log_startup(&config);

        Ok(Supervisor {
            store,
            control,
            policy,
            attempts,
            config,
        })
    }

    /// Runs the Intercept Engine under backoff until `stop` fires, then
    /// flushes the attempt queue and returns. This is the daemon's main
    /// loop; CLI invocations never call it.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        let endpoint = node_endpoint(&self.config);
        let failure_code = self.config.policy_failure_code.clone();
        let policy = self.policy.clone();
        let attempts = self.attempts.clone();
        let config = self.config.clone();

        let drain_handle = spawn_drain(self.store.clone(), self.attempts.clone());

        let engine_stop = stop.clone();
        let make_transport = move || {
            let credentials = NodeCredentials::discover(&config)
                .unwrap_or_else(|e| {
                    tracing::error!(error = %e, "failed to load node credentials");
                    NodeCredentials { tls_cert_pem: Vec::new(), macaroon_hex: String::new() }
                });
            GrpcTransport::new(endpoint.clone(), credentials)
        };

        intercept::run_with_backoff(make_transport, policy, attempts, failure_code, engine_stop).await;

        // Orderly shutdown: stop signaled, engine loop returned. Flush the
        // attempt queue before Store is dropped so nothing in flight is lost.
        self.attempts.close();
        let _ = drain_handle.await;
        let _ = stop.changed().await;
    }
}

fn node_endpoint(_config: &Config) -> String {
    // The node's interceptor RPC address isn't a startup CLI flag
    // (only --node-dir/--network/--db-path are); read from the
    // environment with a conventional default instead.
    std::env::var("CHANNEL_ISOLATOR_NODE_RPC_ADDR")
        .unwrap_or_else(|_| "https://127.0.0.1:10009".to_string())
}

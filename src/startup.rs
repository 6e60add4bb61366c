//! Startup banner: announces which modules are coming up, always
//! through the `tracing`-backed logging path.

use crate::config::Config;

struct ModuleStatus {
    name: &'static str,
    description: &'static str,
}

const MODULES: &[ModuleStatus] = &[
    ModuleStatus { name: "store", description: "durable session/exception/attempt log" },
    ModuleStatus { name: "policy-index", description: "lock-free isolation snapshot" },
    ModuleStatus { name: "control-api", description: "isolate/stop/exception/query operations" },
    ModuleStatus { name: "intercept-engine", description: "HTLC interceptor stream" },
];

/// Logs the boot sequence. Called once, after Store/Policy Index/Control
/// API are constructed and before the Intercept Engine's reconnect loop
/// starts.
pub fn log_startup(config: &Config) {
    tracing::info!("channel-isolator starting");
    tracing::info!(node_dir = %config.node_dir.display(), network = ?config.network, "configuration loaded");

    for module in MODULES {
        tracing::info!("  + {} - {}", module.name, module.description);
    }

    tracing::info!(db_path = %config.db_path.display(), "ready");
}

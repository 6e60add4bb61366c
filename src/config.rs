//! Startup configuration: CLI flag > environment variable > default.

use std::path::PathBuf;

/// Which chain the node is running on; selects the macaroon subpath.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[clap(rename_all = "lowercase")]
pub enum NodeNetwork {
    Mainnet,
    Testnet,
    Regtest,
}

impl NodeNetwork {
    fn as_str(&self) -> &'static str {
        match self {
            NodeNetwork::Mainnet => "mainnet",
            NodeNetwork::Testnet => "testnet",
            NodeNetwork::Regtest => "regtest",
        }
    }
}

impl std::str::FromStr for NodeNetwork {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" => Ok(NodeNetwork::Mainnet),
            "testnet" => Ok(NodeNetwork::Testnet),
            "regtest" => Ok(NodeNetwork::Regtest),
            other => Err(format!("unknown network: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub node_dir: PathBuf,
    pub network: NodeNetwork,
    pub db_path: PathBuf,
    pub tls_cert_path: PathBuf,
    pub macaroon_path: PathBuf,
    /// Failure code emitted on policy refusal. The node always emits
    /// `TemporaryChannelFailure`; kept configurable rather than hardcoded
    /// so an operator can override it without a rebuild.
    pub policy_failure_code: String,
}

impl Config {
    /// Builds a `Config` from already-parsed CLI flags, falling back to
    /// environment variables and then built-in defaults for any that were
    /// left unset on the command line.
    pub fn resolve(
        node_dir: Option<PathBuf>,
        network: Option<NodeNetwork>,
        db_path: Option<PathBuf>,
    ) -> Self {
        let node_dir = node_dir
            .or_else(|| std::env::var("CHANNEL_ISOLATOR_NODE_DIR").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("/data/lnd"));

        let network = network
            .or_else(|| {
                std::env::var("CHANNEL_ISOLATOR_NETWORK")
                    .ok()
                    .and_then(|s| s.parse().ok())
            })
            .unwrap_or(NodeNetwork::Mainnet);

        let db_path = db_path
            .or_else(|| std::env::var("CHANNEL_ISOLATOR_DB_PATH").ok().map(PathBuf::from))
            .unwrap_or_else(default_db_path);

        let tls_cert_path = node_dir.join("tls.cert");
        let macaroon_path = node_dir
            .join("data")
            .join("chain")
            .join("bitcoin")
            .join(network.as_str())
            .join("admin.macaroon");

        let policy_failure_code = std::env::var("CHANNEL_ISOLATOR_FAILURE_CODE")
            .unwrap_or_else(|_| "TemporaryChannelFailure".to_string());

        Config {
            node_dir,
            network,
            db_path,
            tls_cert_path,
            macaroon_path,
            policy_failure_code,
        }
    }
}

fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("channel_isolator")
        .join("channel_isolator.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_flags_take_precedence_over_defaults() {
        let cfg = Config::resolve(
            Some(PathBuf::from("/custom/lnd")),
            Some(NodeNetwork::Testnet),
            Some(PathBuf::from("/custom/db.sqlite")),
        );
        assert_eq!(cfg.node_dir, PathBuf::from("/custom/lnd"));
        assert_eq!(cfg.db_path, PathBuf::from("/custom/db.sqlite"));
        assert_eq!(
            cfg.macaroon_path,
            PathBuf::from("/custom/lnd/data/chain/bitcoin/testnet/admin.macaroon")
        );
    }

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::resolve(None, None, None);
        assert_eq!(cfg.node_dir, PathBuf::from("/data/lnd"));
        assert_eq!(cfg.network, NodeNetwork::Mainnet);
    }
}

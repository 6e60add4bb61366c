//! Node RPC credential discovery: reads the TLS certificate and macaroon
//! the gRPC transport needs to open an authenticated connection to the
//! node.

use std::path::Path;

use crate::config::Config;

#[derive(Debug, Clone)]
pub struct NodeCredentials {
    pub tls_cert_pem: Vec<u8>,
    pub macaroon_hex: String,
}

impl NodeCredentials {
    /// Reads the TLS certificate and macaroon from the paths `Config`
    /// resolved under `--node-dir`/`--network`.
    pub fn discover(config: &Config) -> Result<Self, crate::error::Error> {
        let tls_cert_pem = read(&config.tls_cert_path)?;
        let macaroon_bytes = read(&config.macaroon_path)?;
        Ok(NodeCredentials {
            tls_cert_pem,
            macaroon_hex: hex::encode(macaroon_bytes),
        })
    }

    /// The value for the `macaroon` metadata header on every RPC.
    pub fn macaroon_header(&self) -> String {
        self.macaroon_hex.clone()
    }
}

fn read(path: &Path) -> Result<Vec<u8>, crate::error::Error> {
    std::fs::read(path)
        .map_err(|e| crate::error::Error::Transport(format!("reading {}: {e}", path.display())))
}

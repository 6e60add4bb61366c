//! The Intercept Transport capability: open stream, recv request, send
//! resolution, close. Kept as a trait so the engine can run against a
//! `FakeTransport` in tests and a real `GrpcTransport` in production.

use async_trait::async_trait;

use crate::error::Error;
use crate::model::ChannelId;

/// Identifies one HTLC on the incoming link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitKey {
    pub chan_id: ChannelId,
    pub htlc_id: u64,
}

/// One in-flight forwarding attempt, as delivered by the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterceptRequest {
    pub incoming_circuit_key: CircuitKey,
    pub incoming_amount_msat: u64,
    pub outgoing_amount_msat: u64,
    pub outgoing_chan_id: ChannelId,
    pub outgoing_htlc_id: u64,
}

/// The policy decision sent back on the same stream. `Settle` exists on
/// the wire but is never emitted by this engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveAction {
    Resume,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterceptResolution {
    pub incoming_circuit_key: CircuitKey,
    pub action: ResolveAction,
    pub failure_code: Option<String>,
}

impl InterceptResolution {
    pub fn resume(key: CircuitKey) -> Self {
        InterceptResolution {
            incoming_circuit_key: key,
            action: ResolveAction::Resume,
            failure_code: None,
        }
    }

    pub fn fail(key: CircuitKey, failure_code: String) -> Self {
        InterceptResolution {
            incoming_circuit_key: key,
            action: ResolveAction::Fail,
            failure_code: Some(failure_code),
        }
    }
}

/// Open stream, recv request, send resolution, close.
#[async_trait]
pub trait InterceptTransport: Send {
    async fn open(&mut self) -> Result<(), Error>;

    /// `Ok(None)` means the node closed its send side cleanly.
    async fn recv(&mut self) -> Result<Option<InterceptRequest>, Error>;

    async fn send(&mut self, resolution: InterceptResolution) -> Result<(), Error>;

    async fn close(&mut self);
}

pub mod grpc {
    use std::path::PathBuf;

    use tonic::transport::{Certificate, Channel, ClientTlsConfig};
    use tonic::{Request, Streaming};

    use super::*;
    use crate::credentials::NodeCredentials;
    use crate::pb;

    /// Bidirectional-streaming client against the node's interceptor
    /// endpoint: the TLS cert and macaroon wire into the channel's TLS
    /// config and a per-call metadata header.
    pub struct GrpcTransport {
        endpoint: String,
        credentials: NodeCredentials,
        tx: Option<tokio::sync::mpsc::Sender<pb::ForwardHtlcInterceptResponse>>,
        rx: Option<Streaming<pb::ForwardHtlcInterceptRequest>>,
    }

    impl GrpcTransport {
        pub fn new(endpoint: String, credentials: NodeCredentials) -> Self {
            GrpcTransport {
                endpoint,
                credentials,
                tx: None,
                rx: None,
            }
        }

        fn tls_cert_path_hint(&self) -> PathBuf {
            PathBuf::from("tls.cert")
        }
    }

    #[async_trait]
    impl InterceptTransport for GrpcTransport {
        async fn open(&mut self) -> Result<(), Error> {
            let tls = ClientTlsConfig::new()
                .ca_certificate(Certificate::from_pem(&self.credentials.tls_cert_pem));

            let channel = Channel::from_shared(self.endpoint.clone())
                .map_err(|e| Error::Transport(format!("invalid endpoint: {e}")))?
                .tls_config(tls)
                .map_err(|e| Error::Transport(format!("tls config: {e}")))?
                .connect()
                .await
                .map_err(|e| Error::Transport(format!("connect: {e}")))?;

            let macaroon = self.credentials.macaroon_header();
            let mut client = pb::htlc_interceptor_client::HtlcInterceptorClient::with_interceptor(
                channel,
                move |mut req: Request<()>| {
                    req.metadata_mut()
                        .insert("macaroon", macaroon.parse().unwrap());
                    Ok(req)
                },
            );

            let (tx, rx) = tokio::sync::mpsc::channel(1);
            let outbound = tokio_stream::wrappers::ReceiverStream::new(rx);
            let response = client
                .htlc_interceptor_stream(Request::new(outbound))
                .await
                .map_err(|e| Error::Transport(format!("open stream: {e}")))?;

            self.tx = Some(tx);
            self.rx = Some(response.into_inner());
            let _ = self.tls_cert_path_hint();
            Ok(())
        }

        async fn recv(&mut self) -> Result<Option<InterceptRequest>, Error> {
            let rx = self
                .rx
                .as_mut()
                .ok_or_else(|| Error::Transport("recv on unopened stream".into()))?;

            match rx.message().await {
                Ok(Some(req)) => Ok(Some(from_wire(req))),
                Ok(None) => Ok(None),
                Err(status) => Err(Error::Transport(status.to_string())),
            }
        }

        async fn send(&mut self, resolution: InterceptResolution) -> Result<(), Error> {
            let tx = self
                .tx
                .as_ref()
                .ok_or_else(|| Error::Transport("send on unopened stream".into()))?;

            tx.send(to_wire(resolution))
                .await
                .map_err(|e| Error::Transport(format!("send: {e}")))
        }

        async fn close(&mut self) {
            self.tx = None;
            self.rx = None;
        }
    }

    fn from_wire(req: pb::ForwardHtlcInterceptRequest) -> InterceptRequest {
        let incoming = req.incoming_circuit_key.unwrap_or_default();
        InterceptRequest {
            incoming_circuit_key: CircuitKey {
                chan_id: ChannelId(incoming.chan_id),
                htlc_id: incoming.htlc_id,
            },
            incoming_amount_msat: req.incoming_amount_msat,
            outgoing_amount_msat: req.outgoing_amount_msat,
            outgoing_chan_id: ChannelId(req.outgoing_requested_chan_id),
            outgoing_htlc_id: req.outgoing_htlc_id,
        }
    }

    fn to_wire(resolution: InterceptResolution) -> pb::ForwardHtlcInterceptResponse {
        pb::ForwardHtlcInterceptResponse {
            incoming_circuit_key: Some(pb::CircuitKey {
                chan_id: resolution.incoming_circuit_key.chan_id.0,
                htlc_id: resolution.incoming_circuit_key.htlc_id,
            }),
            action: match resolution.action {
                ResolveAction::Resume => pb::ResolveAction::Resume as i32,
                ResolveAction::Fail => pb::ResolveAction::Fail as i32,
            },
            failure_code: resolution.failure_code.unwrap_or_default(),
        }
    }
}

pub use grpc::GrpcTransport;

#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::*;
    use tokio::sync::mpsc;

    /// An in-memory transport pair for engine unit tests: one end drives
    /// the "node" side (feeds requests, reads resolutions), the other is
    /// handed to the engine as an `InterceptTransport`.
    pub struct FakeTransport {
        inbound: mpsc::Receiver<InterceptRequest>,
        outbound: mpsc::Sender<InterceptResolution>,
        opened: bool,
    }

    pub struct FakeNodeHandle {
        pub requests: mpsc::Sender<InterceptRequest>,
        pub resolutions: mpsc::Receiver<InterceptResolution>,
    }

    pub fn pair(capacity: usize) -> (FakeTransport, FakeNodeHandle) {
        let (req_tx, req_rx) = mpsc::channel(capacity);
        let (res_tx, res_rx) = mpsc::channel(capacity);
        (
            FakeTransport {
                inbound: req_rx,
                outbound: res_tx,
                opened: false,
            },
            FakeNodeHandle {
                requests: req_tx,
                resolutions: res_rx,
            },
        )
    }

    #[async_trait]
    impl InterceptTransport for FakeTransport {
        async fn open(&mut self) -> Result<(), Error> {
            self.opened = true;
            Ok(())
        }

        async fn recv(&mut self) -> Result<Option<InterceptRequest>, Error> {
            Ok(self.inbound.recv().await)
        }

        async fn send(&mut self, resolution: InterceptResolution) -> Result<(), Error> {
            self.outbound
                .send(resolution)
                .await
                .map_err(|_| Error::Transport("fake node gone".into()))
        }

        async fn close(&mut self) {
            self.opened = false;
        }
    }
}

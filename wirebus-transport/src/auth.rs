//! Inbound connection authentication.
//!
//! Every accepted connection gets its own authenticator task. The task
//! consumes the one-byte connect framing, runs the pluggable handshake and,
//! on success, hands the connection over for promotion before it ends.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use crate::endpoint::{Endpoint, ExitEvent, ExitKind};
use crate::error::{TransportError, TransportResult};
use crate::state::{AuthState, Side};
use crate::transport::TransportCore;

/// Framing byte a connecting peer sends before the handshake.
pub(crate) const NUL_BYTE: u8 = 0;

/// Identity a successful handshake established for the peer.
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    /// GUID of the remote daemon or application.
    pub guid: String,
    /// Whether the peer is itself a routing node. Sessions to routing
    /// nodes are expected to be set up promptly after connecting.
    pub routing_node: bool,
    /// Whether the peer authenticated over a trusted mechanism.
    pub trusted: bool,
}

/// The pluggable handshake run over a fresh connection, after the framing
/// byte on the passive side and after sending it on the active side.
#[async_trait]
pub trait Establisher: Send + Sync + 'static {
    async fn establish(
        &self,
        stream: &mut TcpStream,
        side: Side,
        remote: SocketAddr,
    ) -> TransportResult<PeerIdentity>;
}

/// Start the authenticator task for an accepted connection.
pub(crate) fn spawn(core: Arc<TransportCore>, ep: Arc<Endpoint>, stream: TcpStream) {
    let task = tokio::spawn(run(core, ep.clone(), stream));
    ep.store_auth_task(task);
}

async fn run(core: Arc<TransportCore>, ep: Arc<Endpoint>, mut stream: TcpStream) {
    crate::lock(&ep.states).set_auth(AuthState::Authenticating);

    let cancel = ep.auth_token();
    let outcome = tokio::select! {
        result = handshake(&core, &ep, &mut stream) => result,
        _ = cancel.cancelled() => Err(TransportError::Stopping),
    };

    match outcome {
        Ok(identity) => {
            // The terminal state is published before the promotion tail, so
            // a cancellation landing from here on is a no-op.
            ep.set_identity(identity);
            crate::lock(&ep.states).set_auth(AuthState::Succeeded);
            core.authenticated(&ep, stream);
        }
        Err(err) => {
            debug!("endpoint {}: authentication failed: {}", ep.id(), err);
            crate::lock(&ep.states).set_auth(AuthState::Failed);
        }
    }

    let _ = core
        .exit_sender()
        .send(ExitEvent {
            id: ep.id(),
            kind: ExitKind::Auth,
        })
        .await;
}

async fn handshake(
    core: &Arc<TransportCore>,
    ep: &Arc<Endpoint>,
    stream: &mut TcpStream,
) -> TransportResult<PeerIdentity> {
    let byte = stream.read_u8().await?;
    if byte != NUL_BYTE {
        return Err(TransportError::auth_failed(format!(
            "unexpected framing byte 0x{:02x}",
            byte
        )));
    }
    core.establisher()
        .establish(stream, Side::Passive, ep.remote())
        .await
}

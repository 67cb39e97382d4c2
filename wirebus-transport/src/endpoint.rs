// Copyright @ 2025 - 2026, Wirebus Project
// All Rights Reserved

//! Endpoint records and the per-connection data pump.
//!
//! An [`Endpoint`] is the transport's bookkeeping for one TCP connection.
//! Once a connection authenticates, [`start_pump`] splits its stream into a
//! read task and a write task. The routing layer talks to the pump through
//! the [`RemoteEndpoint`] handle.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use crossbeam::atomic::AtomicCell;
use log::{debug, trace};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{BytesCodec, FramedRead};
use tokio_util::sync::CancellationToken;

use crate::auth::PeerIdentity;
use crate::state::{EndpointStates, Side};
use crate::TransportConfig;

/// Inbound frames buffered per endpoint before the reader backpressures.
const INCOMING_CHAN_SIZE: usize = 128;
/// Outbound frames queued per endpoint.
const OUTGOING_CHAN_SIZE: usize = 128;
/// Budget for a single outbound write before the pump gives up on the peer.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Wakeup delivered to the accept loop when a per-connection task finishes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ExitEvent {
    pub id: u64,
    pub kind: ExitKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExitKind {
    /// An authenticator task ended.
    Auth,
    /// A data pump ended.
    Pump,
}

/// Errors surfaced when queueing outbound data on an endpoint.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SendError {
    /// The outbound queue is full.
    #[error("send queue full")]
    Full,
    /// The pump is not running.
    #[error("endpoint closed")]
    Closed,
}

/// One TCP connection tracked by the transport, from admission to reaping.
pub(crate) struct Endpoint {
    id: u64,
    side: Side,
    remote: SocketAddr,
    spec: String,
    pub states: Mutex<EndpointStates>,
    /// True until a stop is locally requested. A pump that exits with this
    /// still set lost its peer without warning.
    sudden: AtomicBool,
    auth_cancel: CancellationToken,
    pump_cancel: CancellationToken,
    identity: OnceLock<PeerIdentity>,
    auth_task: AtomicCell<Option<JoinHandle<()>>>,
    pump_task: AtomicCell<Option<JoinHandle<()>>>,
    outgoing: OnceLock<mpsc::Sender<Bytes>>,
    incoming: AtomicCell<Option<mpsc::Receiver<Bytes>>>,
}

impl Endpoint {
    /// An endpoint for a connection accepted from `remote`.
    pub fn new_passive(id: u64, remote: SocketAddr, shutdown: CancellationToken) -> Self {
        let spec = format!("tcp:addr={},port={}", remote.ip(), remote.port());
        Self::new(id, Side::Passive, remote, spec, shutdown)
    }

    /// An endpoint for a connection we are initiating.
    pub fn new_active(
        id: u64,
        remote: SocketAddr,
        spec: String,
        shutdown: CancellationToken,
    ) -> Self {
        Self::new(id, Side::Active, remote, spec, shutdown)
    }

    fn new(
        id: u64,
        side: Side,
        remote: SocketAddr,
        spec: String,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id,
            side,
            remote,
            spec,
            states: Mutex::new(EndpointStates::new(side)),
            sudden: AtomicBool::new(true),
            auth_cancel: shutdown.child_token(),
            pump_cancel: shutdown.child_token(),
            identity: OnceLock::new(),
            auth_task: AtomicCell::new(None),
            pump_task: AtomicCell::new(None),
            outgoing: OnceLock::new(),
            incoming: AtomicCell::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn spec(&self) -> &str {
        &self.spec
    }

    pub fn auth_token(&self) -> CancellationToken {
        self.auth_cancel.clone()
    }

    pub fn pump_token(&self) -> CancellationToken {
        self.pump_cancel.clone()
    }

    /// Cancel the authenticator. A handshake that already succeeded is
    /// unaffected, its promotion proceeds.
    pub fn cancel_auth(&self) {
        self.auth_cancel.cancel();
    }

    /// Ask the pump to stop on local initiative.
    pub fn stop_requested(&self) {
        self.sudden.store(false, Ordering::SeqCst);
        self.pump_cancel.cancel();
    }

    pub fn is_sudden(&self) -> bool {
        self.sudden.load(Ordering::SeqCst)
    }

    pub fn set_identity(&self, identity: PeerIdentity) {
        let _ = self.identity.set(identity);
    }

    pub fn identity(&self) -> Option<&PeerIdentity> {
        self.identity.get()
    }

    pub fn store_auth_task(&self, task: JoinHandle<()>) {
        self.auth_task.store(Some(task));
    }

    pub fn take_auth_task(&self) -> Option<JoinHandle<()>> {
        self.auth_task.take()
    }

    pub fn take_pump_task(&self) -> Option<JoinHandle<()>> {
        self.pump_task.take()
    }
}

/// Split the authenticated stream and start the pump tasks. The caller owns
/// the surrounding state transitions.
pub(crate) fn start_pump(
    ep: &Arc<Endpoint>,
    stream: TcpStream,
    exit_tx: mpsc::Sender<ExitEvent>,
    config: &TransportConfig,
) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let (read_half, write_half) = stream.into_split();

    let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_CHAN_SIZE);
    let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_CHAN_SIZE);
    ep.incoming.store(Some(incoming_rx));
    let _ = ep.outgoing.set(outgoing_tx);

    // A dead peer gets the idle window plus one probe round before the
    // reader declares it gone.
    let idle_budget = config.idle_timeout + config.probe_timeout * config.probes;

    let reader = tokio::spawn(read_pump(
        ep.clone(),
        read_half,
        incoming_tx,
        idle_budget,
    ));
    let writer = tokio::spawn(write_pump(ep.clone(), write_half, outgoing_rx));

    let supervised = ep.clone();
    let supervisor = tokio::spawn(async move {
        supervise(&supervised, reader, writer).await;
        trace!("endpoint {}: pump finished", supervised.id());
        let _ = exit_tx
            .send(ExitEvent {
                id: supervised.id(),
                kind: ExitKind::Pump,
            })
            .await;
    });
    ep.pump_task.store(Some(supervisor));
    Ok(())
}

/// Either half ending takes the other one down with it.
async fn supervise(ep: &Arc<Endpoint>, mut reader: JoinHandle<()>, mut writer: JoinHandle<()>) {
    tokio::select! {
        _ = &mut reader => {
            ep.pump_cancel.cancel();
            let _ = (&mut writer).await;
        }
        _ = &mut writer => {
            ep.pump_cancel.cancel();
            let _ = (&mut reader).await;
        }
    }
}

async fn read_pump(
    ep: Arc<Endpoint>,
    read_half: OwnedReadHalf,
    incoming: mpsc::Sender<Bytes>,
    idle_budget: Duration,
) {
    let cancel = ep.pump_token();
    let mut frames = FramedRead::new(read_half, BytesCodec::new());
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            result = tokio::time::timeout(idle_budget, frames.next()) => match result {
                Err(_) => {
                    debug!(
                        "endpoint {}: no traffic from {} within {:?}",
                        ep.id(),
                        ep.remote(),
                        idle_budget
                    );
                    break;
                }
                Ok(None) => {
                    trace!("endpoint {}: remote {} closed", ep.id(), ep.remote());
                    break;
                }
                Ok(Some(Err(err))) => {
                    debug!("endpoint {}: read failed: {}", ep.id(), err);
                    break;
                }
                Ok(Some(Ok(frame))) => frame.freeze(),
            },
        };
        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = incoming.send(frame) => {
                if sent.is_err() {
                    // The local consumer dropped the stream, not the remote.
                    ep.sudden.store(false, Ordering::SeqCst);
                    break;
                }
            }
        }
    }
}

async fn write_pump(
    ep: Arc<Endpoint>,
    mut write_half: OwnedWriteHalf,
    mut outgoing: mpsc::Receiver<Bytes>,
) {
    let cancel = ep.pump_token();
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            maybe = outgoing.recv() => match maybe {
                Some(frame) => frame,
                None => break,
            },
        };
        match tokio::time::timeout(SEND_TIMEOUT, write_half.write_all(&frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!("endpoint {}: write failed: {}", ep.id(), err);
                break;
            }
            Err(_) => {
                debug!(
                    "endpoint {}: write to {} stalled for {:?}",
                    ep.id(),
                    ep.remote(),
                    SEND_TIMEOUT
                );
                break;
            }
        }
    }
}

/// Shareable handle to a promoted endpoint, handed to the routing layer.
#[derive(Clone)]
pub struct RemoteEndpoint {
    inner: Arc<Endpoint>,
}

impl RemoteEndpoint {
    pub(crate) fn new(inner: Arc<Endpoint>) -> Self {
        Self { inner }
    }

    /// Transport-unique endpoint id.
    pub fn id(&self) -> u64 {
        self.inner.id()
    }

    /// Which side of the connection we are.
    pub fn side(&self) -> Side {
        self.inner.side()
    }

    /// Address of the remote peer.
    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote()
    }

    /// Canonical connect spec of the remote peer.
    pub fn connect_spec(&self) -> &str {
        self.inner.spec()
    }

    /// Identity the handshake established.
    pub fn identity(&self) -> Option<&PeerIdentity> {
        self.inner.identity()
    }

    /// Queue an outbound frame without waiting.
    pub fn send(&self, frame: Bytes) -> Result<(), SendError> {
        let Some(outgoing) = self.inner.outgoing.get() else {
            return Err(SendError::Closed);
        };
        outgoing.try_send(frame).map_err(|err| match err {
            TrySendError::Full(_) => SendError::Full,
            TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Take the inbound frame stream. Only the first caller gets it.
    pub fn take_incoming(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.inner.incoming.take()
    }

    /// Ask the pump to stop. The exit is reported as requested, not sudden.
    pub fn stop(&self) {
        self.inner.stop_requested();
    }

    /// Tell the transport the routing layer attached a session, which stops
    /// the session setup timer.
    pub fn set_session_routed(&self) {
        crate::lock(&self.inner.states).session_routed = true;
    }
}

impl fmt::Debug for RemoteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteEndpoint")
            .field("id", &self.inner.id())
            .field("side", &self.inner.side())
            .field("remote", &self.inner.remote())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{AuthState, EpState};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::time::{timeout, Duration};

    async fn pumped_pair(
        config: &TransportConfig,
        exit_tx: mpsc::Sender<ExitEvent>,
    ) -> (Arc<Endpoint>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();

        let ep = Arc::new(Endpoint::new_passive(7, peer, CancellationToken::new()));
        {
            let mut st = crate::lock(&ep.states);
            st.set_auth(AuthState::Authenticating);
            st.set_auth(AuthState::Succeeded);
            st.promote();
            st.set_ep(EpState::Starting);
        }
        start_pump(&ep, server, exit_tx, config).unwrap();
        crate::lock(&ep.states).set_ep(EpState::Started);
        (ep, client)
    }

    #[tokio::test]
    async fn pump_moves_frames_both_ways() {
        let (exit_tx, mut exit_rx) = mpsc::channel(4);
        let (ep, mut client) = pumped_pair(&TransportConfig::default(), exit_tx).await;
        let remote = RemoteEndpoint::new(ep.clone());
        let mut incoming = remote.take_incoming().unwrap();
        assert!(remote.take_incoming().is_none());

        client.write_all(b"hello").await.unwrap();
        let frame = timeout(Duration::from_secs(5), incoming.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&frame[..], b"hello");

        remote.send(Bytes::from_static(b"world")).unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        // Remote closing ends the pump and is reported as sudden.
        drop(client);
        let event = timeout(Duration::from_secs(5), exit_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, ExitKind::Pump);
        assert_eq!(event.id, ep.id());
        assert!(ep.is_sudden());
    }

    #[tokio::test]
    async fn silent_peer_exhausts_the_idle_budget() {
        let config = TransportConfig {
            idle_timeout: Duration::from_millis(100),
            probe_timeout: Duration::from_millis(50),
            probes: 1,
            ..TransportConfig::default()
        };
        let (exit_tx, mut exit_rx) = mpsc::channel(4);
        let (ep, _client) = pumped_pair(&config, exit_tx).await;

        let event = timeout(Duration::from_secs(5), exit_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, ExitKind::Pump);
        assert!(ep.is_sudden());
    }

    #[tokio::test]
    async fn requested_stop_is_not_sudden() {
        let (exit_tx, mut exit_rx) = mpsc::channel(4);
        let (ep, mut client) = pumped_pair(&TransportConfig::default(), exit_tx).await;
        let remote = RemoteEndpoint::new(ep.clone());

        remote.stop();
        let event = timeout(Duration::from_secs(5), exit_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, ExitKind::Pump);
        assert!(!ep.is_sudden());

        // The socket is gone from the peer's point of view.
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);

        // And the handle no longer accepts frames.
        assert_eq!(
            remote.send(Bytes::from_static(b"late")),
            Err(SendError::Closed)
        );
    }
}

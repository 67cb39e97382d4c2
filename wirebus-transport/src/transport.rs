// Copyright @ 2025 - 2026, Wirebus Project
// All Rights Reserved

//! The transport facade and the shared core it hands to its tasks.
//!
//! [`BusTransport`] owns the runtime and the lifecycle: `start` spawns the
//! accept loop and the discovery event pump, `stop` requests shutdown, and
//! `join` waits for both tasks to unwind. Everything those tasks share
//! lives in [`TransportCore`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::atomic::AtomicCell;
use dashmap::DashMap;
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::runtime::{self, Runtime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::acceptor;
use crate::auth::Establisher;
use crate::connect;
use crate::discovery::{Discovery, DiscoveryEvent};
use crate::endpoint::{self, Endpoint, ExitEvent, RemoteEndpoint};
use crate::error::{TransportError, TransportResult};
use crate::listen::ListenControl;
use crate::registry::EndpointRegistry;
use crate::router::Router;
use crate::spec::ConnectSpec;
use crate::state::EpState;
use crate::TransportConfig;

const EXIT_CHAN_SIZE: usize = 128;
const EVENT_CHAN_SIZE: usize = 128;
const RUNTIME_SHUTDOWN: Duration = Duration::from_secs(5);

/// State shared between the accept loop, the authenticators, the pumps and
/// the blocking entry points.
pub(crate) struct TransportCore {
    config: TransportConfig,
    registry: EndpointRegistry,
    open_listeners: Arc<DashMap<String, SocketAddr>>,
    listen: ListenControl,
    router: Arc<dyn Router>,
    establisher: Arc<dyn Establisher>,
    cancel: CancellationToken,
    stopping: Arc<AtomicBool>,
    exit_tx: mpsc::Sender<ExitEvent>,
    next_id: AtomicU64,
}

impl TransportCore {
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    pub fn open_listeners(&self) -> &DashMap<String, SocketAddr> {
        &self.open_listeners
    }

    pub fn listen(&self) -> &ListenControl {
        &self.listen
    }

    pub fn router(&self) -> &dyn Router {
        self.router.as_ref()
    }

    pub fn establisher(&self) -> &dyn Establisher {
        self.establisher.as_ref()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub fn exit_sender(&self) -> &mpsc::Sender<ExitEvent> {
        &self.exit_tx
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Promotion tail for a passively authenticated endpoint. Holds the state
    /// lock across the pump start so the exit handler cannot observe a pump
    /// death before the endpoint reaches Started.
    pub fn authenticated(&self, ep: &Arc<Endpoint>, stream: TcpStream) {
        if self.is_stopping() {
            debug!(
                "endpoint {}: authenticated during shutdown, dropping it",
                ep.id()
            );
            return;
        }

        let handle = RemoteEndpoint::new(ep.clone());
        let started = {
            let mut st = crate::lock(&ep.states);
            st.promote();
            st.set_ep(EpState::Starting);
            match endpoint::start_pump(ep, stream, self.exit_tx.clone(), &self.config) {
                Ok(()) => {
                    st.set_ep(EpState::Started);
                    true
                }
                Err(err) => {
                    warn!("endpoint {}: pump start failed: {}", ep.id(), err);
                    st.set_ep(EpState::Failed);
                    false
                }
            }
        };
        if started {
            self.router.register_endpoint(handle);
        }
    }
}

/// Connection transport for a routing node.
///
/// Construction wires in the name service, the router and the handshake
/// implementation. Nothing touches the network until `start`, and listen
/// sockets only open once an interface event and a presence request both
/// arrive.
pub struct BusTransport {
    config: TransportConfig,
    discovery: Arc<dyn Discovery>,
    router: Arc<dyn Router>,
    establisher: Arc<dyn Establisher>,
    runtime: Option<Runtime>,
    core: std::sync::OnceLock<Arc<TransportCore>>,
    events_tx: std::sync::OnceLock<mpsc::Sender<DiscoveryEvent>>,
    loop_task: AtomicCell<Option<JoinHandle<()>>>,
    events_task: AtomicCell<Option<JoinHandle<()>>>,
    stopping: Arc<AtomicBool>,
}

impl BusTransport {
    pub fn new(
        config: TransportConfig,
        discovery: Arc<dyn Discovery>,
        router: Arc<dyn Router>,
        establisher: Arc<dyn Establisher>,
    ) -> Self {
        let runtime = runtime::Builder::new_multi_thread()
            .thread_name("wirebus-transport")
            .enable_all()
            .build()
            .expect("`runtime::Builder` should be ok");

        Self {
            config: config.sanitize(),
            discovery,
            router,
            establisher,
            runtime: Some(runtime),
            core: std::sync::OnceLock::new(),
            events_tx: std::sync::OnceLock::new(),
            loop_task: AtomicCell::new(None),
            events_task: AtomicCell::new(None),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawn the accept loop and the discovery event pump. A transport
    /// starts at most once.
    pub fn start(&self) -> TransportResult<()> {
        if self.core.get().is_some() {
            return Err(TransportError::AlreadyStarted);
        }
        let Some(runtime) = self.runtime.as_ref() else {
            return Err(TransportError::NotStarted);
        };

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        // Every endpoint can have an authenticator exit and a pump exit in
        // flight; the loop must never be the one blocking their delivery.
        let (exit_tx, exit_rx) = mpsc::channel(EXIT_CHAN_SIZE.max(2 * self.config.max_conn));
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHAN_SIZE);
        let open_listeners = Arc::new(DashMap::new());

        let listen = ListenControl::new(
            self.config.clone(),
            self.discovery.clone(),
            cmd_tx,
            open_listeners.clone(),
            runtime.handle().clone(),
            self.stopping.clone(),
        );
        let core = Arc::new(TransportCore {
            config: self.config.clone(),
            registry: EndpointRegistry::new(),
            open_listeners,
            listen,
            router: self.router.clone(),
            establisher: self.establisher.clone(),
            cancel: CancellationToken::new(),
            stopping: self.stopping.clone(),
            exit_tx,
            next_id: AtomicU64::new(1),
        });
        if self.core.set(core.clone()).is_err() {
            return Err(TransportError::AlreadyStarted);
        }
        let _ = self.events_tx.set(events_tx);

        self.loop_task
            .store(Some(runtime.spawn(acceptor::run(core.clone(), cmd_rx, exit_rx))));
        self.events_task
            .store(Some(runtime.spawn(consume_events(core, events_rx))));
        info!("transport started");
        Ok(())
    }

    /// Request shutdown: refuse new work, cancel advertisements and
    /// discovery, and signal every task. `join` waits for the unwind.
    pub fn stop(&self) -> TransportResult<()> {
        let Some(core) = self.core.get() else {
            return Err(TransportError::NotStarted);
        };
        if self.stopping.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("transport stopping");
        core.listen().shutdown();
        core.cancel.cancel();
        Ok(())
    }

    /// Wait until the accept loop has drained every endpoint. Joining more
    /// than once is a no-op.
    pub fn join(&self) -> TransportResult<()> {
        if self.core.get().is_none() {
            return Err(TransportError::NotStarted);
        }
        let Some(runtime) = self.runtime.as_ref() else {
            return Err(TransportError::NotStarted);
        };
        if let Some(task) = self.loop_task.take() {
            let _ = runtime.block_on(task);
        }
        if let Some(task) = self.events_task.take() {
            let _ = runtime.block_on(task);
        }
        Ok(())
    }

    /// Dial, authenticate and start up an outbound connection, returning the
    /// routable endpoint. Blocks the calling thread, which must not be one
    /// of the transport's own worker threads.
    pub fn connect(&self, spec: &str) -> TransportResult<RemoteEndpoint> {
        let core = self.active_core()?.clone();
        let Some(runtime) = self.runtime.as_ref() else {
            return Err(TransportError::NotStarted);
        };
        runtime.block_on(connect::run(core, spec))
    }

    pub fn start_listen(&self, spec: &str) -> TransportResult<()> {
        self.active_core()?.listen().start_listen(spec)
    }

    pub fn stop_listen(&self, spec: &str) -> TransportResult<()> {
        self.active_core()?.listen().stop_listen(spec)
    }

    pub fn enable_advertisement(&self, name: &str, quiet: bool) -> TransportResult<()> {
        self.active_core()?.listen().enable_advertisement(name, quiet)
    }

    pub fn disable_advertisement(&self, name: &str) -> TransportResult<()> {
        self.active_core()?.listen().disable_advertisement(name)
    }

    pub fn enable_discovery(&self, prefix: &str) -> TransportResult<()> {
        self.active_core()?.listen().enable_discovery(prefix)
    }

    pub fn disable_discovery(&self, prefix: &str) -> TransportResult<()> {
        self.active_core()?.listen().disable_discovery(prefix)
    }

    /// The bus addresses currently reachable through this transport, derived
    /// from the listen requests and the interfaces reported so far.
    pub fn listen_addresses(&self) -> TransportResult<Vec<String>> {
        Ok(self.active_core()?.listen().listen_addresses())
    }

    /// Where the name service delivers its callbacks. Interface events feed
    /// the deferred listen machinery, found events reach the router.
    pub fn discovery_sender(&self) -> TransportResult<mpsc::Sender<DiscoveryEvent>> {
        self.events_tx
            .get()
            .cloned()
            .ok_or(TransportError::NotStarted)
    }

    fn active_core(&self) -> TransportResult<&Arc<TransportCore>> {
        let core = self.core.get().ok_or(TransportError::NotStarted)?;
        if self.stopping.load(Ordering::SeqCst) {
            return Err(TransportError::Stopping);
        }
        Ok(core)
    }
}

impl Drop for BusTransport {
    fn drop(&mut self) {
        let _ = self.stop();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(RUNTIME_SHUTDOWN);
        }
    }
}

async fn consume_events(core: Arc<TransportCore>, mut events_rx: mpsc::Receiver<DiscoveryEvent>) {
    let cancel = core.cancel_token();
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            maybe = events_rx.recv() => match maybe {
                Some(event) => event,
                None => break,
            },
        };
        match event {
            DiscoveryEvent::Network { interfaces } => {
                core.listen().handle_network_event(&interfaces);
            }
            DiscoveryEvent::Found {
                address,
                guid,
                names,
                ttl,
            } => forward_found(&core, &address, &guid, &names, ttl),
        }
    }
    debug!("discovery event pump stopped");
}

/// Re-render a found bus address into canonical connect form before the
/// router sees it. Malformed addresses are dropped here.
fn forward_found(core: &Arc<TransportCore>, address: &str, guid: &str, names: &[String], ttl: u32) {
    match ConnectSpec::parse(address) {
        Ok(spec) => core.router().found_names(&spec.canonical(), guid, names, ttl),
        Err(err) => warn!("dropping found callback for {}: {}", address, err),
    }
}

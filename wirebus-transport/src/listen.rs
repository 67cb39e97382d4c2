// Copyright @ 2025 - 2026, Wirebus Project
// All Rights Reserved

//! The listen state machine.
//!
//! Listen requests, advertisements and discovery requests all meet here,
//! under one lock. Sockets are never bound directly by a request: a request
//! only records what is wanted and asks the discovery subsystem to watch
//! the interface. The actual bind happens when a network event reports the
//! interface up, and only while something wants the daemon present on the
//! network. Advertisements and discoveries that arrive before any listener
//! is open queue up and are flushed when the first socket binds.
//!
//! Bound listeners are owned by the accept loop; this module only ships
//! them there with [`ListenerCmd::Add`] and asks for their removal with
//! [`ListenerCmd::Remove`].

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpSocket};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

use crate::discovery::Discovery;
use crate::error::{TransportError, TransportResult};
use crate::spec::{ConnectSpec, ListenKey, ListenSpec, IFACE_ANY};
use crate::TransportConfig;

/// Accept backlog for newly bound listen sockets.
const LISTEN_BACKLOG: u32 = 16;

/// Instructions shipped to the accept loop, which owns every listen socket.
pub(crate) enum ListenerCmd {
    /// A freshly bound listener to add to the accept set.
    Add {
        spec: String,
        listener: TcpListener,
    },
    /// Close the listener bound as `spec`. `done` fires once the socket has
    /// left the accept set.
    Remove {
        spec: String,
        done: Option<oneshot::Sender<()>>,
    },
}

#[derive(Debug, Clone)]
struct Advertisement {
    name: String,
    quiet: bool,
}

#[derive(Debug)]
struct IfaceRequest {
    port: u16,
    /// Address and port actually bound for this interface, if any.
    bound: Option<(Ipv4Addr, u16)>,
}

#[derive(Debug)]
struct AddrRequest {
    port: u16,
    bound_port: Option<u16>,
}

#[derive(Default)]
struct ListenState {
    /// Normalized specs listening has been requested for.
    specs: Vec<ListenSpec>,
    /// Names currently advertised through the discovery subsystem.
    advertising: Vec<Advertisement>,
    /// Advertisements waiting for the first listener to open.
    pending_adverts: Vec<Advertisement>,
    /// Prefixes currently searched through the discovery subsystem.
    discovering: Vec<String>,
    /// Discoveries waiting for the first listener to open.
    pending_discoveries: Vec<String>,
    /// At least one listen socket has been bound.
    listening: bool,
    /// Discovery traffic is enabled.
    ns_enabled: bool,
    /// The quiet routing-node advertisement has been placed.
    router_advertised: bool,
    wildcard_iface_done: bool,
    wildcard_addr_done: bool,
    /// Interface names listening was requested on, `*` included.
    requested_ifaces: HashMap<String, IfaceRequest>,
    /// Concrete addresses listening was requested on, `0.0.0.0` included.
    requested_addrs: HashMap<Ipv4Addr, AddrRequest>,
    /// Bound listen port per interface name, fed to the discovery subsystem.
    port_map: HashMap<String, u16>,
    /// Last reported address per interface.
    if_addrs: HashMap<String, Ipv4Addr>,
}

impl ListenState {
    fn ads_requested(&self) -> bool {
        !self.advertising.is_empty() || !self.pending_adverts.is_empty()
    }

    fn discs_requested(&self) -> bool {
        !self.discovering.is_empty() || !self.pending_discoveries.is_empty()
    }

    fn presence_requested(&self) -> bool {
        self.ads_requested() || self.discs_requested()
    }
}

/// Serialized front end for listen, advertisement and discovery requests.
pub(crate) struct ListenControl {
    state: Mutex<ListenState>,
    config: TransportConfig,
    discovery: Arc<dyn Discovery>,
    cmd_tx: mpsc::UnboundedSender<ListenerCmd>,
    /// Specs of sockets currently in the accept set, maintained by the
    /// accept loop, read here for self-connection checks.
    open_listeners: Arc<DashMap<String, SocketAddr>>,
    runtime: Handle,
    stopping: Arc<AtomicBool>,
}

impl ListenControl {
    pub fn new(
        config: TransportConfig,
        discovery: Arc<dyn Discovery>,
        cmd_tx: mpsc::UnboundedSender<ListenerCmd>,
        open_listeners: Arc<DashMap<String, SocketAddr>>,
        runtime: Handle,
        stopping: Arc<AtomicBool>,
    ) -> Self {
        Self {
            state: Mutex::new(ListenState::default()),
            config,
            discovery,
            cmd_tx,
            open_listeners,
            runtime,
            stopping,
        }
    }

    /// Record a listen request. The socket opens once the interface comes
    /// up and something requests network presence.
    pub fn start_listen(&self, text: &str) -> TransportResult<()> {
        let spec = ListenSpec::parse(text)?;
        let mut st = crate::lock(&self.state);
        self.check_consistency(&st);

        if st.specs.contains(&spec) {
            return Err(TransportError::already_listening(spec.canonical()));
        }
        info!("listen requested on {}", spec);
        st.specs.push(spec.clone());
        if st.presence_requested() || self.config.router_feature() {
            self.record_listen_request(&mut st, &spec);
        }

        self.check_consistency(&st);
        Ok(())
    }

    /// Drop a listen request and close its socket, waiting until the accept
    /// loop has let go of it. Stopping a spec that was never requested is a
    /// no-op.
    pub fn stop_listen(&self, text: &str) -> TransportResult<()> {
        let spec = ListenSpec::parse(text)?;
        let mut st = crate::lock(&self.state);
        self.check_consistency(&st);

        match st.specs.iter().position(|s| s == &spec) {
            Some(index) => {
                info!("stopping listen on {}", spec);
                st.specs.remove(index);
            }
            None => debug!("stop listen for unrequested spec {}", spec),
        }

        if st.specs.is_empty() && st.ads_requested() {
            warn!("no listen specs remain, cancelling all advertisements");
            let st = &mut *st;
            let ads: Vec<Advertisement> = st
                .advertising
                .drain(..)
                .chain(st.pending_adverts.drain(..))
                .collect();
            for ad in ads {
                self.discovery.cancel_advertise(&ad.name);
            }
        }

        let concrete = self.drop_listen_request(&mut st, &spec);
        self.check_consistency(&st);
        // The wait below parks this thread until the accept loop has let go
        // of the socket; it must not hold the listen lock meanwhile.
        drop(st);
        if let Some(concrete) = concrete {
            self.remove_listeners(vec![concrete], true);
        }
        Ok(())
    }

    /// Advertise a well-known name, opening the recorded listen sockets
    /// first if this is what makes the daemon want network presence.
    pub fn enable_advertisement(&self, name: &str, quiet: bool) -> TransportResult<()> {
        let mut st = crate::lock(&self.state);
        self.check_consistency(&st);
        self.enable_advertisement_locked(&mut st, name, quiet);
        self.check_consistency(&st);
        Ok(())
    }

    /// Withdraw a well-known name. Dropping the last reason for network
    /// presence tears the listen sockets back down.
    pub fn disable_advertisement(&self, name: &str) -> TransportResult<()> {
        let mut st = crate::lock(&self.state);
        self.check_consistency(&st);

        st.advertising.retain(|ad| ad.name != name);
        st.pending_adverts.retain(|ad| ad.name != name);
        self.discovery.cancel_advertise(name);

        if !st.presence_requested() && !self.config.router_feature() {
            let removals = self.teardown_listeners(&mut st);
            self.remove_listeners(removals, false);
        }

        self.check_consistency(&st);
        Ok(())
    }

    /// Start discovering names with the given prefix.
    pub fn enable_discovery(&self, prefix: &str) -> TransportResult<()> {
        let mut st = crate::lock(&self.state);
        self.check_consistency(&st);
        self.enable_discovery_locked(&mut st, prefix);
        self.check_consistency(&st);
        Ok(())
    }

    /// Stop discovering names with the given prefix.
    pub fn disable_discovery(&self, prefix: &str) -> TransportResult<()> {
        let mut st = crate::lock(&self.state);
        self.check_consistency(&st);

        st.discovering.retain(|p| p != prefix);
        st.pending_discoveries.retain(|p| p != prefix);
        if st.listening && st.ns_enabled && !st.port_map.is_empty() {
            self.discovery.cancel_find(prefix);
        }

        if !st.presence_requested() && !self.config.router_feature() {
            let removals = self.teardown_listeners(&mut st);
            self.remove_listeners(removals, false);
        }

        self.check_consistency(&st);
        Ok(())
    }

    /// React to interface state: bind deferred listen requests whose
    /// interface or address is now up, rebind ones whose address changed,
    /// and flush queued advertisements and discoveries once listening.
    pub fn handle_network_event(&self, interfaces: &HashMap<String, Ipv4Addr>) {
        let mut st = crate::lock(&self.state);
        self.check_consistency(&st);

        for (iface, addr) in interfaces {
            debug!("network event: {} is {}", iface, addr);
            st.if_addrs.insert(iface.clone(), *addr);
        }

        let mut opened: Vec<String> = Vec::new();
        let mut replaced: Vec<String> = Vec::new();

        for (iface, addr) in interfaces {
            // A wildcard interface request swallows every other request
            // with a single unspecified-address socket.
            if st.requested_ifaces.contains_key(IFACE_ANY) && !st.wildcard_iface_done {
                let port = st.requested_ifaces[IFACE_ANY].port;
                if let Some((listener, local)) = self.open_socket(Ipv4Addr::UNSPECIFIED, port) {
                    let spec = ConnectSpec::new(Ipv4Addr::UNSPECIFIED, local.port()).canonical();
                    st.requested_ifaces.retain(|name, _| name == IFACE_ANY);
                    st.requested_addrs.clear();
                    if let Some(request) = st.requested_ifaces.get_mut(IFACE_ANY) {
                        request.bound = Some((Ipv4Addr::UNSPECIFIED, local.port()));
                    }
                    st.port_map.insert(IFACE_ANY.to_string(), local.port());
                    st.wildcard_iface_done = true;
                    self.add_listener(spec.clone(), listener);
                    opened.push(spec);
                }
                break;
            }

            // Same for a wildcard address request.
            if st.requested_addrs.contains_key(&Ipv4Addr::UNSPECIFIED) && !st.wildcard_addr_done {
                let port = st.requested_addrs[&Ipv4Addr::UNSPECIFIED].port;
                if let Some((listener, local)) = self.open_socket(Ipv4Addr::UNSPECIFIED, port) {
                    let spec = ConnectSpec::new(Ipv4Addr::UNSPECIFIED, local.port()).canonical();
                    st.requested_addrs.retain(|a, _| a.is_unspecified());
                    st.requested_ifaces.clear();
                    if let Some(request) = st.requested_addrs.get_mut(&Ipv4Addr::UNSPECIFIED) {
                        request.bound_port = Some(local.port());
                    }
                    st.port_map.insert(IFACE_ANY.to_string(), local.port());
                    st.wildcard_addr_done = true;
                    self.add_listener(spec.clone(), listener);
                    opened.push(spec);
                }
                break;
            }

            if let Some(request) = st.requested_ifaces.get_mut(iface) {
                let changed = request
                    .bound
                    .map(|(bound_addr, _)| bound_addr != *addr)
                    .unwrap_or(true);
                if changed {
                    if let Some((old_addr, old_port)) = request.bound.take() {
                        debug!("{} moved from {} to {}", iface, old_addr, addr);
                        replaced.push(ConnectSpec::new(old_addr, old_port).canonical());
                    }
                    let port = request.port;
                    if let Some((listener, local)) = self.open_socket(*addr, port) {
                        let spec = ConnectSpec::new(*addr, local.port()).canonical();
                        request.bound = Some((*addr, local.port()));
                        st.port_map.insert(iface.clone(), local.port());
                        self.add_listener(spec.clone(), listener);
                        opened.push(spec);
                    }
                }
                continue;
            }

            if let Some(request) = st.requested_addrs.get_mut(addr) {
                if request.bound_port.is_none() {
                    let port = request.port;
                    if let Some((listener, local)) = self.open_socket(*addr, port) {
                        let spec = ConnectSpec::new(*addr, local.port()).canonical();
                        request.bound_port = Some(local.port());
                        st.port_map.insert(iface.clone(), local.port());
                        self.add_listener(spec.clone(), listener);
                        opened.push(spec);
                    }
                }
            }
        }

        if !opened.is_empty() {
            st.listening = true;
            self.discovery.enable(&st.port_map, true);
            st.ns_enabled = true;
            if self.config.router_feature() && !st.router_advertised {
                if let Some(name) = &self.config.router_name {
                    self.discovery.advertise(name, true);
                    st.router_advertised = true;
                }
            }
        }

        // Sockets opened with nobody wanting network presence anymore go
        // straight back down.
        if st.listening && !st.presence_requested() && !self.config.router_feature() {
            replaced.extend(self.teardown_listeners(&mut st));
        }
        self.remove_listeners(replaced, false);

        if st.listening {
            let pending_ads: Vec<Advertisement> = st.pending_adverts.drain(..).collect();
            for ad in pending_ads {
                self.enable_advertisement_locked(&mut st, &ad.name, ad.quiet);
            }
            let pending_discs: Vec<String> = st.pending_discoveries.drain(..).collect();
            for prefix in pending_discs {
                self.enable_discovery_locked(&mut st, &prefix);
            }
        }

        self.check_consistency(&st);
    }

    /// Connect specs a remote peer could currently reach us on.
    pub fn listen_addresses(&self) -> Vec<String> {
        let st = crate::lock(&self.state);
        let mut out = Vec::new();
        if !st.listening {
            return out;
        }
        for (iface, addr) in &st.if_addrs {
            let requested = st.requested_ifaces.contains_key(IFACE_ANY)
                || st.requested_ifaces.contains_key(iface);
            if !requested {
                continue;
            }
            let port = st
                .port_map
                .get(iface)
                .or_else(|| st.port_map.get(IFACE_ANY));
            if let Some(port) = port {
                out.push(ConnectSpec::new(*addr, *port).canonical());
            }
        }
        for (addr, request) in &st.requested_addrs {
            if let Some(port) = request.bound_port {
                if addr.is_unspecified() {
                    for known in st.if_addrs.values() {
                        out.push(ConnectSpec::new(*known, port).canonical());
                    }
                } else {
                    out.push(ConnectSpec::new(*addr, port).canonical());
                }
            }
        }
        out.sort();
        out.dedup();
        out
    }

    /// Refuse a connect spec that lands on one of our own listeners, either
    /// exactly or through an unspecified-address socket on the same port.
    pub fn check_self_connection(&self, spec: &ConnectSpec) -> TransportResult<()> {
        let normalized = spec.canonical();
        if self.open_listeners.contains_key(&normalized) {
            return Err(TransportError::self_connection(normalized));
        }
        let anyspec = ConnectSpec::new(Ipv4Addr::UNSPECIFIED, spec.port).canonical();
        if self.open_listeners.contains_key(&anyspec) {
            let st = crate::lock(&self.state);
            if st.if_addrs.values().any(|addr| *addr == spec.addr) {
                return Err(TransportError::self_connection(normalized));
            }
        }
        Ok(())
    }

    /// Withdraw everything from the discovery subsystem on transport stop.
    /// Sockets are closed by the accept loop as it exits.
    pub fn shutdown(&self) {
        let mut st = crate::lock(&self.state);
        let st = &mut *st;

        let ads: Vec<Advertisement> = st
            .advertising
            .drain(..)
            .chain(st.pending_adverts.drain(..))
            .collect();
        for ad in ads {
            self.discovery.cancel_advertise(&ad.name);
        }
        let finds: Vec<String> = st
            .discovering
            .drain(..)
            .chain(st.pending_discoveries.drain(..))
            .collect();
        for prefix in finds {
            self.discovery.cancel_find(&prefix);
        }
        if st.ns_enabled {
            self.discovery.enable(&st.port_map, false);
            st.ns_enabled = false;
        }

        st.requested_ifaces.clear();
        st.requested_addrs.clear();
        st.port_map.clear();
        st.wildcard_iface_done = false;
        st.wildcard_addr_done = false;
        st.router_advertised = false;
        st.listening = false;
    }

    fn enable_advertisement_locked(&self, st: &mut ListenState, name: &str, quiet: bool) {
        if !st.ads_requested() && !st.listening {
            let specs = st.specs.clone();
            for spec in &specs {
                self.record_listen_request(st, spec);
            }
        }
        if st.listening && !st.ns_enabled {
            self.discovery.enable(&st.port_map, true);
            st.ns_enabled = true;
        }
        if !st.listening {
            debug!("advertisement {} queued until a listener opens", name);
            match st.pending_adverts.iter_mut().find(|ad| ad.name == name) {
                Some(ad) => ad.quiet = quiet,
                None => st.pending_adverts.push(Advertisement {
                    name: name.to_string(),
                    quiet,
                }),
            }
            return;
        }
        self.discovery.advertise(name, quiet);
        match st.advertising.iter_mut().find(|ad| ad.name == name) {
            Some(ad) => ad.quiet = quiet,
            None => st.advertising.push(Advertisement {
                name: name.to_string(),
                quiet,
            }),
        }
    }

    fn enable_discovery_locked(&self, st: &mut ListenState, prefix: &str) {
        if !st.discs_requested() && !st.listening {
            let specs = st.specs.clone();
            for spec in &specs {
                self.record_listen_request(st, spec);
            }
        }
        if st.listening && !st.ns_enabled {
            self.discovery.enable(&st.port_map, true);
            st.ns_enabled = true;
        }
        if !st.listening {
            debug!("discovery of {} queued until a listener opens", prefix);
            if !st.pending_discoveries.iter().any(|p| p == prefix) {
                st.pending_discoveries.push(prefix.to_string());
            }
            return;
        }
        self.discovery.find(prefix);
        if !st.discovering.iter().any(|p| p == prefix) {
            st.discovering.push(prefix.to_string());
        }
    }

    /// The deferred half of a listen request: remember what to bind when
    /// the interface comes up, and start watching it.
    fn record_listen_request(&self, st: &mut ListenState, spec: &ListenSpec) {
        match &spec.key {
            ListenKey::Iface(iface) => {
                st.requested_ifaces.insert(
                    iface.clone(),
                    IfaceRequest {
                        port: spec.port,
                        bound: None,
                    },
                );
                st.port_map.insert(iface.clone(), spec.port);
            }
            ListenKey::Addr(addr) => {
                st.requested_addrs.insert(
                    *addr,
                    AddrRequest {
                        port: spec.port,
                        bound_port: None,
                    },
                );
            }
        }
        self.discovery.open_interface(&spec.key);
    }

    /// Forget a listen request, returning the concrete spec of its bound
    /// socket if one is open.
    fn drop_listen_request(&self, st: &mut ListenState, spec: &ListenSpec) -> Option<String> {
        match &spec.key {
            ListenKey::Iface(iface) => {
                if spec.is_wildcard() {
                    st.wildcard_iface_done = false;
                }
                st.requested_ifaces
                    .remove(iface)
                    .and_then(|request| request.bound)
                    .map(|(addr, port)| ConnectSpec::new(addr, port).canonical())
            }
            ListenKey::Addr(addr) => {
                if spec.is_wildcard() {
                    st.wildcard_addr_done = false;
                }
                st.requested_addrs
                    .remove(addr)
                    .and_then(|request| request.bound_port)
                    .map(|port| ConnectSpec::new(*addr, port).canonical())
            }
        }
    }

    /// Disable discovery and drop every bound socket and the bookkeeping
    /// behind it. Returns the concrete specs to remove from the accept set.
    /// The recorded listen specs survive for the next presence request.
    fn teardown_listeners(&self, st: &mut ListenState) -> Vec<String> {
        debug!("nothing wants network presence, closing listeners");
        if st.ns_enabled {
            self.discovery.enable(&st.port_map, false);
            st.ns_enabled = false;
        }
        let mut removals = Vec::new();
        for (_, request) in st.requested_ifaces.drain() {
            if let Some((addr, port)) = request.bound {
                removals.push(ConnectSpec::new(addr, port).canonical());
            }
        }
        for (addr, request) in st.requested_addrs.drain() {
            if let Some(port) = request.bound_port {
                removals.push(ConnectSpec::new(addr, port).canonical());
            }
        }
        st.port_map.clear();
        st.pending_adverts.clear();
        st.pending_discoveries.clear();
        st.wildcard_iface_done = false;
        st.wildcard_addr_done = false;
        st.router_advertised = false;
        st.listening = false;
        removals
    }

    fn add_listener(&self, spec: String, listener: TcpListener) {
        let _ = self.cmd_tx.send(ListenerCmd::Add { spec, listener });
    }

    fn remove_listeners(&self, removals: Vec<String>, wait: bool) {
        for spec in removals {
            if wait {
                let (done_tx, done_rx) = oneshot::channel();
                let cmd = ListenerCmd::Remove {
                    spec,
                    done: Some(done_tx),
                };
                if self.cmd_tx.send(cmd).is_ok() {
                    let _ = done_rx.blocking_recv();
                }
            } else {
                let _ = self.cmd_tx.send(ListenerCmd::Remove { spec, done: None });
            }
        }
    }

    /// Bind and listen inside the runtime context. A request for port zero
    /// tries the configured default port first so that well-known-port
    /// deployments stay reachable, and falls back to an ephemeral port.
    fn open_socket(&self, addr: Ipv4Addr, port: u16) -> Option<(TcpListener, SocketAddr)> {
        let _guard = self.runtime.enter();
        let requested = SocketAddr::from((addr, port));
        let result = if port == 0 {
            let preferred = SocketAddr::from((addr, self.config.default_port));
            bind_listener(preferred).or_else(|err| {
                debug!(
                    "listen on preferred port {} failed ({}), trying an ephemeral port",
                    self.config.default_port, err
                );
                bind_listener(requested)
            })
        } else {
            bind_listener(requested)
        };
        match result {
            Ok((listener, local)) => {
                info!("listening on {}", local);
                Some((listener, local))
            }
            Err(err) => {
                warn!("failed to listen on {}: {}", requested, err);
                None
            }
        }
    }

    fn check_consistency(&self, st: &ListenState) {
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }
        debug_assert!(
            st.listening
                || (st.advertising.is_empty() && st.discovering.is_empty() && !st.ns_enabled)
        );
        debug_assert!(!st.ns_enabled || (st.listening && !st.port_map.is_empty()));
        debug_assert!(st.advertising.is_empty() || st.ns_enabled);
        debug_assert!(st.discovering.is_empty() || st.ns_enabled);
    }
}

fn bind_listener(addr: SocketAddr) -> io::Result<(TcpListener, SocketAddr)> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    let listener = socket.listen(LISTEN_BACKLOG)?;
    let local = listener.local_addr()?;
    Ok((listener, local))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::runtime::Runtime;

    #[derive(Debug, Clone, PartialEq)]
    enum NsCall {
        OpenInterface(String),
        Enable(bool),
        Advertise(String, bool),
        CancelAdvertise(String),
        Find(String),
        CancelFind(String),
    }

    #[derive(Default)]
    struct RecordingDiscovery {
        calls: StdMutex<Vec<NsCall>>,
    }

    impl RecordingDiscovery {
        fn calls(&self) -> Vec<NsCall> {
            self.calls.lock().unwrap().clone()
        }

        fn clear(&self) {
            self.calls.lock().unwrap().clear();
        }

        fn push(&self, call: NsCall) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl Discovery for RecordingDiscovery {
        fn open_interface(&self, key: &ListenKey) {
            let name = match key {
                ListenKey::Iface(iface) => iface.clone(),
                ListenKey::Addr(addr) => addr.to_string(),
            };
            self.push(NsCall::OpenInterface(name));
        }

        fn enable(&self, _port_map: &HashMap<String, u16>, enabled: bool) {
            self.push(NsCall::Enable(enabled));
        }

        fn advertise(&self, name: &str, quiet: bool) {
            self.push(NsCall::Advertise(name.to_string(), quiet));
        }

        fn cancel_advertise(&self, name: &str) {
            self.push(NsCall::CancelAdvertise(name.to_string()));
        }

        fn find(&self, prefix: &str) {
            self.push(NsCall::Find(prefix.to_string()));
        }

        fn cancel_find(&self, prefix: &str) {
            self.push(NsCall::CancelFind(prefix.to_string()));
        }
    }

    struct TestBed {
        control: ListenControl,
        discovery: Arc<RecordingDiscovery>,
        mirror: Arc<DashMap<String, SocketAddr>>,
        opened: Arc<StdMutex<Vec<(String, SocketAddr)>>>,
        _rt: Runtime,
    }

    /// Builds a control wired to a stand-in for the accept loop: a thread
    /// that owns shipped listeners, mirrors them, and acks removals.
    fn testbed(config: TransportConfig) -> TestBed {
        let rt = Runtime::new().unwrap();
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        let mirror: Arc<DashMap<String, SocketAddr>> = Arc::new(DashMap::new());
        let opened: Arc<StdMutex<Vec<(String, SocketAddr)>>> =
            Arc::new(StdMutex::new(Vec::new()));
        let discovery = Arc::new(RecordingDiscovery::default());

        let loop_mirror = mirror.clone();
        let loop_opened = opened.clone();
        std::thread::spawn(move || {
            let mut held: Vec<(String, TcpListener)> = Vec::new();
            while let Some(cmd) = cmd_rx.blocking_recv() {
                match cmd {
                    ListenerCmd::Add { spec, listener } => {
                        let local = listener.local_addr().unwrap();
                        loop_mirror.insert(spec.clone(), local);
                        loop_opened.lock().unwrap().push((spec.clone(), local));
                        held.push((spec, listener));
                    }
                    ListenerCmd::Remove { spec, done } => {
                        held.retain(|(s, _)| s != &spec);
                        loop_mirror.remove(&spec);
                        if let Some(done) = done {
                            let _ = done.send(());
                        }
                    }
                }
            }
        });

        let control = ListenControl::new(
            config.sanitize(),
            discovery.clone(),
            cmd_tx,
            mirror.clone(),
            rt.handle().clone(),
            Arc::new(AtomicBool::new(false)),
        );
        TestBed {
            control,
            discovery,
            mirror,
            opened,
            _rt: rt,
        }
    }

    fn event(pairs: &[(&str, &str)]) -> HashMap<String, Ipv4Addr> {
        pairs
            .iter()
            .map(|(iface, addr)| (iface.to_string(), addr.parse().unwrap()))
            .collect()
    }

    fn settle() {
        std::thread::sleep(std::time::Duration::from_millis(100));
    }

    fn opened_specs(bed: &TestBed) -> Vec<String> {
        bed.opened
            .lock()
            .unwrap()
            .iter()
            .map(|(spec, _)| spec.clone())
            .collect()
    }

    #[test]
    fn listen_defers_until_advertised_and_interface_up() {
        let bed = testbed(TransportConfig::default());
        bed.control
            .start_listen("tcp:addr=0.0.0.0,port=9955")
            .unwrap();
        assert!(matches!(
            bed.control.start_listen("tcp:addr=0.0.0.0,port=9955"),
            Err(TransportError::AlreadyListening { .. })
        ));
        settle();
        assert!(opened_specs(&bed).is_empty());
        assert!(!bed
            .discovery
            .calls()
            .contains(&NsCall::OpenInterface("0.0.0.0".to_string())));

        bed.control
            .enable_advertisement("com.example.app", false)
            .unwrap();
        settle();
        assert!(bed
            .discovery
            .calls()
            .contains(&NsCall::OpenInterface("0.0.0.0".to_string())));
        assert!(opened_specs(&bed).is_empty());
        assert!(!bed
            .discovery
            .calls()
            .iter()
            .any(|call| matches!(call, NsCall::Advertise(..))));

        bed.control.handle_network_event(&event(&[("eth0", "10.1.2.3")]));
        settle();
        assert_eq!(
            opened_specs(&bed),
            vec!["tcp:addr=0.0.0.0,port=9955".to_string()]
        );
        assert!(bed.mirror.contains_key("tcp:addr=0.0.0.0,port=9955"));
        let calls = bed.discovery.calls();
        assert!(calls.contains(&NsCall::Enable(true)));
        assert!(calls.contains(&NsCall::Advertise("com.example.app".to_string(), false)));
    }

    #[test]
    fn later_advertisement_reuses_open_listener() {
        let bed = testbed(TransportConfig::default());
        bed.control
            .start_listen("tcp:addr=127.0.0.1,port=44111")
            .unwrap();
        bed.control.enable_advertisement("com.example.a", false).unwrap();
        bed.control.handle_network_event(&event(&[("lo", "127.0.0.1")]));
        settle();
        assert_eq!(opened_specs(&bed).len(), 1);

        bed.discovery.clear();
        bed.control.enable_advertisement("com.example.b", true).unwrap();
        settle();
        assert_eq!(opened_specs(&bed).len(), 1);
        assert_eq!(
            bed.discovery.calls(),
            vec![NsCall::Advertise("com.example.b".to_string(), true)]
        );
    }

    #[test]
    fn stop_listen_closes_the_socket_and_waits() {
        let bed = testbed(TransportConfig::default());
        bed.control
            .start_listen("tcp:addr=127.0.0.1,port=44122")
            .unwrap();
        bed.control.enable_advertisement("com.example.app", false).unwrap();
        bed.control.handle_network_event(&event(&[("lo", "127.0.0.1")]));
        settle();
        assert!(bed.mirror.contains_key("tcp:addr=127.0.0.1,port=44122"));

        bed.control
            .stop_listen("tcp:addr=127.0.0.1,port=44122")
            .unwrap();
        // stop_listen waits for the ack, so the mirror is already clean.
        assert!(bed.mirror.is_empty());
        assert!(bed
            .discovery
            .calls()
            .contains(&NsCall::CancelAdvertise("com.example.app".to_string())));

        // A second stop of the same spec is a no-op.
        bed.control
            .stop_listen("tcp:addr=127.0.0.1,port=44122")
            .unwrap();
    }

    #[test]
    fn last_presence_request_tears_listeners_down() {
        let bed = testbed(TransportConfig::default());
        bed.control
            .start_listen("tcp:addr=127.0.0.1,port=44133")
            .unwrap();
        bed.control.enable_advertisement("com.example.app", false).unwrap();
        bed.control.enable_discovery("com.example").unwrap();
        bed.control.handle_network_event(&event(&[("lo", "127.0.0.1")]));
        settle();
        assert!(bed.mirror.contains_key("tcp:addr=127.0.0.1,port=44133"));

        bed.control.disable_advertisement("com.example.app").unwrap();
        settle();
        // Discovery still wants the network, the socket stays.
        assert!(bed.mirror.contains_key("tcp:addr=127.0.0.1,port=44133"));

        bed.discovery.clear();
        bed.control.disable_discovery("com.example").unwrap();
        settle();
        assert!(bed.mirror.is_empty());
        let calls = bed.discovery.calls();
        assert!(calls.contains(&NsCall::CancelFind("com.example".to_string())));
        assert!(calls.contains(&NsCall::Enable(false)));

        // The listen spec survives the teardown and binds again on the
        // next presence request.
        bed.control.enable_advertisement("com.example.app", false).unwrap();
        bed.control.handle_network_event(&event(&[("lo", "127.0.0.1")]));
        settle();
        assert!(bed.mirror.contains_key("tcp:addr=127.0.0.1,port=44133"));
    }

    #[test]
    fn wildcard_interface_binds_one_socket() {
        let bed = testbed(TransportConfig::default());
        bed.control.start_listen("tcp:iface=*,port=44144").unwrap();
        bed.control.enable_discovery("com.example").unwrap();
        bed.control
            .handle_network_event(&event(&[("eth0", "127.0.0.1"), ("eth1", "127.0.0.2")]));
        settle();
        assert_eq!(
            opened_specs(&bed),
            vec!["tcp:addr=0.0.0.0,port=44144".to_string()]
        );

        bed.control.handle_network_event(&event(&[("eth2", "127.0.0.3")]));
        settle();
        assert_eq!(opened_specs(&bed).len(), 1);
    }

    #[test]
    fn interface_address_change_rebinds() {
        let config = TransportConfig {
            default_port: 44155,
            ..TransportConfig::default()
        };
        let bed = testbed(config);
        bed.control.start_listen("tcp:iface=dummy0,port=0").unwrap();
        bed.control.enable_discovery("com.example").unwrap();

        bed.control.handle_network_event(&event(&[("dummy0", "127.0.0.1")]));
        settle();
        // Port zero preferred the configured default port.
        assert!(bed.mirror.contains_key("tcp:addr=127.0.0.1,port=44155"));

        bed.control.handle_network_event(&event(&[("dummy0", "127.0.0.2")]));
        settle();
        assert!(!bed.mirror.contains_key("tcp:addr=127.0.0.1,port=44155"));
        assert!(bed.mirror.contains_key("tcp:addr=127.0.0.2,port=44155"));
    }

    #[test]
    fn listen_addresses_follow_interface_knowledge() {
        let bed = testbed(TransportConfig::default());
        bed.control.start_listen("tcp:iface=*,port=44166").unwrap();
        assert!(bed.control.listen_addresses().is_empty());

        bed.control.enable_discovery("com.example").unwrap();
        bed.control.handle_network_event(&event(&[("eth7", "127.0.0.1")]));
        settle();
        assert_eq!(
            bed.control.listen_addresses(),
            vec!["tcp:addr=127.0.0.1,port=44166".to_string()]
        );
    }

    #[test]
    fn self_connection_is_detected() {
        let bed = testbed(TransportConfig::default());
        bed.control
            .start_listen("tcp:addr=127.0.0.1,port=44177")
            .unwrap();
        bed.control.enable_discovery("com.example").unwrap();
        bed.control.handle_network_event(&event(&[("lo", "127.0.0.1")]));
        settle();

        let own = ConnectSpec::parse("tcp:addr=127.0.0.1,port=44177").unwrap();
        assert!(matches!(
            bed.control.check_self_connection(&own),
            Err(TransportError::SelfConnection { .. })
        ));
        let other_port = ConnectSpec::parse("tcp:addr=127.0.0.1,port=44178").unwrap();
        assert!(bed.control.check_self_connection(&other_port).is_ok());
    }

    #[test]
    fn wildcard_listener_blocks_connects_to_known_addresses() {
        let bed = testbed(TransportConfig::default());
        bed.control.start_listen("tcp:iface=*,port=44188").unwrap();
        bed.control.enable_discovery("com.example").unwrap();
        bed.control.handle_network_event(&event(&[("eth0", "127.0.0.1")]));
        settle();
        assert!(bed.mirror.contains_key("tcp:addr=0.0.0.0,port=44188"));

        let known = ConnectSpec::parse("tcp:addr=127.0.0.1,port=44188").unwrap();
        assert!(matches!(
            bed.control.check_self_connection(&known),
            Err(TransportError::SelfConnection { .. })
        ));
        let elsewhere = ConnectSpec::parse("tcp:addr=10.9.9.9,port=44188").unwrap();
        assert!(bed.control.check_self_connection(&elsewhere).is_ok());
    }
}

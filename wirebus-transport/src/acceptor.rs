// Copyright @ 2025 - 2026, Wirebus Project
// All Rights Reserved

//! The accept loop and the endpoint scavenger.
//!
//! One task owns every listen socket and the wait set around them. It
//! accepts connections, spawns their authenticators, and between wakeups
//! scavenges the endpoint registry: reaping failed authentications, lazily
//! joining finished authenticators, and collecting stopped pumps. Listener
//! changes arrive as [`ListenerCmd`]s, endpoint task completions as
//! [`ExitEvent`]s, and a coarse tick drives timeout enforcement when
//! nothing else wakes the loop.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, trace, warn};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_stream::{StreamExt, StreamMap};

use crate::auth;
use crate::endpoint::{Endpoint, ExitEvent, ExitKind, RemoteEndpoint};
use crate::listen::ListenerCmd;
use crate::state::{AuthState, EpState, Membership, Side};
use crate::transport::TransportCore;

/// How often the scavenger runs when nothing else wakes the loop.
const SCAVENGE_INTERVAL: Duration = Duration::from_millis(500);

pub(crate) async fn run(
    core: Arc<TransportCore>,
    mut cmd_rx: mpsc::UnboundedReceiver<ListenerCmd>,
    mut exit_rx: mpsc::Receiver<ExitEvent>,
) {
    let mut listeners: StreamMap<String, TcpListenerStream> = StreamMap::new();
    let mut tick = interval(SCAVENGE_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let cancel = core.cancel_token();

    info!("accept loop running");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(cmd) = cmd_rx.recv() => handle_cmd(&core, &mut listeners, cmd),
            Some(event) = exit_rx.recv() => handle_exit(&core, event),
            Some((spec, accepted)) = listeners.next(), if !listeners.is_empty() => {
                handle_accept(&core, &spec, accepted);
            }
            _ = tick.tick() => {}
        }
        scavenge(&core).await;
    }

    drain(&core, listeners, &mut cmd_rx, &mut exit_rx).await;
    info!("accept loop stopped");
}

fn handle_cmd(
    core: &Arc<TransportCore>,
    listeners: &mut StreamMap<String, TcpListenerStream>,
    cmd: ListenerCmd,
) {
    match cmd {
        ListenerCmd::Add { spec, listener } => match listener.local_addr() {
            Ok(local) => {
                debug!("accepting on {} as {}", local, spec);
                core.open_listeners().insert(spec.clone(), local);
                if listeners
                    .insert(spec.clone(), TcpListenerStream::new(listener))
                    .is_some()
                {
                    warn!("replaced an open listener for {}", spec);
                }
            }
            Err(err) => warn!("dropping listener for {}: {}", spec, err),
        },
        ListenerCmd::Remove { spec, done } => {
            if listeners.remove(&spec).is_some() {
                debug!("closed listener for {}", spec);
            }
            core.open_listeners().remove(&spec);
            if let Some(done) = done {
                let _ = done.send(());
            }
        }
    }
}

fn handle_exit(core: &Arc<TransportCore>, event: ExitEvent) {
    match event.kind {
        // The scavenge pass following this wakeup reaps the authenticator.
        ExitKind::Auth => {}
        ExitKind::Pump => {
            let Some(ep) = core.registry().get(event.id) else {
                return;
            };
            let sudden = ep.is_sudden() && !core.is_stopping();
            {
                let mut st = crate::lock(&ep.states);
                st.set_ep(EpState::Stopping);
                st.handed_over = true;
            }
            debug!(
                "endpoint {} pump exited{}",
                event.id,
                if sudden { " suddenly" } else { "" }
            );
            core.router().endpoint_exit(RemoteEndpoint::new(ep), sudden);
        }
    }
}

fn handle_accept(core: &Arc<TransportCore>, spec: &str, accepted: std::io::Result<TcpStream>) {
    let stream = match accepted {
        Ok(stream) => stream,
        Err(err) => {
            if is_acceptable_error(&err) {
                debug!("transient accept failure on {}: {}", spec, err);
            } else {
                warn!("accept failure on {}: {}", spec, err);
            }
            return;
        }
    };
    let remote = match stream.peer_addr() {
        Ok(remote) => remote,
        Err(err) => {
            debug!("accepted connection lost before peer_addr: {}", err);
            return;
        }
    };

    let ep = Arc::new(Endpoint::new_passive(
        core.next_id(),
        remote,
        core.cancel_token(),
    ));
    let config = core.config();
    match core
        .registry()
        .try_admit(ep.clone(), config.max_auth, config.max_conn)
    {
        Ok(()) => {
            trace!("accepted {} on {}, authenticating as {}", remote, spec, ep.id());
            auth::spawn(core.clone(), ep, stream);
        }
        Err(_) => {
            warn!("connection limit reached, refusing {}", remote);
            // Zero linger turns the close into an immediate reset.
            if let Err(err) = stream.set_linger(Some(Duration::ZERO)) {
                debug!("set_linger on refused connection: {}", err);
            }
        }
    }
}

/// Accept failures that concern one connection rather than the listen
/// socket itself. Anything else is logged loudly but the loop survives it
/// either way.
fn is_acceptable_error(err: &std::io::Error) -> bool {
    match err.raw_os_error() {
        Some(errno) => matches!(
            errno,
            libc::ECONNRESET
                | libc::ECONNABORTED
                | libc::EINTR
                | libc::EMFILE
                | libc::ENFILE
                | libc::ETIMEDOUT
                | libc::EAGAIN
        ),
        None => false,
    }
}

/// One pass over the registry applying the lifecycle rules in order.
async fn scavenge(core: &Arc<TransportCore>) {
    let mut failed_auths: Vec<Arc<Endpoint>> = Vec::new();
    let mut lazy_joins: Vec<Arc<Endpoint>> = Vec::new();
    let mut reap: Vec<Arc<Endpoint>> = Vec::new();

    for ep in core.registry().snapshot() {
        let mut st = crate::lock(&ep.states);
        // An active endpoint belongs to its creator until its pump exit
        // has been observed.
        if ep.side() == Side::Active && !st.handed_over {
            continue;
        }
        match st.membership {
            Membership::Authenticating => match st.auth {
                AuthState::Failed => {
                    drop(st);
                    core.registry().remove(ep.id());
                    debug!("endpoint {} failed authentication, reaping", ep.id());
                    failed_auths.push(ep);
                }
                AuthState::Initialized | AuthState::Authenticating => {
                    if st.age() > core.config().auth_timeout {
                        debug!("endpoint {}: authentication timed out", ep.id());
                        drop(st);
                        ep.cancel_auth();
                    }
                }
                // Promotion is under way, leave it alone.
                AuthState::Succeeded | AuthState::Done => {}
            },
            Membership::Active => {
                if st.auth == AuthState::Succeeded {
                    drop(st);
                    lazy_joins.push(ep);
                } else if st.ep == EpState::Started
                    && st.auth == AuthState::Done
                    && !st.session_routed
                    && ep.identity().map(|id| id.routing_node).unwrap_or(false)
                    && st.age() > core.config().session_setup_timeout
                {
                    warn!(
                        "endpoint {}: no session within {:?}, stopping it",
                        ep.id(),
                        core.config().session_setup_timeout
                    );
                    drop(st);
                    ep.stop_requested();
                } else if st.ep == EpState::Failed {
                    st.set_ep(EpState::Done);
                    drop(st);
                    core.registry().remove(ep.id());
                    reap.push(ep);
                } else if st.ep == EpState::Stopping {
                    drop(st);
                    core.registry().remove(ep.id());
                    reap.push(ep);
                }
            }
        }
    }

    // Joins happen outside the registry iteration and the state locks.
    for ep in failed_auths {
        if let Some(task) = ep.take_auth_task() {
            let _ = task.await;
        }
    }
    for ep in lazy_joins {
        if let Some(task) = ep.take_auth_task() {
            let _ = task.await;
        }
        crate::lock(&ep.states).set_auth(AuthState::Done);
    }
    for ep in reap {
        if let Some(task) = ep.take_auth_task() {
            let _ = task.await;
        }
        if let Some(task) = ep.take_pump_task() {
            let _ = task.await;
        }
        let mut st = crate::lock(&ep.states);
        if st.ep == EpState::Stopping {
            st.set_ep(EpState::Done);
        }
        debug!("endpoint {} reaped", ep.id());
    }
}

/// Shutdown path: close every listener, finish the authenticators first
/// since one may be mid-promotion, then stop and join every endpoint.
async fn drain(
    core: &Arc<TransportCore>,
    listeners: StreamMap<String, TcpListenerStream>,
    cmd_rx: &mut mpsc::UnboundedReceiver<ListenerCmd>,
    exit_rx: &mut mpsc::Receiver<ExitEvent>,
) {
    debug!("closing {} listeners", listeners.len());
    drop(listeners);
    core.open_listeners().clear();

    // Unblock anyone still talking to the loop.
    cmd_rx.close();
    exit_rx.close();
    while let Ok(cmd) = cmd_rx.try_recv() {
        if let ListenerCmd::Remove {
            done: Some(done), ..
        } = cmd
        {
            let _ = done.send(());
        }
    }
    while exit_rx.try_recv().is_ok() {}

    let snapshot = core.registry().snapshot();
    for ep in &snapshot {
        if crate::lock(&ep.states).membership == Membership::Authenticating {
            ep.cancel_auth();
        }
    }
    for ep in &snapshot {
        if crate::lock(&ep.states).membership == Membership::Authenticating {
            if let Some(task) = ep.take_auth_task() {
                let _ = task.await;
            }
        }
    }

    // Fresh snapshot: an authenticator above may have promoted its
    // endpoint while we were joining.
    for ep in core.registry().snapshot() {
        ep.cancel_auth();
        ep.stop_requested();
        if let Some(task) = ep.take_auth_task() {
            let _ = task.await;
        }
        let pump = ep.take_pump_task();
        let pump_ran = pump.is_some();
        if let Some(task) = pump {
            let _ = task.await;
        }
        core.registry().remove(ep.id());
        {
            let mut st = crate::lock(&ep.states);
            if st.auth == AuthState::Succeeded {
                st.set_auth(AuthState::Done);
            }
            match st.ep {
                EpState::Started => {
                    st.set_ep(EpState::Stopping);
                    st.set_ep(EpState::Done);
                }
                EpState::Stopping | EpState::Failed => st.set_ep(EpState::Done),
                _ => {}
            }
        }
        if pump_ran {
            core.router()
                .endpoint_exit(RemoteEndpoint::new(ep.clone()), false);
        }
        debug!("endpoint {} drained", ep.id());
    }
}

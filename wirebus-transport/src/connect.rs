//! The outbound connect path.
//!
//! Connecting runs the same lifecycle as an accepted connection, inline on
//! the caller instead of split across an authenticator task: admit against
//! the same limits, dial, send the framing byte, run the handshake, then
//! promote with the pump already started.

use std::net::SocketAddr;
use std::sync::Arc;

use log::debug;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::auth::NUL_BYTE;
use crate::endpoint::{self, Endpoint, RemoteEndpoint};
use crate::error::{TransportError, TransportResult};
use crate::spec::ConnectSpec;
use crate::state::{AuthState, EpState, Side};
use crate::transport::TransportCore;

pub(crate) async fn run(core: Arc<TransportCore>, text: &str) -> TransportResult<RemoteEndpoint> {
    if core.is_stopping() {
        return Err(TransportError::NotStarted);
    }
    let spec = ConnectSpec::parse(text)?;
    core.listen().check_self_connection(&spec)?;

    let remote = SocketAddr::from((spec.addr, spec.port));
    let ep = Arc::new(Endpoint::new_active(
        core.next_id(),
        remote,
        spec.canonical(),
        core.cancel_token(),
    ));
    let config = core.config();
    core.registry()
        .try_admit(ep.clone(), config.max_auth, config.max_conn)?;

    match establish(&core, &ep, remote).await {
        Ok(handle) => Ok(handle),
        Err(err) => {
            // A failed connect leaves nothing behind for the scavenger.
            {
                let mut st = crate::lock(&ep.states);
                if matches!(st.auth, AuthState::Initialized | AuthState::Authenticating) {
                    st.set_auth(AuthState::Failed);
                }
            }
            core.registry().remove(ep.id());
            debug!("connect to {} failed: {}", text, err);
            Err(err)
        }
    }
}

async fn establish(
    core: &Arc<TransportCore>,
    ep: &Arc<Endpoint>,
    remote: SocketAddr,
) -> TransportResult<RemoteEndpoint> {
    let cancel = ep.auth_token();
    crate::lock(&ep.states).set_auth(AuthState::Authenticating);

    let mut stream = tokio::select! {
        _ = cancel.cancelled() => return Err(TransportError::Stopping),
        result = tokio::time::timeout(core.config().dial_timeout, TcpStream::connect(remote)) => {
            match result {
                Err(_) => {
                    return Err(TransportError::connection_failed(format!(
                        "dial to {} timed out",
                        remote
                    )))
                }
                Ok(Err(err)) => return Err(TransportError::connection_failed(err.to_string())),
                Ok(Ok(stream)) => stream,
            }
        }
    };
    stream.set_nodelay(true)?;

    tokio::select! {
        _ = cancel.cancelled() => return Err(TransportError::Stopping),
        result = stream.write_u8(NUL_BYTE) => result?,
    }

    let identity = tokio::select! {
        _ = cancel.cancelled() => return Err(TransportError::Stopping),
        result = core.establisher().establish(&mut stream, Side::Active, remote) => result?,
    };
    ep.set_identity(identity);

    let handle = RemoteEndpoint::new(ep.clone());
    {
        let mut st = crate::lock(&ep.states);
        st.set_auth(AuthState::Succeeded);
        st.set_ep(EpState::Starting);
        match endpoint::start_pump(ep, stream, core.exit_sender().clone(), core.config()) {
            Ok(()) => {
                st.set_ep(EpState::Started);
                st.set_auth(AuthState::Done);
                st.promote();
            }
            Err(err) => {
                st.set_ep(EpState::Failed);
                return Err(err.into());
            }
        }
    }
    core.router().register_endpoint(handle.clone());
    Ok(handle)
}

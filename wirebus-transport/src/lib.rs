// Copyright @ 2025 - 2026, Wirebus Project
// All Rights Reserved

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use {
    auth::*, discovery::*, endpoint::*, error::*, router::*, spec::*, state::*, transport::*,
};

pub mod auth;
pub mod discovery;
pub mod endpoint;
pub mod error;
pub mod router;
pub mod spec;
pub mod state;
pub mod transport;

mod acceptor;
mod connect;
mod listen;
mod registry;

const IDLE_TIMEOUT_MIN: Duration = Duration::from_secs(3);
const IDLE_TIMEOUT_MAX: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Concurrent authentications allowed before new connections are
    /// refused at accept.
    pub max_auth: usize,
    /// Total connections, authenticating plus active.
    pub max_conn: usize,

    /// Budget for the whole authentication exchange.
    pub auth_timeout: Duration,
    /// How long a connection from another routing node may sit idle with no
    /// session routed through it.
    pub session_setup_timeout: Duration,

    /// Silence tolerated on an active connection before probing starts.
    pub idle_timeout: Duration,
    pub probe_timeout: Duration,
    pub probes: u32,

    pub dial_timeout: Duration,
    /// Preferred port when a listen spec asks for port zero.
    pub default_port: u16,

    /// Well-known name of this routing node, advertised quietly once a
    /// listener opens. Routing for others also needs `max_untrusted`.
    pub router_name: Option<String>,
    pub max_untrusted: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_auth: 10,
            max_conn: 50,
            auth_timeout: Duration::from_secs(20),
            session_setup_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(20),
            probe_timeout: Duration::from_secs(3),
            probes: 1,
            dial_timeout: Duration::from_secs(5),
            default_port: spec::PORT_DEFAULT,
            router_name: None,
            max_untrusted: 0,
        }
    }
}

impl TransportConfig {
    /// Clamp the liveness knobs into their supported ranges. Values outside
    /// them would let dead connections pin resources for too long, or churn
    /// healthy ones.
    pub fn sanitize(mut self) -> Self {
        self.idle_timeout = self.idle_timeout.clamp(IDLE_TIMEOUT_MIN, IDLE_TIMEOUT_MAX);
        self.probe_timeout = self.probe_timeout.min(PROBE_TIMEOUT_MAX);
        if self.default_port == 0 {
            self.default_port = spec::PORT_DEFAULT;
        }
        self
    }

    pub(crate) fn router_feature(&self) -> bool {
        self.router_name.is_some() && self.max_untrusted > 0
    }
}

/// Mutex lock that survives poisoning.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
#[ctor::ctor]
fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_clamps_liveness_knobs() {
        let config = TransportConfig {
            idle_timeout: Duration::from_millis(1),
            probe_timeout: Duration::from_secs(120),
            ..TransportConfig::default()
        }
        .sanitize();
        assert_eq!(config.idle_timeout, IDLE_TIMEOUT_MIN);
        assert_eq!(config.probe_timeout, PROBE_TIMEOUT_MAX);

        let config = TransportConfig {
            idle_timeout: Duration::from_secs(300),
            ..TransportConfig::default()
        }
        .sanitize();
        assert_eq!(config.idle_timeout, IDLE_TIMEOUT_MAX);
    }

    #[test]
    fn sanitize_fills_in_the_default_port() {
        let config = TransportConfig {
            default_port: 0,
            ..TransportConfig::default()
        }
        .sanitize();
        assert_eq!(config.default_port, spec::PORT_DEFAULT);
    }

    #[test]
    fn routing_for_others_needs_a_name_and_room() {
        let config = TransportConfig::default();
        assert!(!config.router_feature());

        let config = TransportConfig {
            router_name: Some("org.wirebus.router".into()),
            ..TransportConfig::default()
        };
        assert!(!config.router_feature());

        let config = TransportConfig {
            router_name: Some("org.wirebus.router".into()),
            max_untrusted: 16,
            ..TransportConfig::default()
        };
        assert!(config.router_feature());
    }
}

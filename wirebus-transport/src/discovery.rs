//! Contract between the transport and the name-service subsystem.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use crate::spec::ListenKey;

/// Requests the transport issues to the discovery subsystem.
///
/// Implementations are expected to be cheap and non-blocking; the transport
/// calls them while holding its listen lock.
pub trait Discovery: Send + Sync + 'static {
    /// Start watching the interface or address a listen spec names.
    /// Interface state changes come back as [`DiscoveryEvent::Network`].
    fn open_interface(&self, key: &ListenKey);

    /// Enable or disable discovery traffic. `port_map` carries the bound
    /// listen port per requested interface or address.
    fn enable(&self, port_map: &HashMap<String, u16>, enabled: bool);

    /// Advertise a well-known name. Quiet advertisements answer queries but
    /// are not broadcast unsolicited.
    fn advertise(&self, name: &str, quiet: bool);

    /// Withdraw a well-known name advertisement.
    fn cancel_advertise(&self, name: &str);

    /// Start looking for names with the given prefix.
    fn find(&self, prefix: &str);

    /// Stop looking for names with the given prefix.
    fn cancel_find(&self, prefix: &str);
}

/// Callbacks delivered by the discovery subsystem, fed to the transport
/// through the sender returned by
/// [`BusTransport::discovery_sender`](crate::BusTransport::discovery_sender).
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// A remote daemon advertised names at a bus address.
    Found {
        /// Bus address text, e.g. `tcp:guid=...,addr=10.0.0.5,port=9955`.
        address: String,
        /// GUID of the advertising daemon.
        guid: String,
        /// Advertised well-known names.
        names: Vec<String>,
        /// Seconds the advertisement stays valid, `0` when withdrawn.
        ttl: u32,
    },
    /// IPv4 interface state changed. The map carries the current address
    /// of each interface that came up.
    Network {
        /// Interface name to address.
        interfaces: HashMap<String, Ipv4Addr>,
    },
}

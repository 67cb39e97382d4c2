//! Parsing and normalization of textual listen and connect specs.
//!
//! A spec is a `tcp:` scheme followed by comma separated `key=value`
//! arguments, e.g. `tcp:addr=192.168.1.10,port=9955`. Normalization folds
//! legacy key aliases, strips arguments for address families this transport
//! does not carry, and fills in defaults, so that equal endpoints always
//! render to the same canonical string.

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;

use log::debug;

use crate::error::{TransportError, TransportResult};

/// Port used when a spec does not name one.
pub const PORT_DEFAULT: u16 = 9955;

/// Interface wildcard matching every network interface.
pub const IFACE_ANY: &str = "*";

const SCHEME: &str = "tcp:";

/// Legacy keys for address families this transport does not carry. They are
/// stripped during normalization.
const STRIPPED_KEYS: [&str; 6] = ["u4addr", "u4port", "r6addr", "r6port", "u6addr", "u6port"];

/// What a listen spec selects listeners by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListenKey {
    /// A named network interface, or `*` for all of them.
    Iface(String),
    /// A concrete IPv4 address, or `0.0.0.0` for all of them.
    Addr(Ipv4Addr),
}

/// A normalized listen spec.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenSpec {
    /// Interface or address selector.
    pub key: ListenKey,
    /// Requested port, `0` for an ephemeral port.
    pub port: u16,
}

impl ListenSpec {
    /// Parse and normalize a textual listen spec.
    pub fn parse(text: &str) -> TransportResult<Self> {
        let mut args = split_args(text)?;

        let iface = args.remove("iface");
        let addr = take_alias(&mut args, "addr", "r4addr");
        let port = take_alias(&mut args, "port", "r4port");

        for key in STRIPPED_KEYS {
            if args.remove(key).is_some() {
                debug!("spec {}: ignoring unsupported argument {}", text, key);
            }
        }
        args.remove("family");
        for key in args.keys() {
            debug!("spec {}: ignoring unrecognized argument {}", text, key);
        }

        let port = match port {
            Some(token) => token
                .parse::<u16>()
                .map_err(|_| TransportError::invalid_spec(format!("bad port in {}", text)))?,
            None => PORT_DEFAULT,
        };

        let key = match (iface, addr) {
            (Some(iface), addr) => {
                if iface.is_empty() {
                    return Err(TransportError::invalid_spec(format!(
                        "empty iface in {}",
                        text
                    )));
                }
                if addr.is_some() {
                    debug!("spec {}: iface takes precedence over addr", text);
                }
                ListenKey::Iface(iface.to_string())
            }
            (None, Some(addr)) => {
                let addr = addr.parse::<Ipv4Addr>().map_err(|_| {
                    TransportError::invalid_spec(format!("bad IPv4 address in {}", text))
                })?;
                ListenKey::Addr(addr)
            }
            (None, None) => ListenKey::Iface(IFACE_ANY.to_string()),
        };

        Ok(Self { key, port })
    }

    /// Build a spec selecting a concrete address.
    pub fn for_addr(addr: Ipv4Addr, port: u16) -> Self {
        Self {
            key: ListenKey::Addr(addr),
            port,
        }
    }

    /// Whether this spec selects every interface or address.
    pub fn is_wildcard(&self) -> bool {
        match &self.key {
            ListenKey::Iface(iface) => iface == IFACE_ANY,
            ListenKey::Addr(addr) => addr.is_unspecified(),
        }
    }

    /// Canonical textual rendering.
    pub fn canonical(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ListenSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            ListenKey::Iface(iface) => write!(f, "tcp:iface={},port={}", iface, self.port),
            ListenKey::Addr(addr) => write!(f, "tcp:addr={},port={}", addr, self.port),
        }
    }
}

/// A normalized connect spec. Unlike a listen spec it always names a
/// concrete remote address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectSpec {
    /// Remote IPv4 address.
    pub addr: Ipv4Addr,
    /// Remote port.
    pub port: u16,
}

impl ConnectSpec {
    /// Build a spec for a concrete remote.
    pub fn new(addr: Ipv4Addr, port: u16) -> Self {
        Self { addr, port }
    }

    /// Parse and normalize a textual connect spec.
    pub fn parse(text: &str) -> TransportResult<Self> {
        let listen = ListenSpec::parse(text)?;
        match listen.key {
            ListenKey::Addr(addr) if !addr.is_unspecified() => Ok(Self {
                addr,
                port: listen.port,
            }),
            _ => Err(TransportError::invalid_spec(format!(
                "connect spec requires a concrete addr: {}",
                text
            ))),
        }
    }

    /// Canonical textual rendering.
    pub fn canonical(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ConnectSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp:addr={},port={}", self.addr, self.port)
    }
}

fn split_args(text: &str) -> TransportResult<HashMap<&str, &str>> {
    let rest = text
        .strip_prefix(SCHEME)
        .ok_or_else(|| TransportError::invalid_spec(format!("expected tcp: scheme in {}", text)))?;

    let mut args = HashMap::new();
    if rest.is_empty() {
        return Ok(args);
    }
    for pair in rest.split(',') {
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            TransportError::invalid_spec(format!("expected key=value, got {} in {}", pair, text))
        })?;
        args.insert(key, value);
    }
    Ok(args)
}

/// Take `key`, falling back to its legacy alias. The alias is consumed
/// either way so it never surfaces as an unrecognized argument.
fn take_alias<'a>(
    args: &mut HashMap<&'a str, &'a str>,
    key: &str,
    alias: &str,
) -> Option<&'a str> {
    let aliased = args.remove(alias);
    args.remove(key).or(aliased)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_scheme_normalizes_to_wildcard_iface() {
        let spec = ListenSpec::parse("tcp:").unwrap();
        assert_eq!(spec.key, ListenKey::Iface("*".to_string()));
        assert_eq!(spec.port, PORT_DEFAULT);
        assert!(spec.is_wildcard());
        assert_eq!(spec.canonical(), "tcp:iface=*,port=9955");
    }

    #[test]
    fn addr_and_port_parse() {
        let spec = ListenSpec::parse("tcp:addr=192.168.1.10,port=7777").unwrap();
        assert_eq!(
            spec.key,
            ListenKey::Addr(Ipv4Addr::new(192, 168, 1, 10))
        );
        assert_eq!(spec.port, 7777);
        assert!(!spec.is_wildcard());
    }

    #[test]
    fn legacy_aliases_fold_into_addr_and_port() {
        let spec = ListenSpec::parse("tcp:r4addr=10.0.0.1,r4port=1234").unwrap();
        assert_eq!(spec.key, ListenKey::Addr(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(spec.port, 1234);

        // The current key wins over its alias.
        let spec = ListenSpec::parse("tcp:addr=10.0.0.2,r4addr=10.0.0.1").unwrap();
        assert_eq!(spec.key, ListenKey::Addr(Ipv4Addr::new(10, 0, 0, 2)));
    }

    #[test]
    fn iface_takes_precedence_over_addr() {
        let spec = ListenSpec::parse("tcp:iface=eth0,addr=10.0.0.1").unwrap();
        assert_eq!(spec.key, ListenKey::Iface("eth0".to_string()));
        assert_eq!(spec.port, PORT_DEFAULT);
    }

    #[test]
    fn unsupported_family_arguments_are_stripped() {
        let spec =
            ListenSpec::parse("tcp:u4addr=10.0.0.9,u4port=1,r6addr=::1,addr=10.0.0.1,port=5")
                .unwrap();
        assert_eq!(spec.key, ListenKey::Addr(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(spec.port, 5);

        let spec = ListenSpec::parse("tcp:family=ipv4,port=6").unwrap();
        assert_eq!(spec.key, ListenKey::Iface("*".to_string()));
        assert_eq!(spec.port, 6);
    }

    #[test]
    fn unrecognized_arguments_are_tolerated() {
        let spec = ConnectSpec::parse("tcp:guid=2f4e88,addr=1.2.3.4,port=9").unwrap();
        assert_eq!(spec.canonical(), "tcp:addr=1.2.3.4,port=9");
    }

    #[test]
    fn malformed_specs_are_rejected() {
        assert!(ListenSpec::parse("udp:addr=1.2.3.4").is_err());
        assert!(ListenSpec::parse("tcp:addr").is_err());
        assert!(ListenSpec::parse("tcp:addr=1.2.3.4.5").is_err());
        assert!(ListenSpec::parse("tcp:addr=hostname.local").is_err());
        assert!(ListenSpec::parse("tcp:port=99999").is_err());
        assert!(ListenSpec::parse("tcp:iface=").is_err());
    }

    #[test]
    fn canonical_rendering_orders_arguments() {
        let spec = ListenSpec::parse("tcp:port=1234,addr=1.2.3.4").unwrap();
        assert_eq!(spec.canonical(), "tcp:addr=1.2.3.4,port=1234");
    }

    #[test]
    fn connect_spec_requires_concrete_addr() {
        assert!(ConnectSpec::parse("tcp:").is_err());
        assert!(ConnectSpec::parse("tcp:iface=eth0,port=9955").is_err());
        assert!(ConnectSpec::parse("tcp:addr=0.0.0.0,port=9955").is_err());

        let spec = ConnectSpec::parse("tcp:addr=127.0.0.1").unwrap();
        assert_eq!(spec.port, PORT_DEFAULT);
    }
}

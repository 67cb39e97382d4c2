//! Contract between the transport and the routing layer above it.

use crate::endpoint::RemoteEndpoint;

/// Callbacks the transport delivers to the message router.
pub trait Router: Send + Sync + 'static {
    /// A connection finished authenticating and its pump is running. The
    /// router owns message flow on the endpoint from here on.
    fn register_endpoint(&self, endpoint: RemoteEndpoint);

    /// The endpoint's pump stopped. `sudden` is true when the remote went
    /// away on its own rather than through a locally requested stop.
    fn endpoint_exit(&self, endpoint: RemoteEndpoint, sudden: bool);

    /// A discovery advertisement was seen, re-rendered to a canonical
    /// connect spec. A `ttl` of zero withdraws the names.
    fn found_names(&self, address: &str, guid: &str, names: &[String], ttl: u32);
}

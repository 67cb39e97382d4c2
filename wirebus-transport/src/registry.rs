//! The connection tracker shared by the accept loop, the scavenger and the
//! connect path.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;

use crate::endpoint::Endpoint;
use crate::error::{TransportError, TransportResult};
use crate::state::Membership;

/// Every live endpoint, authenticating or active, lives in exactly one slot
/// here from admission until the scavenger reaps it.
pub(crate) struct EndpointRegistry {
    endpoints: DashMap<u64, Arc<Endpoint>>,
    /// Serializes capacity checks against concurrent admissions.
    admission: Mutex<()>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self {
            endpoints: DashMap::new(),
            admission: Mutex::new(()),
        }
    }

    /// Endpoints on the authenticating and active sides, in that order.
    pub fn counts(&self) -> (usize, usize) {
        let mut authenticating = 0;
        let mut active = 0;
        for entry in self.endpoints.iter() {
            match crate::lock(&entry.value().states).membership {
                Membership::Authenticating => authenticating += 1,
                Membership::Active => active += 1,
            }
        }
        (authenticating, active)
    }

    /// Admit a new endpoint on the authenticating side if capacity allows.
    pub fn try_admit(
        &self,
        ep: Arc<Endpoint>,
        max_auth: usize,
        max_conn: usize,
    ) -> TransportResult<()> {
        let _guard = crate::lock(&self.admission);
        let (authenticating, active) = self.counts();
        if authenticating >= max_auth || authenticating + active >= max_conn {
            return Err(TransportError::ConnectionLimit);
        }
        self.endpoints.insert(ep.id(), ep);
        Ok(())
    }

    pub fn get(&self, id: u64) -> Option<Arc<Endpoint>> {
        self.endpoints.get(&id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, id: u64) -> Option<Arc<Endpoint>> {
        self.endpoints.remove(&id).map(|(_, ep)| ep)
    }

    pub fn snapshot(&self) -> Vec<Arc<Endpoint>> {
        self.endpoints
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AuthState;
    use tokio_util::sync::CancellationToken;

    fn endpoint(id: u64) -> Arc<Endpoint> {
        let remote = "127.0.0.1:1".parse().unwrap();
        Arc::new(Endpoint::new_passive(id, remote, CancellationToken::new()))
    }

    fn promote(ep: &Arc<Endpoint>) {
        let mut st = crate::lock(&ep.states);
        st.set_auth(AuthState::Authenticating);
        st.set_auth(AuthState::Succeeded);
        st.promote();
    }

    #[test]
    fn admission_respects_the_authenticating_limit() {
        let registry = EndpointRegistry::new();
        registry.try_admit(endpoint(1), 2, 10).unwrap();
        registry.try_admit(endpoint(2), 2, 10).unwrap();
        assert!(matches!(
            registry.try_admit(endpoint(3), 2, 10),
            Err(TransportError::ConnectionLimit)
        ));

        // Promotion frees an authenticating slot.
        promote(&registry.get(1).unwrap());
        registry.try_admit(endpoint(3), 2, 10).unwrap();
        assert_eq!(registry.counts(), (2, 1));
    }

    #[test]
    fn admission_respects_the_overall_limit() {
        let registry = EndpointRegistry::new();
        for id in 0..4 {
            registry.try_admit(endpoint(id), 10, 4).unwrap();
            promote(&registry.get(id).unwrap());
        }
        assert!(matches!(
            registry.try_admit(endpoint(9), 10, 4),
            Err(TransportError::ConnectionLimit)
        ));

        registry.remove(0).unwrap();
        registry.try_admit(endpoint(9), 10, 4).unwrap();
    }
}

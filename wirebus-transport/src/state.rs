//! Endpoint lifecycle state machines.
//!
//! Every connection tracks two cooperating state machines: the
//! authentication state driven by the authenticator task, and the endpoint
//! state driven by promotion and the data pump. Transitions outside the
//! tables below are programming errors and panic.

use std::time::{Duration, Instant};

/// Which side of the connection this endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// We initiated the connection.
    Active,
    /// The remote initiated the connection.
    Passive,
}

/// Authentication progress of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// Created, authenticator not yet running.
    Initialized,
    /// Authenticator is exchanging the handshake.
    Authenticating,
    /// Handshake failed or was cancelled.
    Failed,
    /// Handshake completed, authenticator tail may still be running.
    Succeeded,
    /// Authenticator fully finished and joined.
    Done,
}

/// Data-plane progress of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpState {
    /// Created, pump not yet started.
    Initialized,
    /// Promotion in progress, pump starting.
    Starting,
    /// Pump tasks are running.
    Started,
    /// Pump failed to start.
    Failed,
    /// Pump has stopped or been told to stop.
    Stopping,
    /// Pump fully finished and joined.
    Done,
}

/// Which registry side of the connection tracker holds the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Membership {
    /// Counted against the authenticating limit.
    Authenticating,
    /// Counted against the overall connection limit.
    Active,
}

/// Mutable endpoint state, guarded by a single lock per endpoint.
#[derive(Debug)]
pub(crate) struct EndpointStates {
    pub auth: AuthState,
    pub ep: EpState,
    pub membership: Membership,
    /// Set at creation, reset when authentication reaches `Done` so the
    /// same clock times the session setup phase afterwards.
    pub started_at: Instant,
    /// Active endpoints hand themselves to the scavenger only once their
    /// pump exit has been observed.
    pub handed_over: bool,
    /// The routing layer attached a session to this endpoint.
    pub session_routed: bool,
}

impl EndpointStates {
    pub fn new(side: Side) -> Self {
        Self {
            auth: AuthState::Initialized,
            ep: EpState::Initialized,
            membership: Membership::Authenticating,
            started_at: Instant::now(),
            handed_over: side == Side::Passive,
            session_routed: false,
        }
    }

    /// Time since creation, or since authentication finished.
    pub fn age(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn set_auth(&mut self, next: AuthState) {
        use AuthState::*;
        match (self.auth, next) {
            (Initialized, Authenticating)
            | (Initialized, Failed)
            | (Authenticating, Failed)
            | (Authenticating, Succeeded) => self.auth = next,
            (Succeeded, Done) => {
                self.auth = Done;
                self.started_at = Instant::now();
            }
            (from, to) => panic!("invalid auth transition {:?} -> {:?}", from, to),
        }
    }

    pub fn set_ep(&mut self, next: EpState) {
        use EpState::*;
        if next == Starting && self.auth != AuthState::Succeeded {
            panic!("endpoint starting with auth state {:?}", self.auth);
        }
        match (self.ep, next) {
            (Stopping, Stopping) => {}
            (Initialized, Starting)
            | (Starting, Started)
            | (Starting, Failed)
            | (Starting, Stopping)
            | (Started, Stopping)
            | (Failed, Stopping)
            | (Failed, Done)
            | (Stopping, Done) => self.ep = next,
            (from, to) => panic!("invalid endpoint transition {:?} -> {:?}", from, to),
        }
    }

    /// Move the endpoint from the authenticating side of the registry to
    /// the active side.
    pub fn promote(&mut self) {
        match self.membership {
            Membership::Authenticating => self.membership = Membership::Active,
            Membership::Active => panic!("endpoint promoted twice"),
        }
    }
}

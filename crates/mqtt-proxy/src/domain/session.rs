//! Session lifecycle state.
//!
//! ```text
//! Unauthenticated ──Connect ok──► Authenticated
//!        │                              │
//!        └──────────► Closed ◄──────────┘
//! ```
//!
//! `Closed` is terminal. The credential is set at most once.

use crate::domain::errors::ProxyError;
use shared_types::{Credential, ThingId};
use std::fmt;
use uuid::Uuid;

/// Opaque identifier of one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a fresh identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated,
    Closed,
}

/// Per-connection state owned by the client-to-broker loop.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    state: SessionState,
    credential: Option<Credential>,
    thing: Option<ThingId>,
}

impl Session {
    /// A new unauthenticated session.
    #[must_use]
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            state: SessionState::Unauthenticated,
            credential: None,
            thing: None,
        }
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Identity resolved at connect time.
    #[must_use]
    pub fn thing(&self) -> Option<&ThingId> {
        self.thing.as_ref()
    }

    /// Record a successful handshake.
    ///
    /// Only allowed once, from `Unauthenticated`.
    pub fn authenticate(&mut self, credential: Credential, thing: ThingId) -> Result<(), ProxyError> {
        match self.state {
            SessionState::Unauthenticated => {
                self.credential = Some(credential);
                self.thing = Some(thing);
                self.state = SessionState::Authenticated;
                Ok(())
            }
            SessionState::Authenticated => Err(ProxyError::ProtocolViolation(
                "second CONNECT on an authenticated session".into(),
            )),
            SessionState::Closed => Err(ProxyError::ProtocolViolation("session is closed".into())),
        }
    }

    /// The stored credential, if the session may forward control traffic.
    pub fn require_authenticated(&self) -> Result<&Credential, ProxyError> {
        match (self.state, self.credential.as_ref()) {
            (SessionState::Authenticated, Some(credential)) => Ok(credential),
            (SessionState::Closed, _) => Err(ProxyError::ProtocolViolation("session is closed".into())),
            _ => Err(ProxyError::ProtocolViolation(
                "packet received before CONNECT".into(),
            )),
        }
    }

    /// Move to `Closed`. Returns `false` if already closed.
    pub fn close(&mut self) -> bool {
        if self.state == SessionState::Closed {
            return false;
        }
        self.state = SessionState::Closed;
        true
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }
}

//! # Core Domain Entities
//!
//! Defines the identifiers that flow between the proxy core, the identity
//! service and the message bus.
//!
//! ## Clusters
//!
//! - **Addressing**: `ChannelId`
//! - **Identity**: `ThingId`, `Credential`
//! - **Authorization**: `Action`

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// =============================================================================
// CLUSTER A: ADDRESSING
// =============================================================================

/// Numeric identifier of a channel.
///
/// Channels are the addressing unit for publish/subscribe. Topic strings are
/// resolved to a `ChannelId` by the proxy's topic grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub u64);

impl ChannelId {
    /// Create a channel identifier.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// The raw numeric value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ChannelId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl FromStr for ChannelId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>().map(Self)
    }
}

// =============================================================================
// CLUSTER B: IDENTITY
// =============================================================================

/// Identity of a device ("thing") as resolved by the identity service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct ThingId(pub String);

impl ThingId {
    /// Create a thing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ThingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The secret a device presents at connect time.
///
/// `Debug` never prints the secret itself.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Credential(String);

impl Credential {
    /// Wrap a raw credential.
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Expose the secret for transmission to the identity service.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// True if no secret was presented.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential(***)")
    }
}

// =============================================================================
// CLUSTER C: AUTHORIZATION
// =============================================================================

/// Access a thing requests on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Receive messages published on the channel (subscribe).
    Read,
    /// Publish messages to the channel.
    Write,
}

impl Action {
    /// Wire name used by the identity service.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//! # Adapters Layer
//!
//! Concrete implementations at the edges of the session engine.
//!
//! - `identity` - in-memory and HTTP identity providers
//! - `relay` - per-session frame pumps and delivery loops
//! - `listener` - TCP accept loop and broker dialing

pub mod identity;
pub mod listener;
pub mod relay;

pub use identity::InMemoryIdentityProvider;
#[cfg(feature = "http")]
pub use identity::HttpIdentityProvider;
pub use listener::Listener;
pub use relay::{run_session, SessionContext, SessionReport, Teardown};

//! # Driven Ports (Outbound SPI)
//!
//! These are the capabilities the session engine **requires** from its host.
//!
//! - [`IdentityProvider`]: credential and channel-access decisions
//! - [`DeliveryLauncher`]: starts the consumer of a channel's delivery queue
//! - The bus itself is the `shared_bus` bridge contract, re-exported here

use async_trait::async_trait;
use shared_bus::DeliveryReceiver;
use shared_types::{Action, AuthError, ChannelId, Credential, ThingId};
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub use shared_bus::{MessageBridge, MessagePublisher, MessageSubscriber};

/// Abstract interface to the identity/authorization service.
///
/// Implementations need not bound their own latency; the session service
/// wraps every call in its authorization timeout.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; one provider serves every session.
///
/// # Example Implementation
///
/// ```rust,ignore
/// struct StaticIdentity;
///
/// #[async_trait]
/// impl IdentityProvider for StaticIdentity {
///     async fn identify(&self, credential: &Credential) -> Result<ThingId, AuthError> {
///         Ok(ThingId::new(credential.expose()))
///     }
///     // ...
/// }
/// ```
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Resolve a credential to the identity of the thing presenting it.
    async fn identify(&self, credential: &Credential) -> Result<ThingId, AuthError>;

    /// Decide whether the thing holding `credential` may perform `action`
    /// on `channel`.
    ///
    /// # Arguments
    ///
    /// * `channel` - The channel being accessed
    /// * `credential` - The credential presented at connect time
    /// * `action` - `Read` for subscribe, `Write` for publish
    ///
    /// # Returns
    ///
    /// The thing's identity when access is granted.
    async fn can_access(
        &self,
        channel: ChannelId,
        credential: &Credential,
        action: Action,
    ) -> Result<ThingId, AuthError>;
}

/// Starts the loop that drains one channel's delivery queue into the client.
///
/// The loop must exit once `cancel` flips to `true` or its sender is
/// dropped, but only between frames: a frame it has started writing is
/// written in full. The returned task is aborted only when the whole
/// session closes.
pub trait DeliveryLauncher: Send + Sync {
    /// Spawn the consumer for `channel`.
    fn launch(
        &self,
        channel: ChannelId,
        receiver: DeliveryReceiver,
        cancel: watch::Receiver<bool>,
    ) -> JoinHandle<()>;
}

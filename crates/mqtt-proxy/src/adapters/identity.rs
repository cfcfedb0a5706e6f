//! # Identity Adapters
//!
//! Implementations of [`IdentityProvider`]:
//!
//! - [`InMemoryIdentityProvider`]: static credential/grant tables for tests
//!   and local runs
//! - [`HttpIdentityProvider`]: JSON client for the things service (feature
//!   `http`)

use crate::ports::IdentityProvider;
use async_trait::async_trait;
use parking_lot::RwLock;
use shared_types::{Action, AuthError, ChannelId, Credential, ThingId};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Identity provider backed by in-memory tables.
///
/// Credentials map to things; grants are `(thing, channel, action)` triples.
/// Anything not in the tables is denied.
#[derive(Default)]
pub struct InMemoryIdentityProvider {
    things: RwLock<HashMap<String, ThingId>>,
    grants: RwLock<HashSet<(ThingId, ChannelId, Action)>>,
    latency: RwLock<Option<Duration>>,
    unavailable: AtomicBool,
    calls: AtomicU64,
}

impl InMemoryIdentityProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `credential` as belonging to `thing`.
    #[must_use]
    pub fn with_thing(self, credential: &str, thing: &str) -> Self {
        self.things
            .write()
            .insert(credential.to_string(), ThingId::new(thing));
        self
    }

    /// Allow `thing` to perform `action` on `channel`.
    #[must_use]
    pub fn with_grant(self, thing: &str, channel: u64, action: Action) -> Self {
        self.grant(thing, ChannelId(channel), action);
        self
    }

    /// Delay every answer by `latency`.
    #[must_use]
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.write() = Some(latency);
        self
    }

    pub fn grant(&self, thing: &str, channel: ChannelId, action: Action) {
        self.grants
            .write()
            .insert((ThingId::new(thing), channel, action));
    }

    pub fn revoke(&self, thing: &str, channel: ChannelId, action: Action) {
        self.grants
            .write()
            .remove(&(ThingId::new(thing), channel, action));
    }

    /// Make every call fail as if the service were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of `identify` and `can_access` calls served.
    #[must_use]
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    async fn answer(&self) -> Result<(), AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.read();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AuthError::Unavailable("identity service offline".into()));
        }
        Ok(())
    }

    fn lookup(&self, credential: &Credential) -> Result<ThingId, AuthError> {
        self.things
            .read()
            .get(credential.expose())
            .cloned()
            .ok_or(AuthError::Denied)
    }
}

#[async_trait]
impl IdentityProvider for InMemoryIdentityProvider {
    async fn identify(&self, credential: &Credential) -> Result<ThingId, AuthError> {
        self.answer().await?;
        self.lookup(credential)
    }

    async fn can_access(
        &self,
        channel: ChannelId,
        credential: &Credential,
        action: Action,
    ) -> Result<ThingId, AuthError> {
        self.answer().await?;
        let thing = self.lookup(credential)?;
        if self.grants.read().contains(&(thing.clone(), channel, action)) {
            Ok(thing)
        } else {
            Err(AuthError::Denied)
        }
    }
}

#[cfg(feature = "http")]
pub use http::HttpIdentityProvider;

#[cfg(feature = "http")]
mod http {
    use super::*;
    use reqwest::{Client, StatusCode};
    use serde::{Deserialize, Serialize};
    use tracing::debug;

    #[derive(Serialize)]
    struct IdentifyRequest<'a> {
        token: &'a str,
    }

    #[derive(Serialize)]
    struct AccessRequest<'a> {
        token: &'a str,
        action: Action,
    }

    #[derive(Deserialize)]
    struct ThingResponse {
        id: String,
    }

    /// Client for the things service HTTP API.
    ///
    /// - `POST {base}/identify` with `{"token"}`
    /// - `POST {base}/channels/{id}/access` with `{"token", "action"}`
    ///
    /// A 2xx answer carrying `{"id"}` grants. Any other status is a denial.
    /// Transport and decoding failures are `Unavailable`.
    pub struct HttpIdentityProvider {
        client: Client,
        base_url: String,
    }

    impl HttpIdentityProvider {
        /// Create a client for `base_url`.
        ///
        /// `timeout` bounds each request end to end.
        pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, AuthError> {
            let client = Client::builder()
                .timeout(timeout)
                .connect_timeout(timeout)
                .build()
                .map_err(|e| AuthError::Unavailable(e.to_string()))?;

            Ok(Self {
                client,
                base_url: base_url.into().trim_end_matches('/').to_string(),
            })
        }

        #[must_use]
        pub fn base_url(&self) -> &str {
            &self.base_url
        }

        async fn post<B: Serialize + Sync>(&self, url: String, body: &B) -> Result<ThingId, AuthError> {
            let response = self
                .client
                .post(&url)
                .json(body)
                .send()
                .await
                .map_err(|e| {
                    if e.is_connect() {
                        AuthError::Unavailable(format!("cannot connect to {}", self.base_url))
                    } else if e.is_timeout() {
                        AuthError::Unavailable(format!("request to {url} timed out"))
                    } else {
                        AuthError::Unavailable(e.to_string())
                    }
                })?;

            let status = response.status();
            if !status.is_success() {
                debug!(%url, status = status.as_u16(), "Identity service refused");
                return Err(match status {
                    StatusCode::INTERNAL_SERVER_ERROR
                    | StatusCode::BAD_GATEWAY
                    | StatusCode::SERVICE_UNAVAILABLE
                    | StatusCode::GATEWAY_TIMEOUT => {
                        AuthError::Unavailable(format!("identity service answered {status}"))
                    }
                    _ => AuthError::Denied,
                });
            }

            let thing: ThingResponse = response
                .json()
                .await
                .map_err(|e| AuthError::Unavailable(format!("invalid identity response: {e}")))?;
            Ok(ThingId::new(thing.id))
        }
    }

    #[async_trait]
    impl IdentityProvider for HttpIdentityProvider {
        async fn identify(&self, credential: &Credential) -> Result<ThingId, AuthError> {
            let url = format!("{}/identify", self.base_url);
            self.post(
                url,
                &IdentifyRequest {
                    token: credential.expose(),
                },
            )
            .await
        }

        async fn can_access(
            &self,
            channel: ChannelId,
            credential: &Credential,
            action: Action,
        ) -> Result<ThingId, AuthError> {
            let url = format!("{}/channels/{}/access", self.base_url, channel);
            self.post(
                url,
                &AccessRequest {
                    token: credential.expose(),
                    action,
                },
            )
            .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> InMemoryIdentityProvider {
        InMemoryIdentityProvider::new()
            .with_thing("key-1", "thing-1")
            .with_grant("thing-1", 42, Action::Read)
    }

    #[tokio::test]
    async fn test_identify_known_and_unknown() {
        let identity = provider();
        assert_eq!(
            identity.identify(&Credential::new("key-1")).await,
            Ok(ThingId::new("thing-1"))
        );
        assert_eq!(
            identity.identify(&Credential::new("nope")).await,
            Err(AuthError::Denied)
        );
        assert_eq!(identity.calls(), 2);
    }

    #[tokio::test]
    async fn test_grants_are_per_action() {
        let identity = provider();
        let key = Credential::new("key-1");
        assert!(identity.can_access(ChannelId(42), &key, Action::Read).await.is_ok());
        assert_eq!(
            identity.can_access(ChannelId(42), &key, Action::Write).await,
            Err(AuthError::Denied)
        );
        assert_eq!(
            identity.can_access(ChannelId(7), &key, Action::Read).await,
            Err(AuthError::Denied)
        );

        identity.revoke("thing-1", ChannelId(42), Action::Read);
        assert!(identity.can_access(ChannelId(42), &key, Action::Read).await.is_err());
    }

    #[tokio::test]
    async fn test_unavailable() {
        let identity = provider();
        identity.set_unavailable(true);
        assert!(matches!(
            identity.identify(&Credential::new("key-1")).await,
            Err(AuthError::Unavailable(_))
        ));
    }

    #[cfg(feature = "http")]
    #[tokio::test]
    async fn test_http_unreachable_is_unavailable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let identity =
            HttpIdentityProvider::new(format!("http://{addr}/"), Duration::from_millis(500)).unwrap();
        assert_eq!(identity.base_url(), format!("http://{addr}"));
        assert!(matches!(
            identity.identify(&Credential::new("key-1")).await,
            Err(AuthError::Unavailable(_))
        ));
    }

    #[cfg(feature = "http")]
    #[tokio::test]
    async fn test_http_identify_and_refusal() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for reply in [
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 15\r\nconnection: close\r\n\r\n{\"id\":\"thing1\"}",
                "HTTP/1.1 403 Forbidden\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
            ] {
                let (mut stream, _) = listener.accept().await.unwrap();
                // Read the whole request so closing does not reset the socket
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                loop {
                    let n = stream.read(&mut buf).await.unwrap();
                    request.extend_from_slice(&buf[..n]);
                    let text = String::from_utf8_lossy(&request).to_lowercase();
                    if let Some(end) = text.find("\r\n\r\n") {
                        let length = text
                            .lines()
                            .find_map(|line| line.strip_prefix("content-length:"))
                            .and_then(|v| v.trim().parse::<usize>().ok())
                            .unwrap_or(0);
                        if request.len() >= end + 4 + length {
                            break;
                        }
                    }
                    if n == 0 {
                        break;
                    }
                }
                stream.write_all(reply.as_bytes()).await.unwrap();
                stream.shutdown().await.unwrap();
            }
        });

        let identity =
            HttpIdentityProvider::new(format!("http://{addr}"), Duration::from_secs(2)).unwrap();
        let key = Credential::new("key-1");
        assert_eq!(identity.identify(&key).await, Ok(ThingId::new("thing1")));
        assert_eq!(
            identity.can_access(ChannelId(3), &key, Action::Write).await,
            Err(AuthError::Denied)
        );
    }
}

//! Registry of live tunnels keyed by subdomain

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand_core::{OsRng, RngCore};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::connection::MessageWriter;
use crate::error::{Result, TunnelError};
use crate::pending::PendingRequests;
use crate::tunnel::{Headers, Message, RequestPayload, ResponsePayload};

/// Random bytes in a subdomain (8 hex chars)
const SUBDOMAIN_BYTES: usize = 4;

/// Random bytes in a correlation id (32 hex chars)
const REQUEST_ID_BYTES: usize = 16;

/// Lowercase hex string of `len` random bytes from the OS RNG
pub(crate) fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Lifecycle of a tunnel on the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// Registered, `registered` message not yet written
    Connecting,
    /// Routable
    Active,
    /// Torn down
    Closed,
}

impl TunnelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Active,
            _ => Self::Closed,
        }
    }
}

/// One connected client
#[derive(Debug)]
pub struct Tunnel {
    subdomain: String,
    url: String,
    writer: MessageWriter,
    pending: PendingRequests,
    state: AtomicU8,
    connected_at: Instant,
}

impl Tunnel {
    fn new(subdomain: String, url: String, writer: MessageWriter) -> Self {
        Self {
            subdomain,
            url,
            writer,
            pending: PendingRequests::new(),
            state: AtomicU8::new(TunnelState::Connecting as u8),
            connected_at: Instant::now(),
        }
    }

    #[must_use]
    pub fn subdomain(&self) -> &str {
        &self.subdomain
    }

    /// Public URL announced to the client
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    #[must_use]
    pub fn state(&self) -> TunnelState {
        TunnelState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Move from `Connecting` to `Active`; fails if already closed
    pub fn activate(&self) -> bool {
        self.state
            .compare_exchange(
                TunnelState::Connecting as u8,
                TunnelState::Active as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Mark the tunnel closed. Only the first caller gets `true` and performs teardown.
    pub fn begin_close(&self) -> bool {
        self.state.swap(TunnelState::Closed as u8, Ordering::AcqRel) != TunnelState::Closed as u8
    }

    /// Write a message on the tunnel connection
    ///
    /// # Errors
    ///
    /// Returns a send error if the write fails.
    pub async fn send(&self, message: &Message) -> Result<()> {
        self.writer.send(message).await
    }

    pub async fn close_connection(&self) {
        self.writer.close().await;
    }

    /// Forward one request and wait for the matching response
    ///
    /// The waiter is registered before the request is written, so a response
    /// can never arrive ahead of its waiter.
    ///
    /// # Errors
    ///
    /// - [`TunnelError::Send`] if the request could not be written
    /// - [`TunnelError::Timeout`] if no response arrived within `deadline`
    /// - [`TunnelError::Disconnected`] if the tunnel closed first
    pub async fn forward(
        &self,
        method: String,
        path: String,
        headers: Headers,
        body: Bytes,
        deadline: Duration,
    ) -> Result<ResponsePayload> {
        let waiter = loop {
            match self.pending.register(random_hex(REQUEST_ID_BYTES)) {
                Err(TunnelError::DuplicateRequest { id }) => {
                    debug!(subdomain = %self.subdomain, id = %id, "Correlation id collision, retrying");
                }
                other => break other?,
            }
        };

        let request = Message::Request(RequestPayload {
            id: waiter.id().to_string(),
            method,
            path,
            headers,
            body,
        });

        if let Err(e) = self.send(&request).await {
            self.pending.remove(waiter.id());
            return Err(e);
        }

        self.pending.wait(waiter, deadline).await
    }
}

/// Concurrency-safe map from subdomain to live tunnel
#[derive(Debug)]
pub struct TunnelRegistry {
    tunnels: RwLock<HashMap<String, Arc<Tunnel>>>,
    public_url: String,
}

impl TunnelRegistry {
    /// Create a registry announcing tunnels under `public_url`
    #[must_use]
    pub fn new(public_url: impl Into<String>) -> Self {
        Self {
            tunnels: RwLock::new(HashMap::new()),
            public_url: public_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Create a tunnel for a new connection under a fresh subdomain
    ///
    /// The tunnel starts in [`TunnelState::Connecting`] and is not routable
    /// until [`Tunnel::activate`] is called.
    pub async fn register(&self, writer: MessageWriter) -> Arc<Tunnel> {
        let mut tunnels = self.tunnels.write().await;

        let subdomain = loop {
            let candidate = random_hex(SUBDOMAIN_BYTES);
            if !tunnels.contains_key(&candidate) {
                break candidate;
            }
            debug!(subdomain = %candidate, "Subdomain collision, retrying");
        };

        let url = format!("{}/{}", self.public_url, subdomain);
        let tunnel = Arc::new(Tunnel::new(subdomain.clone(), url, writer));
        tunnels.insert(subdomain.clone(), tunnel.clone());

        info!(subdomain = %subdomain, active = tunnels.len(), "Registered tunnel");
        tunnel
    }

    /// Find the active tunnel for `subdomain`
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::NotFound`] if no active tunnel uses the subdomain.
    pub async fn lookup(&self, subdomain: &str) -> Result<Arc<Tunnel>> {
        let tunnels = self.tunnels.read().await;
        tunnels
            .get(subdomain)
            .filter(|t| t.state() == TunnelState::Active)
            .cloned()
            .ok_or_else(|| TunnelError::NotFound {
                subdomain: subdomain.to_string(),
            })
    }

    /// Remove a tunnel. Removing an unknown subdomain is a no-op.
    pub async fn remove(&self, subdomain: &str) -> Option<Arc<Tunnel>> {
        let mut tunnels = self.tunnels.write().await;
        let removed = tunnels.remove(subdomain);
        if removed.is_some() {
            info!(subdomain = %subdomain, active = tunnels.len(), "Unregistered tunnel");
        }
        removed
    }

    /// Number of registered tunnels, in any state
    pub async fn len(&self) -> usize {
        self.tunnels.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use futures_util::{sink, SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};

    use super::*;
    use crate::connection::test_util::ws_pair;
    use crate::connection::Frame;

    fn null_writer() -> MessageWriter {
        MessageWriter::new(
            sink::drain::<WsMessage>().sink_map_err(|never| -> WsError { match never {} }),
        )
    }

    #[test]
    fn test_random_hex_shape() {
        let id = random_hex(REQUEST_ID_BYTES);
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(id, random_hex(REQUEST_ID_BYTES));
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = TunnelRegistry::new("http://localhost:8080/");
        let tunnel = registry.register(null_writer()).await;

        assert_eq!(tunnel.subdomain().len(), 8);
        assert_eq!(
            tunnel.url(),
            format!("http://localhost:8080/{}", tunnel.subdomain())
        );

        // Not routable until the handshake completes.
        assert!(matches!(
            registry.lookup(tunnel.subdomain()).await,
            Err(TunnelError::NotFound { .. })
        ));

        assert!(tunnel.activate());
        let found = registry.lookup(tunnel.subdomain()).await.unwrap();
        assert!(Arc::ptr_eq(&found, &tunnel));
    }

    #[tokio::test]
    async fn test_lookup_unknown() {
        let registry = TunnelRegistry::new("http://localhost:8080");
        let err = registry.lookup("doesnotexist").await.unwrap_err();
        assert!(matches!(err, TunnelError::NotFound { subdomain } if subdomain == "doesnotexist"));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let registry = TunnelRegistry::new("http://localhost:8080");
        let tunnel = registry.register(null_writer()).await;
        tunnel.activate();

        assert!(registry.remove(tunnel.subdomain()).await.is_some());
        assert!(registry.remove(tunnel.subdomain()).await.is_none());
        assert!(registry.remove("neverexisted").await.is_none());
        assert!(registry.is_empty().await);
        assert!(registry.lookup(tunnel.subdomain()).await.is_err());
    }

    #[tokio::test]
    async fn test_subdomains_are_unique() {
        let registry = Arc::new(TunnelRegistry::new("http://localhost:8080"));

        let mut handles = Vec::new();
        for _ in 0..64 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.register(null_writer()).await.subdomain().to_string()
            }));
        }

        let mut subdomains = std::collections::HashSet::new();
        for handle in handles {
            assert!(subdomains.insert(handle.await.unwrap()));
        }
        assert_eq!(registry.len().await, 64);
    }

    #[test]
    fn test_state_transitions() {
        let tunnel = Tunnel::new("abc".into(), "http://x/abc".into(), null_writer());
        assert_eq!(tunnel.state(), TunnelState::Connecting);

        assert!(tunnel.activate());
        assert!(!tunnel.activate());
        assert_eq!(tunnel.state(), TunnelState::Active);

        assert!(tunnel.begin_close());
        assert!(!tunnel.begin_close());
        assert!(!tunnel.activate());
        assert_eq!(tunnel.state(), TunnelState::Closed);
    }

    #[tokio::test]
    async fn test_forward_correlates_response() {
        let (server, mut client) = ws_pair().await;
        let (sink, _stream) = server.split();
        let tunnel = Arc::new(Tunnel::new("abc".into(), "http://x/abc".into(), MessageWriter::new(sink)));

        let forwarding = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move {
                tunnel
                    .forward(
                        "GET".into(),
                        "/health".into(),
                        Headers::new(),
                        Bytes::new(),
                        Duration::from_secs(5),
                    )
                    .await
            })
        };

        let frame = client.next().await.unwrap().unwrap();
        let Frame::Message(Ok(Message::Request(request))) = Frame::from(frame) else {
            panic!("expected a request");
        };
        assert_eq!(request.path, "/health");
        assert_eq!(request.id.len(), 32);

        let response = ResponsePayload::text(request.id.clone(), 200, "ok");
        assert!(tunnel.pending().fulfill(response));

        let got = forwarding.await.unwrap().unwrap();
        assert_eq!(got.status_code, 200);
        assert_eq!(&got.body[..], b"ok");
        assert!(tunnel.pending().is_empty());
    }

    #[tokio::test]
    async fn test_forward_write_failure_removes_waiter() {
        let (server, _client) = ws_pair().await;
        let (sink, _stream) = server.split();
        let tunnel = Tunnel::new("abc".into(), "http://x/abc".into(), MessageWriter::new(sink));
        tunnel.close_connection().await;

        let err = tunnel
            .forward(
                "GET".into(),
                "/".into(),
                Headers::new(),
                Bytes::new(),
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Send { .. }));
        assert!(tunnel.pending().is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_forward_releases_waiter() {
        let (server, mut client) = ws_pair().await;
        let (sink, _stream) = server.split();
        let tunnel = Arc::new(Tunnel::new("abc".into(), "http://x/abc".into(), MessageWriter::new(sink)));

        let forwarding = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move {
                tunnel
                    .forward(
                        "GET".into(),
                        "/never".into(),
                        Headers::new(),
                        Bytes::new(),
                        Duration::from_secs(30),
                    )
                    .await
            })
        };

        let frame = client.next().await.unwrap().unwrap();
        let Frame::Message(Ok(Message::Request(request))) = Frame::from(frame) else {
            panic!("expected a request");
        };
        assert_eq!(tunnel.pending().len(), 1);

        // The public caller hung up.
        forwarding.abort();
        assert!(forwarding.await.unwrap_err().is_cancelled());
        assert_eq!(tunnel.pending().len(), 0);

        let late = ResponsePayload::text(request.id, 200, "late");
        assert!(!tunnel.pending().fulfill(late));
    }
}

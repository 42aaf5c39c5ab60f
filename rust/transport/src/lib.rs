//! Request-reply gossip transport.
//!
//! Each node runs one *router* (a bound listener answering peer requests)
//! and one *dealer* (a pool of outgoing connections tagged with the node's
//! identity).  A request carries `[sender, key, payload]`; the router
//! replies with its own serialized state for that key and only then merges
//! the received payload, keeping the peer's round-trip short.
//!
//! Connections are dropped without draining on close; the CRDT layer
//! tolerates lost messages, so fast shutdown wins over delivery.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use stampede_crdt::{StateKey, StateStore};
use stampede_error::{ErrorCodes, StampedeError};
use stampede_types::{Endpoint, NodeId};
use stampede_wire::{
    deserialize_lww, serialize_lww, Envelope, WireError, ENVELOPE_OVERHEAD, MAX_MESSAGE_SIZE,
};
use thiserror::Error;

pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(2000);
pub const MAX_PORT_BIND_ATTEMPTS: u16 = 100;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to bind after {attempts} attempts, tried ports {first}-{last}")]
    BindExhausted { attempts: u16, first: u16, last: u16 },
    #[error("failed to bind to {host}:{port}: {source}")]
    Bind {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("transport is not bound")]
    NotBound,
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StampedeError for TransportError {
    fn code(&self) -> ErrorCodes {
        match self {
            TransportError::BindExhausted { .. } => ErrorCodes::ResourceExhausted,
            TransportError::Bind { .. } => ErrorCodes::Unavailable,
            TransportError::NotBound => ErrorCodes::FailedPrecondition,
            TransportError::Wire(err) => err.code(),
            TransportError::Io(_) => ErrorCodes::Unavailable,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// How long a dealer waits for a reply before evicting the peer.
    pub poll_timeout: Duration,
    /// Port increments to try before giving up on binding.
    pub max_bind_attempts: u16,
    /// Fail immediately instead of incrementing when the port is taken.
    pub strict_port: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            max_bind_attempts: MAX_PORT_BIND_ATTEMPTS,
            strict_port: false,
        }
    }
}

type PeerFramed = Framed<TcpStream, LengthDelimitedCodec>;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        // envelope framing adds a little on top of the payload ceiling
        .max_frame_length(MAX_MESSAGE_SIZE + ENVELOPE_OVERHEAD)
        .new_codec()
}

/// Strip the `tcp://` scheme from a gossip URI, leaving `host:port`.
fn socket_addr_of(uri: &str) -> &str {
    uri.strip_prefix("tcp://").unwrap_or(uri)
}

pub struct Transport {
    identity: NodeId,
    host: String,
    requested_port: u16,
    bound: Mutex<Option<(u16, Arc<TcpListener>)>>,
    // Outgoing connections by URI.  The lock is held across a full
    // send/recv exchange; requests to any peer are serialized the way a
    // single dealer socket serializes them.
    pool: tokio::sync::Mutex<HashMap<String, PeerFramed>>,
    cancel: CancellationToken,
    config: TransportConfig,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("identity", &self.identity)
            .field("host", &self.host)
            .field("port", &self.port())
            .finish()
    }
}

impl Transport {
    pub fn new(host: impl Into<String>, port: u16, identity: NodeId, config: TransportConfig) -> Self {
        Transport {
            identity,
            host: host.into(),
            requested_port: port,
            bound: Mutex::new(None),
            pool: tokio::sync::Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            config,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// The bound port, or the requested port before [`bind`].
    ///
    /// [`bind`]: Transport::bind
    pub fn port(&self) -> u16 {
        self.bound
            .lock()
            .as_ref()
            .map(|(port, _)| *port)
            .unwrap_or(self.requested_port)
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port())
    }

    /// Bind the router socket, incrementing the port on collisions unless
    /// strict mode is set.
    pub async fn bind(&self) -> Result<(), TransportError> {
        let mut port = self.requested_port;
        let mut attempts = 0u16;
        loop {
            match TcpListener::bind((self.host.as_str(), port)).await {
                Ok(listener) => {
                    // port 0 asks the OS for an ephemeral port
                    let port = listener.local_addr().map(|a| a.port()).unwrap_or(port);
                    if attempts > 0 {
                        tracing::info!("bound to {}:{} after {} attempts", self.host, port, attempts);
                    }
                    *self.bound.lock() = Some((port, Arc::new(listener)));
                    return Ok(());
                }
                Err(err) if err.kind() == std::io::ErrorKind::AddrInUse && !self.config.strict_port => {
                    attempts += 1;
                    if attempts >= self.config.max_bind_attempts || port == u16::MAX {
                        return Err(TransportError::BindExhausted {
                            attempts,
                            first: self.requested_port,
                            last: port,
                        });
                    }
                    port += 1;
                }
                Err(err) => {
                    return Err(TransportError::Bind {
                        host: self.host.clone(),
                        port,
                        source: err,
                    });
                }
            }
        }
    }

    /// Router loop: accept peers and answer their exchanges until shutdown.
    pub async fn listen(&self, state: Arc<StateStore>) -> Result<(), TransportError> {
        let listener = self
            .bound
            .lock()
            .as_ref()
            .map(|(_, listener)| Arc::clone(listener))
            .ok_or(TransportError::NotBound)?;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            tracing::debug!("accepted gossip connection from {peer_addr}");
                            let state = Arc::clone(&state);
                            let identity = self.identity.clone();
                            let cancel = self.cancel.clone();
                            tokio::spawn(async move {
                                serve_peer(stream, state, identity, cancel).await;
                            });
                        }
                        Err(err) => {
                            if self.cancel.is_cancelled() {
                                return Ok(());
                            }
                            tracing::error!("accept failed: {err}");
                        }
                    }
                }
            }
        }
    }

    /// One gossip exchange with a peer: send our state for `key`, wait up
    /// to the poll timeout for theirs, merge what comes back.
    ///
    /// A timeout or broken connection erodes the peer from `node_register`
    /// (when its id is known) and evicts the pooled connection; gossip
    /// through other peers re-discovers it if it is still alive.
    pub async fn send(
        &self,
        node_id: Option<&str>,
        uri: &str,
        key: StateKey,
        state: &StateStore,
    ) -> Result<(), TransportError> {
        let local = state.clone_set(key);
        let payload = serialize_lww(&local)?;
        let request = Envelope::new(self.identity.as_str(), key.as_str(), payload).encode()?;

        let mut pool = self.pool.lock().await;
        if !pool.contains_key(uri) {
            let addr = socket_addr_of(uri).to_string();
            let connected = timeout(self.config.poll_timeout, TcpStream::connect(&addr)).await;
            match connected {
                Ok(Ok(stream)) => {
                    tracing::debug!("new gossip connection to {uri}");
                    pool.insert(uri.to_string(), Framed::new(stream, codec()));
                }
                Ok(Err(err)) => {
                    tracing::warn!("failed to connect to {uri}: {err}");
                    self.evict_peer(&mut pool, node_id, uri, state);
                    return Ok(());
                }
                Err(_) => {
                    tracing::warn!("timed out connecting to {uri}");
                    self.evict_peer(&mut pool, node_id, uri, state);
                    return Ok(());
                }
            }
        }
        let framed = pool.get_mut(uri).ok_or(TransportError::NotBound)?;

        if let Err(err) = framed.send(Bytes::from(request)).await {
            tracing::warn!("send to {uri} failed: {err}");
            self.evict_peer(&mut pool, node_id, uri, state);
            return Ok(());
        }

        match timeout(self.config.poll_timeout, framed.next()).await {
            Ok(Some(Ok(frame))) => {
                self.absorb_reply(&frame, node_id, key, state);
                Ok(())
            }
            Ok(Some(Err(err))) => {
                tracing::warn!("receive from {uri} failed: {err}");
                self.evict_peer(&mut pool, node_id, uri, state);
                Ok(())
            }
            Ok(None) => {
                tracing::warn!("{uri} closed the connection mid-exchange");
                self.evict_peer(&mut pool, node_id, uri, state);
                Ok(())
            }
            Err(_) => {
                tracing::warn!("no response from {uri}, removing peer from live set");
                self.evict_peer(&mut pool, node_id, uri, state);
                Ok(())
            }
        }
    }

    fn absorb_reply(&self, frame: &[u8], node_id: Option<&str>, key: StateKey, state: &StateStore) {
        let reply = match Envelope::decode(frame) {
            Ok(reply) => reply,
            Err(err) => {
                tracing::error!("invalid reply envelope: {err}");
                return;
            }
        };
        if reply.payload.is_empty() {
            tracing::warn!(
                "empty reply from {}, likely validation error on the remote",
                node_id.unwrap_or("peer")
            );
            return;
        }
        match deserialize_lww(&reply.payload) {
            Ok(remote) => state.merge(key, &remote),
            Err(err) => {
                tracing::error!("invalid reply from {}: {err}", node_id.unwrap_or("peer"));
            }
        }
    }

    fn evict_peer(
        &self,
        pool: &mut HashMap<String, PeerFramed>,
        node_id: Option<&str>,
        uri: &str,
        state: &StateStore,
    ) {
        if let Some(node_id) = node_id {
            state
                .set(StateKey::NodeRegister)
                .remove_now(node_id, Default::default());
        }
        pool.remove(uri);
    }

    /// Signal the listen loop and every connection handler to stop at the
    /// next read boundary.
    pub fn shutdown(&self) {
        tracing::debug!("shutting down transport");
        self.cancel.cancel();
    }

    /// Shutdown plus dropping all pooled connections.
    pub async fn close(&self) {
        self.shutdown();
        self.pool.lock().await.clear();
        *self.bound.lock() = None;
        tracing::debug!("transport closed");
    }
}

/// Answer one peer's exchanges until it disconnects or we shut down.
async fn serve_peer(
    stream: TcpStream,
    state: Arc<StateStore>,
    identity: NodeId,
    cancel: CancellationToken,
) {
    let mut framed = Framed::new(stream, codec());
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = framed.next() => frame,
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => {
                tracing::debug!("peer read failed: {err}");
                return;
            }
            None => return,
        };
        let request = match Envelope::decode(&frame) {
            Ok(request) => request,
            Err(err) => {
                tracing::error!("undecodable request: {err}");
                return;
            }
        };
        let reply = handle_request(&request, &state, &identity);
        if let Err(err) = framed.send(Bytes::from(reply)).await {
            tracing::debug!("reply to {} failed: {err}", request.sender);
            return;
        }
    }
}

/// Validate the incoming payload and build the reply frame.  Invalid
/// payloads and unknown keys get an empty-payload reply and are not
/// merged.  The merge happens after the reply bytes are built, so the
/// caller ships the reply before paying for the merge.
fn handle_request(request: &Envelope, state: &StateStore, identity: &NodeId) -> Vec<u8> {
    let empty_reply = |key: &str| {
        Envelope::new(identity.as_str(), key, Vec::new())
            .encode()
            .unwrap_or_default()
    };

    let Some(key) = StateKey::parse(&request.key) else {
        tracing::error!("request for unknown state key {:?}", request.key);
        return empty_reply(&request.key);
    };
    let received = match deserialize_lww(&request.payload) {
        Ok(received) => received,
        Err(err) => {
            tracing::error!("invalid message from {}: {err}", request.sender);
            return empty_reply(&request.key);
        }
    };
    let ours = match serialize_lww(&state.clone_set(key)) {
        Ok(ours) => ours,
        Err(err) => {
            tracing::error!("failed to serialize state for {key}: {err}");
            return empty_reply(&request.key);
        }
    };
    let reply = match Envelope::new(identity.as_str(), key.as_str(), ours).encode() {
        Ok(reply) => reply,
        Err(err) => {
            tracing::error!("failed to encode reply for {key}: {err}");
            return empty_reply(&request.key);
        }
    };

    state.merge(key, &received);
    reply
}

#[cfg(test)]
mod tests {
    use super::*;
    use stampede_crdt::Presence;

    fn transport(port: u16) -> Transport {
        Transport::new(
            "127.0.0.1",
            port,
            NodeId::generate(),
            TransportConfig {
                poll_timeout: Duration::from_millis(500),
                ..Default::default()
            },
        )
    }

    fn register(state: &StateStore, id: &str) {
        state
            .set(StateKey::NodeRegister)
            .add_now(id, Presence::new("127.0.0.1", 1).to_extras());
    }

    #[tokio::test]
    async fn bind_increments_past_a_taken_port() {
        let first = transport(0);
        first.bind().await.unwrap();
        let taken = first.port();

        let second = transport(taken);
        second.bind().await.unwrap();
        assert!(second.port() > taken);
        first.close().await;
        second.close().await;
    }

    #[tokio::test]
    async fn strict_port_fails_instead_of_incrementing() {
        let first = transport(0);
        first.bind().await.unwrap();

        let second = Transport::new(
            "127.0.0.1",
            first.port(),
            NodeId::generate(),
            TransportConfig {
                strict_port: true,
                ..Default::default()
            },
        );
        assert!(matches!(
            second.bind().await,
            Err(TransportError::Bind { .. })
        ));
        first.close().await;
    }

    #[tokio::test]
    async fn exchange_merges_state_on_both_sides() {
        let router = Arc::new(transport(0));
        router.bind().await.unwrap();
        let router_state = Arc::new(StateStore::new());
        register(&router_state, "router-node");
        {
            let listen_router = Arc::clone(&router);
            let listen_state = Arc::clone(&router_state);
            tokio::spawn(async move {
                let _ = listen_router.listen(listen_state).await;
            });
        }

        let dealer = transport(0);
        let dealer_state = StateStore::new();
        register(&dealer_state, "dealer-node");

        let uri = router.endpoint().uri();
        dealer
            .send(Some("router-node"), &uri, StateKey::NodeRegister, &dealer_state)
            .await
            .unwrap();

        // dealer learned the router's entry from the reply
        assert!(dealer_state.set(StateKey::NodeRegister).contains("router-node"));
        // router merged the dealer's request payload after replying
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(router_state.set(StateKey::NodeRegister).contains("dealer-node"));

        dealer.close().await;
        router.close().await;
    }

    #[tokio::test]
    async fn unresponsive_peer_is_evicted_from_the_live_set() {
        // A listener that accepts and then never replies.
        let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let uri = format!("tcp://127.0.0.1:{}", silent.local_addr().unwrap().port());
        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                if let Ok((stream, _)) = silent.accept().await {
                    held.push(stream);
                }
            }
        });

        let dealer = transport(0);
        let state = StateStore::new();
        register(&state, "dead-node");
        assert!(state.set(StateKey::NodeRegister).contains("dead-node"));

        dealer
            .send(Some("dead-node"), &uri, StateKey::NodeRegister, &state)
            .await
            .unwrap();
        assert!(!state.set(StateKey::NodeRegister).contains("dead-node"));
        dealer.close().await;
    }

    #[tokio::test]
    async fn unreachable_peer_is_evicted_from_the_live_set() {
        let dealer = transport(0);
        let state = StateStore::new();
        register(&state, "gone-node");

        // A port with nothing listening; connect fails fast.
        dealer
            .send(Some("gone-node"), "tcp://127.0.0.1:1", StateKey::NodeRegister, &state)
            .await
            .unwrap();
        assert!(!state.set(StateKey::NodeRegister).contains("gone-node"));
        dealer.close().await;
    }

    #[tokio::test]
    async fn invalid_request_gets_an_empty_reply_and_no_merge() {
        let router = Arc::new(transport(0));
        router.bind().await.unwrap();
        let router_state = Arc::new(StateStore::new());
        {
            let listen_router = Arc::clone(&router);
            let listen_state = Arc::clone(&router_state);
            tokio::spawn(async move {
                let _ = listen_router.listen(listen_state).await;
            });
        }

        let addr = format!("127.0.0.1:{}", router.port());
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(stream, codec());
        let bogus = Envelope::new("attacker", "node_register", vec![0xff, 0xfe]).encode().unwrap();
        framed.send(Bytes::from(bogus)).await.unwrap();

        let reply = timeout(Duration::from_secs(2), framed.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let envelope = Envelope::decode(&reply).unwrap();
        assert!(envelope.payload.is_empty());
        assert!(router_state.set(StateKey::NodeRegister).keys().is_empty());
        router.close().await;
    }

    #[tokio::test]
    async fn unknown_key_gets_an_empty_reply() {
        let state = StateStore::new();
        let identity = NodeId::generate();
        let request = Envelope::new("peer", "not_a_key", serialize_lww(&Default::default()).unwrap());
        let reply = handle_request(&request, &state, &identity);
        let envelope = Envelope::decode(&reply).unwrap();
        assert!(envelope.payload.is_empty());
        assert_eq!(envelope.key, "not_a_key");
    }

    #[tokio::test]
    async fn connections_are_pooled_across_sends() {
        let router = Arc::new(transport(0));
        router.bind().await.unwrap();
        let router_state = Arc::new(StateStore::new());
        {
            let listen_router = Arc::clone(&router);
            let listen_state = Arc::clone(&router_state);
            tokio::spawn(async move {
                let _ = listen_router.listen(listen_state).await;
            });
        }

        let dealer = transport(0);
        let state = StateStore::new();
        let uri = router.endpoint().uri();
        for _ in 0..3 {
            dealer
                .send(None, &uri, StateKey::Scenarios, &state)
                .await
                .unwrap();
        }
        assert_eq!(dealer.pool.lock().await.len(), 1);
        dealer.close().await;
        router.close().await;
    }
}

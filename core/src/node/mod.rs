// Node module — the local overlay participant
//
// `Host` is the narrow interface the session logic needs from the network:
// connect to a peer, remember its addresses, open and accept protocol streams.
// `Node` implements it on top of a libp2p swarm.

pub mod address_book;
pub mod behaviour;
pub mod stream;
pub mod swarm;

pub use address_book::{AddressBook, TEMP_ADDR_TTL};
pub use stream::PeerStream;
pub use swarm::{start_swarm, SwarmCommand, SwarmHandle};

use crate::locator::PeerLocation;
use async_trait::async_trait;
use futures::StreamExt;
use libp2p::{identity::Keypair, Multiaddr, PeerId, StreamProtocol};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt};
use tracing::debug;

#[derive(Debug, Clone, Error)]
pub enum NodeError {
    #[error("transport setup failed: {0}")]
    Transport(String),
    #[error("failed to listen on {addr}: {reason}")]
    Listen { addr: Multiaddr, reason: String },
    #[error("node is not running")]
    NotRunning,
    #[error("failed to dial {peer_id}: {reason}")]
    Dial { peer_id: PeerId, reason: String },
    #[error("peer routing is not enabled")]
    RoutingDisabled,
    #[error("routing table refresh failed: {0}")]
    Routing(String),
    #[error("lookup of {peer_id} failed: {reason}")]
    Lookup { peer_id: PeerId, reason: String },
    #[error("a handler for {0} is already registered")]
    HandlerRegistered(StreamProtocol),
    #[error("failed to open {protocol} stream to {peer_id}: {reason}")]
    OpenStream {
        peer_id: PeerId,
        protocol: StreamProtocol,
        reason: String,
    },
}

/// Callback invoked for every inbound stream on a registered protocol.
pub type StreamHandler<S> = Arc<dyn Fn(PeerStream<S>) + Send + Sync>;

/// Anything that can attempt an overlay-level connection to a peer.
///
/// Implementations must tolerate many concurrent `connect` calls.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, location: PeerLocation) -> Result<(), NodeError>;
}

/// A local participant able to dial, accept and open protocol streams.
#[async_trait]
pub trait Host: Connector {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    fn local_peer_id(&self) -> PeerId;

    /// Remember endpoints for a peer for `ttl`.
    fn add_addresses(&self, peer_id: PeerId, addrs: &[Multiaddr], ttl: Duration);

    /// Open a new outbound stream, connecting first if needed.
    async fn open_stream(
        &self,
        peer_id: PeerId,
        protocol: StreamProtocol,
    ) -> Result<PeerStream<Self::Stream>, NodeError>;

    /// Route inbound streams for `protocol` to `handler`.
    fn set_stream_handler(
        &self,
        protocol: StreamProtocol,
        handler: StreamHandler<Self::Stream>,
    ) -> Result<(), NodeError>;

    /// Stop accepting inbound streams for `protocol`. Streams already handed
    /// to the handler are unaffected.
    fn remove_stream_handler(&self, protocol: &StreamProtocol);
}

/// How to build a [`Node`].
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Addresses to listen on; empty for an outbound-only node
    pub listen_addrs: Vec<Multiaddr>,
    /// Enable the DHT client and routed dialing
    pub routing: bool,
    /// How long a connection without streams is kept open
    pub idle_connection_timeout: Duration,
}

impl NodeConfig {
    pub const DEFAULT_IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

    /// A node that never opens listening endpoints.
    pub fn outbound_only() -> Self {
        Self {
            listen_addrs: Vec::new(),
            routing: false,
            idle_connection_timeout: Self::DEFAULT_IDLE_CONNECTION_TIMEOUT,
        }
    }

    /// A node listening on TCP and QUIC on every interface, random ports.
    pub fn listening() -> Self {
        Self {
            listen_addrs: Self::default_listen_addrs(),
            ..Self::outbound_only()
        }
    }

    pub fn default_listen_addrs() -> Vec<Multiaddr> {
        [
            "/ip4/0.0.0.0/tcp/0",
            "/ip4/0.0.0.0/udp/0/quic-v1",
            "/ip6/::/tcp/0",
            "/ip6/::/udp/0/quic-v1",
        ]
        .iter()
        .filter_map(|addr| addr.parse().ok())
        .collect()
    }

    pub fn with_routing(mut self, routing: bool) -> Self {
        self.routing = routing;
        self
    }
}

/// libp2p-backed [`Host`].
pub struct Node {
    swarm: SwarmHandle,
    address_book: AddressBook,
    handlers: Mutex<HashMap<StreamProtocol, JoinHandle<()>>>,
    routing: bool,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("routing", &self.routing)
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Start a node with a fresh identity and begin listening as configured.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn new(config: NodeConfig) -> Result<Self, NodeError> {
        let keypair = Keypair::generate_ed25519();
        let swarm = start_swarm(keypair, config.routing, config.idle_connection_timeout)?;

        for addr in config.listen_addrs {
            swarm.listen(addr).await?;
        }

        Ok(Self {
            swarm,
            address_book: AddressBook::new(),
            handlers: Mutex::new(HashMap::new()),
            routing: config.routing,
        })
    }

    pub fn is_routing(&self) -> bool {
        self.routing
    }

    pub fn address_book(&self) -> &AddressBook {
        &self.address_book
    }

    pub async fn listen_addrs(&self) -> Result<Vec<Multiaddr>, NodeError> {
        self.swarm.listen_addrs().await
    }

    pub fn remote_address(&self, peer_id: &PeerId) -> Option<Multiaddr> {
        self.swarm.remote_address(peer_id)
    }

    /// Number of peers currently in the DHT routing table.
    pub async fn routing_peers(&self) -> Result<usize, NodeError> {
        self.swarm.routing_peers().await
    }

    /// Kick off a DHT routing table refresh in the background. Fails when the
    /// routing table has no peers to start from.
    pub async fn refresh_routing(&self) -> Result<(), NodeError> {
        if !self.routing {
            return Err(NodeError::RoutingDisabled);
        }
        self.swarm.refresh_routing().await
    }

    pub async fn shutdown(&self) {
        for (_, task) in self.handlers.lock().drain() {
            task.abort();
        }
        // Already stopped is fine
        let _ = self.swarm.shutdown().await;
    }

    // Dial known addresses first; with routing enabled, fall back to a DHT
    // lookup and a second dial that lets the behaviours supply addresses.
    async fn connect_peer(&self, peer_id: PeerId, addrs: Vec<Multiaddr>) -> Result<(), NodeError> {
        if self.swarm.is_connected(&peer_id) {
            return Ok(());
        }

        let mut known = self.address_book.addresses(&peer_id);
        for addr in addrs {
            if !known.contains(&addr) {
                known.push(addr);
            }
        }

        if !self.routing {
            return self.swarm.dial(peer_id, known).await;
        }

        if !known.is_empty() {
            match self.swarm.dial(peer_id, known).await {
                Ok(()) => return Ok(()),
                Err(e) => debug!("Direct dial failed, trying peer routing: {}", e),
            }
        }

        self.swarm.find_peer(peer_id).await?;
        self.swarm
            .dial(peer_id, self.address_book.addresses(&peer_id))
            .await
    }
}

// Given addresses are dialed as they are, without the routed fallback. A
// routing node also seeds its DHT table with the peer it reached, which is
// how bootstrap peers enter the table before identify reports anything.
#[async_trait]
impl Connector for Node {
    async fn connect(&self, location: PeerLocation) -> Result<(), NodeError> {
        let peer_id = location.peer_id;
        if location.addrs.is_empty() {
            return self.connect_peer(peer_id, Vec::new()).await;
        }

        self.swarm.dial(peer_id, location.addrs).await?;

        if self.routing {
            if let Some(addr) = self.swarm.remote_address(&peer_id) {
                self.swarm.add_kad_address(peer_id, addr).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Host for Node {
    type Stream = Compat<libp2p::Stream>;

    fn local_peer_id(&self) -> PeerId {
        self.swarm.local_peer_id()
    }

    fn add_addresses(&self, peer_id: PeerId, addrs: &[Multiaddr], ttl: Duration) {
        self.address_book.add(peer_id, addrs, ttl);
    }

    async fn open_stream(
        &self,
        peer_id: PeerId,
        protocol: StreamProtocol,
    ) -> Result<PeerStream<Self::Stream>, NodeError> {
        self.connect_peer(peer_id, Vec::new()).await?;

        let stream = self
            .swarm
            .control()
            .open_stream(peer_id, protocol.clone())
            .await
            .map_err(|e| NodeError::OpenStream {
                peer_id,
                protocol: protocol.clone(),
                reason: e.to_string(),
            })?;

        Ok(PeerStream::new(
            stream.compat(),
            peer_id,
            self.swarm.remote_address(&peer_id),
            protocol,
        )
        .with_reset(self.swarm.clone()))
    }

    fn set_stream_handler(
        &self,
        protocol: StreamProtocol,
        handler: StreamHandler<Self::Stream>,
    ) -> Result<(), NodeError> {
        let mut incoming = self
            .swarm
            .control()
            .accept(protocol.clone())
            .map_err(|_| NodeError::HandlerRegistered(protocol.clone()))?;

        let swarm = self.swarm.clone();
        let stream_protocol = protocol.clone();
        let task = tokio::spawn(async move {
            while let Some((peer_id, stream)) = incoming.next().await {
                handler(
                    PeerStream::new(
                        stream.compat(),
                        peer_id,
                        swarm.remote_address(&peer_id),
                        stream_protocol.clone(),
                    )
                    .with_reset(swarm.clone()),
                );
            }
        });

        self.handlers.lock().insert(protocol, task);
        Ok(())
    }

    fn remove_stream_handler(&self, protocol: &StreamProtocol) {
        // Dropping the incoming stream receiver unregisters the protocol
        if let Some(task) = self.handlers.lock().remove(protocol) {
            task.abort();
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        for (_, task) in self.handlers.lock().drain() {
            task.abort();
        }
    }
}

// In-memory hosts for exercising session logic without a network
//
// Every host joined to a MemoryNetwork can open streams to every other one.
// A stream is a tokio duplex pipe; its far end is handed to the target's
// registered handler synchronously, inside `open_stream`.

use crate::locator::PeerLocation;
use crate::node::{AddressBook, Connector, Host, NodeError, PeerStream, StreamHandler};
use async_trait::async_trait;
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId, StreamProtocol};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::DuplexStream;

/// Capacity of each direction of an in-memory stream.
pub const PIPE_CAPACITY: usize = 64 * 1024;

type Handlers = Mutex<HashMap<StreamProtocol, StreamHandler<DuplexStream>>>;

/// A set of in-memory hosts that can reach each other.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hosts: Arc<Mutex<HashMap<PeerId, Weak<MemoryHost>>>>,
    next_port: Arc<AtomicU64>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join a new host with a random identity.
    pub fn host(&self) -> Arc<MemoryHost> {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed) + 1;
        let host = Arc::new(MemoryHost {
            peer_id: PeerId::random(),
            addr: Multiaddr::empty().with(Protocol::Memory(port)),
            network: self.clone(),
            address_book: AddressBook::new(),
            handlers: Mutex::default(),
        });
        self.hosts
            .lock()
            .insert(host.peer_id, Arc::downgrade(&host));
        host
    }

    fn lookup(&self, peer_id: &PeerId) -> Option<Arc<MemoryHost>> {
        self.hosts.lock().get(peer_id).and_then(Weak::upgrade)
    }
}

pub struct MemoryHost {
    peer_id: PeerId,
    addr: Multiaddr,
    network: MemoryNetwork,
    address_book: AddressBook,
    handlers: Handlers,
}

impl MemoryHost {
    pub fn addr(&self) -> &Multiaddr {
        &self.addr
    }

    /// Where other hosts can find this one.
    pub fn location(&self) -> PeerLocation {
        PeerLocation {
            peer_id: self.peer_id,
            addrs: vec![self.addr.clone()],
        }
    }

    pub fn address_book(&self) -> &AddressBook {
        &self.address_book
    }

    /// Whether a handler is registered for `protocol`.
    pub fn handles(&self, protocol: &StreamProtocol) -> bool {
        self.handlers.lock().contains_key(protocol)
    }

    fn reach(&self, peer_id: PeerId) -> Result<Arc<MemoryHost>, NodeError> {
        self.network.lookup(&peer_id).ok_or_else(|| NodeError::Dial {
            peer_id,
            reason: "no such peer on the memory network".to_string(),
        })
    }
}

#[async_trait]
impl Connector for MemoryHost {
    async fn connect(&self, location: PeerLocation) -> Result<(), NodeError> {
        self.reach(location.peer_id).map(|_| ())
    }
}

#[async_trait]
impl Host for MemoryHost {
    type Stream = DuplexStream;

    fn local_peer_id(&self) -> PeerId {
        self.peer_id
    }

    fn add_addresses(&self, peer_id: PeerId, addrs: &[Multiaddr], ttl: Duration) {
        self.address_book.add(peer_id, addrs, ttl);
    }

    async fn open_stream(
        &self,
        peer_id: PeerId,
        protocol: StreamProtocol,
    ) -> Result<PeerStream<DuplexStream>, NodeError> {
        let remote = self.reach(peer_id)?;

        // Clone out so the handler runs without the lock held
        let handler = remote.handlers.lock().get(&protocol).cloned();
        let Some(handler) = handler else {
            return Err(NodeError::OpenStream {
                peer_id,
                protocol,
                reason: "protocol not supported".to_string(),
            });
        };

        let (local, far) = tokio::io::duplex(PIPE_CAPACITY);
        handler(PeerStream::new(
            far,
            self.peer_id,
            Some(self.addr.clone()),
            protocol.clone(),
        ));

        Ok(PeerStream::new(
            local,
            peer_id,
            Some(remote.addr.clone()),
            protocol,
        ))
    }

    fn set_stream_handler(
        &self,
        protocol: StreamProtocol,
        handler: StreamHandler<DuplexStream>,
    ) -> Result<(), NodeError> {
        let mut handlers = self.handlers.lock();
        if handlers.contains_key(&protocol) {
            return Err(NodeError::HandlerRegistered(protocol));
        }
        handlers.insert(protocol, handler);
        Ok(())
    }

    fn remove_stream_handler(&self, protocol: &StreamProtocol) {
        self.handlers.lock().remove(protocol);
    }
}

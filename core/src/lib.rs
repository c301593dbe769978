// p2pcat core — relay stdin/stdout over a single libp2p stream
//
// locator   peer address parsing
// bootstrap racing connections to seed peers
// node      the libp2p host (swarm, address book, stream handlers)
// session   initiator and responder establishment
// relay     bidirectional copy with half-close and reset propagation

pub mod bootstrap;
pub mod locator;
pub mod node;
pub mod relay;
pub mod session;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use bootstrap::{bootstrap, seeds, BootstrapError, BOOTSTRAP_ADDRESSES};
pub use locator::{LocatorError, PeerLocation};
pub use node::{Connector, Host, Node, NodeConfig, NodeError, PeerStream, TEMP_ADDR_TTL};
pub use relay::{Relay, RelayReport, StdoutSink, Termination, BUFFER_SIZE};
pub use session::{initiate, protocol_id, Initiator, PendingStream, Responder, SessionError};

pub use libp2p::{Multiaddr, PeerId, StreamProtocol};

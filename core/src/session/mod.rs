// Session establishment — getting from "a peer address" or "a protocol to
// listen on" to exactly one established stream.
//
//   initiator: parse target -> start node -> [bootstrap] -> open stream
//   responder: start node -> [bootstrap] -> register handler -> first stream wins

pub mod initiator;
pub mod responder;

pub use initiator::{initiate, Initiator};
pub use responder::{PendingStream, Responder};

use crate::bootstrap::{bootstrap, BootstrapError};
use crate::locator::{LocatorError, PeerLocation};
use crate::node::{Node, NodeConfig, NodeError};
use libp2p::{PeerId, StreamProtocol};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Address(#[from] LocatorError),
    #[error("invalid protocol {0:?}: protocol ids must start with '/'")]
    Protocol(String),
    #[error("failed to start node: {0}")]
    Node(#[source] NodeError),
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
    #[error("failed to open stream to {peer_id}: {source}")]
    Stream {
        peer_id: PeerId,
        #[source]
        source: NodeError,
    },
    #[error("failed to accept streams: {0}")]
    Accept(#[source] NodeError),
    #[error("cancelled")]
    Cancelled,
}

/// Validate a protocol tag given on the command line.
pub fn protocol_id(tag: &str) -> Result<StreamProtocol, SessionError> {
    StreamProtocol::try_from_owned(tag.to_string())
        .map_err(|_| SessionError::Protocol(tag.to_string()))
}

// Shared by both roles: build the node, then seed the routing table when
// routing is on. A failed bootstrap is fatal and stops the node again.
async fn start_node(
    config: NodeConfig,
    seeds: &[PeerLocation],
    cancel: &CancellationToken,
) -> Result<Arc<Node>, SessionError> {
    let node = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(SessionError::Cancelled),
        node = Node::new(config) => Arc::new(node.map_err(SessionError::Node)?),
    };

    if node.is_routing() {
        if let Err(e) = bootstrap(node.clone(), seeds, cancel).await {
            node.shutdown().await;
            return Err(match e {
                BootstrapError::Cancelled => SessionError::Cancelled,
                e => e.into(),
            });
        }
    }

    Ok(node)
}

// Peer locator — turns a self-describing peer address into something dialable
//
// A peer address is a multiaddr whose last component names the peer:
//   /ip4/203.0.113.7/tcp/4001/p2p/12D3KooW...
// Everything before the `/p2p` component is the endpoint used to reach it.

use libp2p::multiaddr::{self, Protocol};
use libp2p::{Multiaddr, PeerId};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LocatorError {
    #[error("invalid peer address {input:?}: {source}")]
    InvalidMultiaddr {
        input: String,
        #[source]
        source: multiaddr::Error,
    },
    #[error("peer address {0} does not end with a /p2p peer id")]
    MissingPeerId(Multiaddr),
    #[error("peer address {0} has no transport address before its peer id")]
    MissingTransport(Multiaddr),
}

/// A peer identity together with the endpoints it can be reached on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerLocation {
    pub peer_id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

impl PeerLocation {
    /// Parse a peer address string such as `/ip4/1.2.3.4/tcp/4001/p2p/<id>`.
    ///
    /// The legacy `/ipfs/<id>` spelling is accepted as an alias of `/p2p/<id>`.
    pub fn parse(input: &str) -> Result<Self, LocatorError> {
        let addr = normalize_legacy_ipfs(input)
            .parse::<Multiaddr>()
            .map_err(|source| LocatorError::InvalidMultiaddr {
                input: input.to_string(),
                source,
            })?;
        Self::from_multiaddr(addr)
    }

    /// Split a full peer multiaddr into its peer id and transport endpoint.
    pub fn from_multiaddr(addr: Multiaddr) -> Result<Self, LocatorError> {
        let mut transport = addr.clone();
        let peer_id = match transport.pop() {
            Some(Protocol::P2p(peer_id)) => peer_id,
            _ => return Err(LocatorError::MissingPeerId(addr)),
        };

        if transport.is_empty() {
            return Err(LocatorError::MissingTransport(addr));
        }

        Ok(Self {
            peer_id,
            addrs: vec![transport],
        })
    }

    /// Endpoints rendered back as full peer addresses (with the `/p2p` suffix).
    pub fn p2p_addrs(&self) -> Vec<Multiaddr> {
        self.addrs
            .iter()
            .map(|addr| addr.clone().with(Protocol::P2p(self.peer_id)))
            .collect()
    }
}

impl FromStr for PeerLocation {
    type Err = LocatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<Multiaddr> for PeerLocation {
    type Error = LocatorError;

    fn try_from(addr: Multiaddr) -> Result<Self, Self::Error> {
        Self::from_multiaddr(addr)
    }
}

impl fmt::Display for PeerLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addrs.first() {
            Some(addr) => write!(f, "{}/p2p/{}", addr, self.peer_id),
            None => write!(f, "/p2p/{}", self.peer_id),
        }
    }
}

// `/ipfs/` and `/p2p/` share the same multicodec; older address lists still
// use the former name.
fn normalize_legacy_ipfs(input: &str) -> String {
    input.replace("/ipfs/", "/p2p/")
}

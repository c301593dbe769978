// Initiator role: dial a known peer address on a named protocol

use super::{start_node, SessionError};
use crate::locator::PeerLocation;
use crate::node::{Host, Node, NodeConfig, PeerStream, TEMP_ADDR_TTL};
use crate::relay::{Relay, RelayReport};
use libp2p::{PeerId, StreamProtocol};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct Initiator<H> {
    host: Arc<H>,
}

impl Initiator<Node> {
    /// Start an outbound-only node, bootstrapping it first when routing is on.
    pub async fn start(
        config: NodeConfig,
        seeds: &[PeerLocation],
        cancel: &CancellationToken,
    ) -> Result<Self, SessionError> {
        Ok(Self::new(start_node(config, seeds, cancel).await?))
    }

    pub async fn shutdown(&self) {
        self.host.shutdown().await;
    }
}

impl<H: Host> Initiator<H> {
    pub fn new(host: Arc<H>) -> Self {
        Self { host }
    }

    pub fn host(&self) -> &Arc<H> {
        &self.host
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.host.local_peer_id()
    }

    /// Open a stream to `target` speaking `protocol`.
    ///
    /// The target's endpoints are remembered for [`TEMP_ADDR_TTL`] so the host
    /// can dial them; a routing host may also look the peer up.
    pub async fn dial(
        &self,
        target: &PeerLocation,
        protocol: StreamProtocol,
    ) -> Result<PeerStream<H::Stream>, SessionError> {
        info!("connecting to: {}", target);

        let peer_id = target.peer_id;
        self.host.add_addresses(peer_id, &target.addrs, TEMP_ADDR_TTL);

        let stream = self
            .host
            .open_stream(peer_id, protocol)
            .await
            .map_err(|source| SessionError::Stream { peer_id, source })?;

        match stream.remote_addr() {
            Some(addr) => info!("connected to: {}/p2p/{}", addr, peer_id),
            None => info!("connected to: /p2p/{}", peer_id),
        }
        Ok(stream)
    }
}

/// Run a complete initiator session: start a node, dial `target` and relay
/// until both directions are done. The node is shut down afterwards.
pub async fn initiate<I, O>(
    target: &PeerLocation,
    protocol: StreamProtocol,
    config: NodeConfig,
    seeds: &[PeerLocation],
    relay: Relay<I, O>,
    cancel: &CancellationToken,
) -> Result<RelayReport, SessionError>
where
    I: AsyncRead + Send + Unpin + 'static,
    O: AsyncWrite + Send + Unpin + 'static,
{
    let initiator = Initiator::start(config, seeds, cancel).await?;

    let dialed = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SessionError::Cancelled),
        stream = initiator.dial(target, protocol) => stream,
    };

    let result = match dialed {
        Ok(stream) => Ok(relay.run(stream).await),
        Err(e) => Err(e),
    };

    initiator.shutdown().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeError;
    use crate::testing::MemoryNetwork;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn test_protocol() -> StreamProtocol {
        StreamProtocol::new("/test/1.0")
    }

    #[tokio::test]
    async fn test_dial_opens_stream_and_remembers_target() {
        let network = MemoryNetwork::new();
        let remote = network.host();
        let local = network.host();

        let (accepted_tx, mut accepted_rx) = tokio::sync::mpsc::unbounded_channel();
        remote
            .set_stream_handler(
                test_protocol(),
                Arc::new(move |stream: PeerStream<DuplexStream>| {
                    let _ = accepted_tx.send(stream);
                }),
            )
            .unwrap();

        let initiator = Initiator::new(local.clone());
        let target = remote.location();
        let mut stream = initiator.dial(&target, test_protocol()).await.unwrap();

        assert_eq!(stream.peer_id(), remote.local_peer_id());
        assert_eq!(stream.protocol(), &test_protocol());
        assert_eq!(local.address_book().addresses(&target.peer_id), target.addrs);

        let mut inbound = accepted_rx.recv().await.unwrap();
        assert_eq!(inbound.peer_id(), initiator.local_peer_id());

        stream.write_all(b"hi").await.unwrap();
        stream.shutdown().await.unwrap();
        let mut received = Vec::new();
        inbound.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hi");
    }

    #[tokio::test]
    async fn test_dial_unknown_peer_fails() {
        let network = MemoryNetwork::new();
        let initiator = Initiator::new(network.host());

        let target = PeerLocation {
            peer_id: PeerId::random(),
            addrs: vec!["/memory/4242".parse().unwrap()],
        };
        let err = initiator.dial(&target, test_protocol()).await.unwrap_err();

        assert!(matches!(
            err,
            SessionError::Stream { peer_id, source: NodeError::Dial { .. } } if peer_id == target.peer_id
        ));
    }

    #[tokio::test]
    async fn test_dial_unsupported_protocol_fails() {
        let network = MemoryNetwork::new();
        let remote = network.host();
        let initiator = Initiator::new(network.host());

        let err = initiator
            .dial(&remote.location(), test_protocol())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SessionError::Stream { source: NodeError::OpenStream { .. }, .. }
        ));
    }
}

// Responder role: wait for exactly one inbound stream on a named protocol
//
// The host may deliver several inbound streams concurrently. An AcceptGate
// lets the first one through and drops every other stream, whether it raced
// the winner or arrived after it. Removing the handler afterwards is only a
// courtesy to later dialers; the gate alone guarantees the single accept.

use super::{start_node, SessionError};
use crate::locator::PeerLocation;
use crate::node::{Host, Node, NodeConfig, NodeError, PeerStream};
use crate::relay::{Relay, RelayReport};
use libp2p::{PeerId, StreamProtocol};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One-shot admission for inbound streams.
struct AcceptGate<S> {
    claimed: AtomicBool,
    slot: Mutex<Option<oneshot::Sender<PeerStream<S>>>>,
}

impl<S> AcceptGate<S> {
    fn new(slot: oneshot::Sender<PeerStream<S>>) -> Self {
        Self {
            claimed: AtomicBool::new(false),
            slot: Mutex::new(Some(slot)),
        }
    }

    /// Hand over the first stream ever offered. Any other stream is given
    /// back to the caller, which must drop it.
    fn offer(&self, stream: PeerStream<S>) -> Result<(), PeerStream<S>> {
        if self
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(stream);
        }

        match self.slot.lock().take() {
            Some(slot) => slot.send(stream),
            None => Err(stream),
        }
    }
}

pub struct Responder<H> {
    host: Arc<H>,
}

impl Responder<Node> {
    /// Start a listening node. With routing on, the node is bootstrapped and
    /// then refreshes its routing table in the background, starting from the
    /// seed it reached.
    pub async fn start(
        config: NodeConfig,
        seeds: &[PeerLocation],
        cancel: &CancellationToken,
    ) -> Result<Self, SessionError> {
        let node = start_node(config, seeds, cancel).await?;

        if node.is_routing() {
            if let Err(e) = node.refresh_routing().await {
                warn!("Routing refresh not started: {}", e);
            }
        }

        Ok(Self::new(node))
    }

    pub async fn shutdown(&self) {
        self.host.shutdown().await;
    }
}

impl<H: Host> Responder<H> {
    pub fn new(host: Arc<H>) -> Self {
        Self { host }
    }

    pub fn host(&self) -> &Arc<H> {
        &self.host
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.host.local_peer_id()
    }

    /// Register for inbound streams on `protocol`. Registration is complete
    /// when this returns; the first stream is collected with
    /// [`PendingStream::wait`].
    pub fn accept_once(&self, protocol: StreamProtocol) -> Result<PendingStream<H>, SessionError> {
        let (slot, stream_rx) = oneshot::channel();
        let gate = Arc::new(AcceptGate::new(slot));

        // The handler must not own the host, or the host would own itself.
        self.host
            .set_stream_handler(
                protocol.clone(),
                Arc::new(move |stream: PeerStream<H::Stream>| {
                    if let Err(rejected) = gate.offer(stream) {
                        debug!(
                            "Rejecting stream from {}: already connected",
                            rejected.peer_id()
                        );
                    }
                }),
            )
            .map_err(SessionError::Accept)?;

        Ok(PendingStream {
            host: self.host.clone(),
            protocol,
            stream_rx,
        })
    }

    /// Accept exactly one stream on `protocol`.
    pub async fn serve_once(
        &self,
        protocol: StreamProtocol,
        cancel: &CancellationToken,
    ) -> Result<PeerStream<H::Stream>, SessionError> {
        self.accept_once(protocol)?.wait(cancel).await
    }

    /// Accept exactly one stream on `protocol` and relay it to completion.
    pub async fn serve<I, O>(
        &self,
        protocol: StreamProtocol,
        relay: Relay<I, O>,
        cancel: &CancellationToken,
    ) -> Result<RelayReport, SessionError>
    where
        I: AsyncRead + Send + Unpin + 'static,
        O: AsyncWrite + Send + Unpin + 'static,
    {
        let stream = self.serve_once(protocol, cancel).await?;
        Ok(relay.run(stream).await)
    }
}

/// A registered, not yet collected accept. Dropping it deregisters the
/// protocol handler.
pub struct PendingStream<H: Host> {
    host: Arc<H>,
    protocol: StreamProtocol,
    stream_rx: oneshot::Receiver<PeerStream<H::Stream>>,
}

impl<H: Host> PendingStream<H> {
    /// Wait for the accepted stream.
    pub async fn wait(
        mut self,
        cancel: &CancellationToken,
    ) -> Result<PeerStream<H::Stream>, SessionError> {
        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SessionError::Cancelled),
            stream = &mut self.stream_rx => {
                stream.map_err(|_| SessionError::Accept(NodeError::NotRunning))?
            }
        };

        info!("connection from: /p2p/{}", stream.peer_id());
        Ok(stream)
    }
}

impl<H: Host> fmt::Debug for PendingStream<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingStream")
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

impl<H: Host> Drop for PendingStream<H> {
    fn drop(&mut self) {
        self.host.remove_stream_handler(&self.protocol);
    }
}

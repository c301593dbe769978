// An established protocol stream and the peer it is bound to

use super::swarm::SwarmHandle;
use libp2p::{Multiaddr, PeerId, StreamProtocol};
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

/// A full-duplex byte stream bound to one remote peer and one protocol.
///
/// Closing for write is `AsyncWriteExt::shutdown`. Dropping the stream only
/// ends it as far as the muxer goes: a yamux stream whose inbound side
/// already ended sends a normal close. [`PeerStream::reset`] is the abnormal
/// termination the remote can tell apart from a clean end.
pub struct PeerStream<S> {
    inner: S,
    peer_id: PeerId,
    remote_addr: Option<Multiaddr>,
    protocol: StreamProtocol,
    swarm: Option<SwarmHandle>,
}

impl<S> PeerStream<S> {
    pub fn new(
        inner: S,
        peer_id: PeerId,
        remote_addr: Option<Multiaddr>,
        protocol: StreamProtocol,
    ) -> Self {
        Self {
            inner,
            peer_id,
            remote_addr,
            protocol,
            swarm: None,
        }
    }

    /// Let `reset` tear down the connection carrying this stream.
    pub(crate) fn with_reset(mut self, swarm: SwarmHandle) -> Self {
        self.swarm = Some(swarm);
        self
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Remote address of the connection carrying this stream, when known.
    pub fn remote_addr(&self) -> Option<&Multiaddr> {
        self.remote_addr.as_ref()
    }

    pub fn protocol(&self) -> &StreamProtocol {
        &self.protocol
    }

    /// Abort the stream.
    ///
    /// For swarm streams the connection to the peer is closed before the
    /// stream is dropped, so no orderly close frame can reach the remote
    /// first; its pending reads and writes fail or end early. Other streams
    /// are just dropped.
    pub async fn reset(self) {
        if let Some(swarm) = &self.swarm {
            debug!("resetting stream to {}", self.peer_id);
            if let Err(e) = swarm.disconnect(self.peer_id).await {
                debug!("disconnect from {} failed: {}", self.peer_id, e);
            }
        }
    }
}

impl<S> fmt::Debug for PeerStream<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerStream")
            .field("peer_id", &self.peer_id)
            .field("remote_addr", &self.remote_addr)
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeerStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeerStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

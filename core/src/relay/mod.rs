// Relay — shuttle bytes between a peer stream and local input/output
//
// Two directions run as independent tasks over the two halves of one stream:
//
//   outbound: local input  -> stream   (then close the stream for writing)
//   inbound:  stream       -> local output (then close the local output)
//
// A direction whose copy fails just reports the error. A direction that copied
// everything but cannot close its destination resets the stream: the other
// direction is stopped, the halves are joined again and the stream is reset
// before anything is dropped.

mod stdout;

pub use stdout::StdoutSink;

use crate::node::PeerStream;
use std::fmt;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, Stdin};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Copy buffer size for each direction.
pub const BUFFER_SIZE: usize = 1 << 20;

/// How one direction of the relay ended.
#[derive(Debug)]
pub enum Termination {
    /// Source exhausted and destination closed
    Finished { bytes: u64 },
    /// Reading or writing failed; the destination was left as is
    CopyFailed(io::Error),
    /// Source exhausted but closing the destination failed; the stream was reset
    CloseFailed { bytes: u64, error: io::Error },
    /// Stopped because the other direction reset the stream
    Aborted,
}

impl Termination {
    pub fn is_clean(&self) -> bool {
        matches!(self, Termination::Finished { .. })
    }

    pub fn error(&self) -> Option<&io::Error> {
        match self {
            Termination::CopyFailed(error) | Termination::CloseFailed { error, .. } => Some(error),
            _ => None,
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Finished { bytes } => write!(f, "finished after {} bytes", bytes),
            Termination::CopyFailed(e) => write!(f, "copy failed: {}", e),
            Termination::CloseFailed { bytes, error } => {
                write!(f, "close failed after {} bytes: {}", bytes, error)
            }
            Termination::Aborted => write!(f, "aborted by stream reset"),
        }
    }
}

/// Outcome of both relay directions.
#[derive(Debug)]
pub struct RelayReport {
    /// Local input to stream
    pub outbound: Termination,
    /// Stream to local output
    pub inbound: Termination,
}

impl RelayReport {
    /// Both directions ran to completion and closed their destinations.
    pub fn is_clean(&self) -> bool {
        self.outbound.is_clean() && self.inbound.is_clean()
    }

    /// Whether the stream was reset instead of being closed gracefully.
    pub fn reset(&self) -> bool {
        matches!(self.outbound, Termination::CloseFailed { .. })
            || matches!(self.inbound, Termination::CloseFailed { .. })
    }
}

/// Bidirectional copy between a stream and a local input/output pair.
pub struct Relay<I, O> {
    input: I,
    output: O,
}

impl Relay<Stdin, StdoutSink> {
    /// Relay over the process's standard input and output. Takes over fd 1,
    /// see [`StdoutSink::take`].
    pub fn stdio() -> io::Result<Self> {
        Ok(Self::new(tokio::io::stdin(), StdoutSink::take()?))
    }
}

impl<I, O> Relay<I, O>
where
    I: AsyncRead + Send + Unpin + 'static,
    O: AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(input: I, output: O) -> Self {
        Self { input, output }
    }

    /// Run both directions to completion. Never fails as a whole; per
    /// direction outcomes are in the report.
    pub async fn run<S>(self, stream: PeerStream<S>) -> RelayReport
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let peer_id = stream.peer_id();
        let (mut stream_rx, mut stream_tx) = tokio::io::split(stream);
        let Relay {
            mut input,
            mut output,
        } = self;
        let reset = CancellationToken::new();

        // Each task hands its stream half back so a reset can happen before
        // either half is dropped
        let outbound = tokio::spawn({
            let reset = reset.clone();
            async move {
                let termination = pump("outbound", &mut input, &mut stream_tx, &reset).await;
                (termination, stream_tx)
            }
        });
        let inbound = tokio::spawn({
            let reset = reset.clone();
            async move {
                let termination = pump("inbound", &mut stream_rx, &mut output, &reset).await;
                (termination, stream_rx)
            }
        });
        let (outbound, inbound) = tokio::join!(outbound, inbound);
        let (outbound, stream_tx) = joined(outbound);
        let (inbound, stream_rx) = joined(inbound);

        let report = RelayReport { outbound, inbound };
        debug!(
            "relay with {} done: outbound {}, inbound {}",
            peer_id, report.outbound, report.inbound
        );

        if report.reset() {
            if let (Some(stream_rx), Some(stream_tx)) = (stream_rx, stream_tx) {
                stream_rx.unsplit(stream_tx).reset().await;
            }
        }
        report
    }
}

fn joined<T>(result: Result<(Termination, T), JoinError>) -> (Termination, Option<T>) {
    match result {
        Ok((termination, half)) => (termination, Some(half)),
        Err(e) => (Termination::CopyFailed(io::Error::other(e)), None),
    }
}

async fn pump<R, W>(
    direction: &'static str,
    src: &mut R,
    dst: &mut W,
    reset: &CancellationToken,
) -> Termination
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::select! {
        copied = copy(src, dst) => copied,
        _ = reset.cancelled() => return Termination::Aborted,
    };

    let bytes = match copied {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("{}: {}", direction, e);
            return Termination::CopyFailed(e);
        }
    };

    match dst.shutdown().await {
        Ok(()) => Termination::Finished { bytes },
        Err(e) => {
            reset.cancel();
            error!("{}: close failed, resetting stream: {}", direction, e);
            Termination::CloseFailed { bytes, error: e }
        }
    }
}

// Flushes after every chunk so interactive data is not held back by
// line-buffered destinations such as stdout.
async fn copy<R, W>(src: &mut R, dst: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        dst.write_all(&buf[..n]).await?;
        dst.flush().await?;
        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::{PeerId, StreamProtocol};
    use proptest::prelude::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{DuplexStream, ReadBuf};

    fn peer_stream<S>(inner: S) -> PeerStream<S> {
        PeerStream::new(
            inner,
            PeerId::random(),
            None,
            StreamProtocol::new("/test/1.0"),
        )
    }

    /// Delegates everything except shutdown, which always fails.
    struct BrokenClose<T>(T);

    impl<T: AsyncRead + Unpin> AsyncRead for BrokenClose<T> {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_read(cx, buf)
        }
    }

    impl<T: AsyncWrite + Unpin> AsyncWrite for BrokenClose<T> {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.0).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_flush(cx)
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "output closed")))
        }
    }

    /// An input that fails on first read.
    struct BrokenInput;

    impl AsyncRead for BrokenInput {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::other("input device gone")))
        }
    }

    async fn read_all(mut reader: impl AsyncRead + Unpin) -> Vec<u8> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await.unwrap();
        data
    }

    #[tokio::test]
    async fn test_bidirectional_half_close() {
        let (local, remote) = tokio::io::duplex(64);
        let (output, output_rx) = tokio::io::duplex(64);

        let remote_task = tokio::spawn(async move {
            let (remote_rx, mut remote_tx) = tokio::io::split(remote);
            remote_tx.write_all(b"pong").await.unwrap();
            remote_tx.shutdown().await.unwrap();
            read_all(remote_rx).await
        });
        let collected = tokio::spawn(read_all(output_rx));

        let report = Relay::new(&b"ping"[..], output).run(peer_stream(local)).await;

        assert!(report.is_clean(), "{:?}", report);
        assert!(!report.reset());
        assert!(matches!(report.outbound, Termination::Finished { bytes: 4 }));
        assert!(matches!(report.inbound, Termination::Finished { bytes: 4 }));
        assert_eq!(remote_task.await.unwrap(), b"ping");
        assert_eq!(collected.await.unwrap(), b"pong");
    }

    #[tokio::test]
    async fn test_output_close_failure_resets_stream() {
        let (local, remote) = tokio::io::duplex(64);
        // Input that never ends keeps the outbound direction busy
        let (input, _input_feed) = tokio::io::duplex(64);

        let remote_task = tokio::spawn(async move {
            let (remote_rx, mut remote_tx) = tokio::io::split(remote);
            remote_tx.write_all(b"abc").await.unwrap();
            remote_tx.shutdown().await.unwrap();
            // Ends only once the relay dropped its side of the stream
            read_all(remote_rx).await
        });

        let sink: BrokenClose<Vec<u8>> = BrokenClose(Vec::new());
        let report = tokio::time::timeout(
            Duration::from_secs(5),
            Relay::new(input, sink).run(peer_stream(local)),
        )
        .await
        .expect("reset must stop the outbound direction");

        assert!(report.reset());
        assert!(matches!(report.inbound, Termination::CloseFailed { bytes: 3, .. }));
        assert!(matches!(report.outbound, Termination::Aborted));
        assert_eq!(
            report.inbound.error().map(|e| e.kind()),
            Some(io::ErrorKind::BrokenPipe)
        );
        assert!(remote_task.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stream_close_failure_resets_stream() {
        let (local, remote) = tokio::io::duplex(64);
        let (output, _output_rx) = tokio::io::duplex(64);

        let report = tokio::time::timeout(
            Duration::from_secs(5),
            Relay::new(&b"bye"[..], output).run(peer_stream(BrokenClose(local))),
        )
        .await
        .expect("reset must stop the inbound direction");

        assert!(report.reset());
        assert!(matches!(report.outbound, Termination::CloseFailed { bytes: 3, .. }));
        assert!(matches!(report.inbound, Termination::Aborted));
        drop(remote);
    }

    #[tokio::test]
    async fn test_input_error_leaves_inbound_running() {
        let (local, remote) = tokio::io::duplex(64);
        let (output, output_rx) = tokio::io::duplex(64);

        tokio::spawn(async move {
            let (_remote_rx, mut remote_tx) = tokio::io::split(remote);
            remote_tx.write_all(b"still flowing").await.unwrap();
            remote_tx.shutdown().await.unwrap();
        });
        let collected = tokio::spawn(read_all(output_rx));

        let report = Relay::new(BrokenInput, output).run(peer_stream(local)).await;

        assert!(!report.is_clean());
        assert!(!report.reset());
        assert!(matches!(report.outbound, Termination::CopyFailed(_)));
        assert!(matches!(report.inbound, Termination::Finished { bytes: 13 }));
        assert_eq!(collected.await.unwrap(), b"still flowing");
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    async fn relay_with_chunks(
        sent: Vec<u8>,
        received: Vec<u8>,
        chunk: usize,
        pipe_capacity: usize,
    ) -> (Vec<u8>, Vec<u8>) {
        let (local, remote): (DuplexStream, DuplexStream) = tokio::io::duplex(pipe_capacity);
        let (output, output_rx) = tokio::io::duplex(pipe_capacity);

        let (remote_rx, mut remote_tx) = tokio::io::split(remote);
        let writer = tokio::spawn(async move {
            for piece in received.chunks(chunk) {
                remote_tx.write_all(piece).await.unwrap();
                tokio::task::yield_now().await;
            }
            remote_tx.shutdown().await.unwrap();
        });
        let peer_saw = tokio::spawn(read_all(remote_rx));
        let local_saw = tokio::spawn(read_all(output_rx));

        let report = Relay::new(io::Cursor::new(sent), output)
            .run(peer_stream(local))
            .await;
        assert!(report.is_clean(), "{:?}", report);

        writer.await.unwrap();
        (peer_saw.await.unwrap(), local_saw.await.unwrap())
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_bytes_arrive_in_order(
            sent_len in 0usize..200_000,
            received_len in 0usize..200_000,
            chunk in 1usize..8192,
            pipe_capacity in 1usize..4096,
        ) {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .unwrap();

            let sent = pattern(sent_len, 7);
            let received = pattern(received_len, 113);
            let (peer_saw, local_saw) = runtime.block_on(relay_with_chunks(
                sent.clone(),
                received.clone(),
                chunk,
                pipe_capacity,
            ));

            prop_assert_eq!(peer_saw, sent);
            prop_assert_eq!(local_saw, received);
        }
    }
}

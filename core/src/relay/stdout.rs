// Standard output as a relay destination that can really be closed
//
// tokio's Stdout never closes fd 1: its shutdown only flushes. A reader at the
// other end of our stdout would then wait for EOF until the process exits.
// StdoutSink moves the output onto a private descriptor and closes it on
// shutdown, reporting any error from close(2).

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::AsyncWrite;

#[cfg(unix)]
use std::os::fd::{AsFd, AsRawFd, IntoRawFd, OwnedFd};

/// Writer over the process's standard output whose shutdown closes it.
#[cfg(unix)]
#[derive(Debug)]
pub struct StdoutSink {
    file: Option<tokio::fs::File>,
}

#[cfg(unix)]
impl StdoutSink {
    /// Take over standard output.
    ///
    /// fd 1 is duplicated and then pointed at /dev/null, so once the sink
    /// closes its descriptor nothing in this process keeps the original
    /// output open. Anything printed to stdout afterwards is discarded.
    pub fn take() -> io::Result<Self> {
        let fd = io::stdout().as_fd().try_clone_to_owned()?;
        let null = std::fs::OpenOptions::new().write(true).open("/dev/null")?;

        // SAFETY: both descriptors are valid for the duration of the call
        if unsafe { libc::dup2(null.as_raw_fd(), libc::STDOUT_FILENO) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self::from_fd(fd))
    }

    /// Write to `fd` instead of standard output.
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self {
            file: Some(tokio::fs::File::from_std(std::fs::File::from(fd))),
        }
    }

    fn closed() -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, "stdout is closed")
    }
}

#[cfg(unix)]
impl AsyncWrite for StdoutSink {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.file.as_mut() {
            Some(file) => Pin::new(file).poll_write(cx, buf),
            None => Poll::Ready(Err(Self::closed())),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.file.as_mut() {
            Some(file) => Pin::new(file).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let Some(file) = self.file.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        futures::ready!(Pin::new(file).poll_flush(cx))?;

        let Some(file) = self.file.take() else {
            return Poll::Ready(Ok(()));
        };
        let file = match file.try_into_std() {
            Ok(file) => file,
            Err(file) => {
                // A write is still in flight
                self.file = Some(file);
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    "stdout is busy",
                )));
            }
        };

        // SAFETY: the descriptor was just released by its only owner
        if unsafe { libc::close(file.into_raw_fd()) } != 0 {
            return Poll::Ready(Err(io::Error::last_os_error()));
        }
        Poll::Ready(Ok(()))
    }
}

/// Writer over the process's standard output.
#[cfg(not(unix))]
#[derive(Debug)]
pub struct StdoutSink {
    stdout: tokio::io::Stdout,
}

#[cfg(not(unix))]
impl StdoutSink {
    pub fn take() -> io::Result<Self> {
        Ok(Self {
            stdout: tokio::io::stdout(),
        })
    }
}

#[cfg(not(unix))]
impl AsyncWrite for StdoutSink {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stdout).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_shutdown(cx)
    }
}

//! Full-duplex relay between two streams
//!
//! Each direction is copied on its own task. A direction that reaches EOF
//! half-closes its destination and leaves the other direction running for a
//! drain period so in-flight bytes still arrive. A real I/O error tears both
//! directions down at once. [`RelayPump::run_gated`] skips the drain when the
//! caller knows nothing can still be in flight.

use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default grace period for the second direction after the first one ends
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Byte counts for one relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes copied from the first stream to the second
    pub a_to_b: u64,
    /// Bytes copied from the second stream to the first
    pub b_to_a: u64,
}

/// How one direction ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finish {
    Eof,
    Closed,
    Failed,
    TornDown,
}

/// Whether an error is an ordinary end of stream
pub fn is_closed_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

/// Bidirectional copier with half-close and shared teardown
#[derive(Debug, Clone, Copy)]
pub struct RelayPump {
    drain_timeout: Duration,
}

impl RelayPump {
    pub fn new(drain_timeout: Duration) -> Self {
        Self { drain_timeout }
    }

    /// Relay between `a` and `b` until both directions finish.
    ///
    /// Both streams are shut down and dropped before this returns.
    pub async fn run<A, B>(self, a: A, b: B) -> RelayStats
    where
        A: AsyncRead + AsyncWrite + Send + 'static,
        B: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.run_gated(a, b, || true).await
    }

    /// Like [`run`](Self::run), but the drain period only applies when
    /// `drain_if` returns true once the first direction has finished.
    /// Otherwise the remaining direction is torn down at once.
    pub async fn run_gated<A, B, G>(self, a: A, b: B, drain_if: G) -> RelayStats
    where
        A: AsyncRead + AsyncWrite + Send + 'static,
        B: AsyncRead + AsyncWrite + Send + 'static,
        G: Fn() -> bool + Send,
    {
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        let teardown = CancellationToken::new();

        let mut forward = tokio::spawn(pipe(a_read, b_write, teardown.clone(), "a->b"));
        let mut backward = tokio::spawn(pipe(b_read, a_write, teardown.clone(), "b->a"));

        let (forward_bytes, backward_bytes) = tokio::select! {
            first = &mut forward => {
                let first = joined(first);
                (first, self.drain(&mut backward, &teardown, drain_if()).await)
            }
            first = &mut backward => {
                let first = joined(first);
                (self.drain(&mut forward, &teardown, drain_if()).await, first)
            }
        };
        teardown.cancel();

        RelayStats {
            a_to_b: forward_bytes,
            b_to_a: backward_bytes,
        }
    }

    /// Give the remaining direction `drain_timeout` before tearing it down
    async fn drain(
        &self,
        remaining: &mut JoinHandle<u64>,
        teardown: &CancellationToken,
        wait: bool,
    ) -> u64 {
        if wait {
            tokio::select! {
                result = &mut *remaining => return joined(result),
                _ = tokio::time::sleep(self.drain_timeout) => {
                    debug!("Drain period elapsed, tearing down relay");
                }
            }
        }
        teardown.cancel();
        joined(remaining.await)
    }
}

impl Default for RelayPump {
    fn default() -> Self {
        Self::new(DEFAULT_DRAIN_TIMEOUT)
    }
}

fn joined(result: Result<u64, tokio::task::JoinError>) -> u64 {
    result.unwrap_or_else(|e| {
        warn!("Relay task failed: {}", e);
        0
    })
}

/// Copy `src` into `dst` until EOF, error, or teardown
async fn pipe<R, W>(mut src: R, mut dst: W, teardown: CancellationToken, label: &'static str) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut copied = 0u64;
    let finish = {
        let copy = copy_counted(&mut src, &mut dst, &mut copied);
        tokio::select! {
            result = copy => match result {
                Ok(()) => Finish::Eof,
                Err(e) if is_closed_error(&e) => {
                    debug!("Relay {} closed: {}", label, e);
                    Finish::Closed
                }
                Err(e) => {
                    warn!("Error copying {}: {}", label, e);
                    Finish::Failed
                }
            },
            _ = teardown.cancelled() => Finish::TornDown,
        }
    };

    if finish == Finish::Failed {
        teardown.cancel();
    }
    if let Err(e) = dst.shutdown().await {
        debug!("Relay {} shutdown: {}", label, e);
    }
    debug!("Relay {} finished ({:?}, {} bytes)", label, finish, copied);
    copied
}

/// `tokio::io::copy` that keeps its count when cancelled
async fn copy_counted<R, W>(src: &mut R, dst: &mut W, copied: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    use tokio::io::AsyncReadExt;

    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            dst.flush().await?;
            return Ok(());
        }
        dst.write_all(&buf[..n]).await?;
        *copied += n as u64;
    }
}

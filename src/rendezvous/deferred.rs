//! Deferred connection
//!
//! A stream that can be written and read before the phantom connection it
//! stands for exists. Writes are buffered until a connection is bound, then
//! flushed in order ahead of any later write. Reads come from an internal
//! pipe that every binding feeds, so a relay can start before registration
//! finishes.
//!
//! The buffer doubles as a replay log. Until a binding proves live, every
//! byte written is kept so that a stale binding can be replaced without the
//! remote missing anything. Once the link is confirmed live the log is
//! dropped.
//!
//! End of stream and read errors are only passed to the reader once the
//! binding is confirmed live. A binding that closes before sending anything
//! is reported to its [`LinkActivity`] as ended and left for replacement.

use super::staleness::LinkActivity;
use super::{BoxedStream, DeferredError};
use bytes::{Bytes, BytesMut};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Chunks queued between the inbound copier and the reader
const PIPE_CAPACITY: usize = 32;

/// Read size for the inbound copier
const READ_CHUNK: usize = 16 * 1024;

/// Message from an inbound copier to the reader side
#[derive(Debug)]
enum Inbound {
    Data { generation: u64, data: Bytes },
    Eof { generation: u64 },
    Failed { generation: u64, kind: io::ErrorKind },
    /// Wakes a blocked reader after close
    Closed,
}

/// Result of a successful bind
#[derive(Debug, Clone)]
pub struct BoundLink {
    /// Binding generation, used to confirm or discard this binding later
    pub generation: u64,
    /// Bytes replayed from the buffer onto the new connection
    pub flushed: usize,
    /// Receive-side activity for staleness detection
    pub activity: Arc<LinkActivity>,
}

struct Binding {
    generation: u64,
    /// `None` while the buffer is being flushed
    writer: Option<WriteHalf<BoxedStream>>,
    cancel: CancellationToken,
}

struct State {
    buffer: BytesMut,
    /// Keep written bytes for replay; cleared once a link is live
    replay: bool,
    binding: Option<Binding>,
    generation: u64,
    write_shutdown: bool,
    closed: bool,
}

struct Reader {
    rx: mpsc::Receiver<Inbound>,
    pending: Option<Bytes>,
    eof: bool,
}

struct Shared {
    state: Mutex<State>,
    reader: Mutex<Reader>,
    tx: mpsc::Sender<Inbound>,
    /// Generation most recently confirmed live, 0 for none
    live: watch::Sender<u64>,
    /// Mirrors `State::generation` for the read path
    generation: AtomicU64,
    closed: AtomicBool,
}

/// Stream handle usable before its phantom connection exists.
///
/// Clones share the same buffer and binding.
#[derive(Clone)]
pub struct DeferredConnection {
    shared: Arc<Shared>,
}

impl DeferredConnection {
    /// Create an unbound connection
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(PIPE_CAPACITY);
        let (live, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    buffer: BytesMut::new(),
                    replay: true,
                    binding: None,
                    generation: 0,
                    write_shutdown: false,
                    closed: false,
                }),
                reader: Mutex::new(Reader {
                    rx,
                    pending: None,
                    eof: false,
                }),
                tx,
                live,
                generation: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Bytes currently held for replay
    pub fn buffered_len(&self) -> usize {
        self.state().buffer.len()
    }

    /// Whether a connection is bound and flushed
    pub fn is_bound(&self) -> bool {
        self.state()
            .binding
            .as_ref()
            .map_or(false, |b| b.writer.is_some())
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Bind a phantom connection.
    ///
    /// Any previous binding is dropped and its unread bytes abandoned. The
    /// buffer, including bytes written while this flush is in progress, is
    /// written to `conn` before later writes pass straight through.
    pub async fn bind(&self, conn: BoxedStream) -> Result<BoundLink, DeferredError> {
        let (reader, mut writer) = tokio::io::split(conn);
        let activity = Arc::new(LinkActivity::new());
        let cancel = CancellationToken::new();

        let (generation, mut chunk) = {
            let mut state = self.state();
            if state.closed {
                return Err(DeferredError::Closed);
            }
            if let Some(old) = state.binding.take() {
                debug!("Replacing binding {}", old.generation);
                old.cancel.cancel();
            }
            state.generation += 1;
            let generation = state.generation;
            self.shared.generation.store(generation, Ordering::Release);
            state.binding = Some(Binding {
                generation,
                writer: None,
                cancel: cancel.clone(),
            });
            (generation, Bytes::copy_from_slice(&state.buffer))
        };

        let mut flushed = 0;
        let shutdown_pending = loop {
            if !chunk.is_empty() {
                let written = async {
                    writer.write_all(&chunk).await?;
                    writer.flush().await
                }
                .await;
                if let Err(e) = written {
                    self.release(generation);
                    return Err(DeferredError::Flush(e));
                }
                flushed += chunk.len();
            }

            let state = self.state();
            if state.closed {
                return Err(DeferredError::Closed);
            }
            if state.generation != generation {
                return Err(DeferredError::Superseded);
            }
            if state.buffer.len() > flushed {
                chunk = Bytes::copy_from_slice(&state.buffer[flushed..]);
                continue;
            }
            break state.write_shutdown;
        };

        if shutdown_pending {
            if let Err(e) = writer.shutdown().await {
                debug!("Deferred half-close failed: {}", e);
            }
        }

        {
            let mut state = self.state();
            let closed = state.closed;
            match state.binding.as_mut() {
                Some(binding) if binding.generation == generation && !closed => {
                    binding.writer = Some(writer);
                }
                _ => return Err(DeferredError::Superseded),
            }
        }

        if flushed > 0 {
            info!("Flushed {} bytes from buffer", flushed);
        }

        tokio::spawn(copy_inbound(
            reader,
            generation,
            self.shared.tx.clone(),
            self.shared.live.subscribe(),
            cancel,
            Arc::clone(&activity),
        ));

        Ok(BoundLink {
            generation,
            flushed,
            activity,
        })
    }

    /// Mark binding `generation` live: the replay buffer is dropped and no
    /// longer recorded.
    pub fn confirm_live(&self, generation: u64) -> bool {
        let mut state = self.state();
        if state.generation != generation || state.binding.is_none() {
            return false;
        }
        if state.replay {
            debug!("Link {} is live, dropping {} replay bytes", generation, state.buffer.len());
            state.replay = false;
            state.buffer = BytesMut::new();
        }
        self.shared.live.send_replace(generation);
        true
    }

    /// Drop binding `generation` if it is still current. The buffer stays.
    pub fn discard(&self, generation: u64) -> bool {
        let discarded = self.release(generation);
        if discarded {
            debug!("Discarded stale binding {}", generation);
        }
        discarded
    }

    fn release(&self, generation: u64) -> bool {
        let mut state = self.state();
        if state.binding.as_ref().map(|b| b.generation) != Some(generation) {
            return false;
        }
        if let Some(binding) = state.binding.take() {
            binding.cancel.cancel();
        }
        true
    }

    /// Close the bound connection, if any, and end the read side.
    pub fn close(&self) {
        let binding = {
            let mut state = self.state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.binding.take()
        };
        self.shared.closed.store(true, Ordering::Release);
        if let Some(binding) = binding {
            binding.cancel.cancel();
        }
        // A reader can only be parked on an empty pipe, so this never drops a wakeup
        let _ = self.shared.tx.try_send(Inbound::Closed);
    }
}

impl Default for DeferredConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DeferredConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("DeferredConnection")
            .field("buffered", &state.buffer.len())
            .field("generation", &state.generation)
            .field("bound", &state.binding.is_some())
            .field("closed", &state.closed)
            .finish()
    }
}

/// Copy bytes from a bound connection into the shared pipe until EOF,
/// error, or cancellation.
async fn copy_inbound(
    mut reader: ReadHalf<BoxedStream>,
    generation: u64,
    tx: mpsc::Sender<Inbound>,
    mut live: watch::Receiver<u64>,
    cancel: CancellationToken,
    activity: Arc<LinkActivity>,
) {
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    loop {
        buf.reserve(READ_CHUNK);
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            result = reader.read_buf(&mut buf) => match result {
                Ok(0) => Inbound::Eof { generation },
                Ok(n) => {
                    activity.record(n);
                    trace!("Received {} bytes on binding {}", n, generation);
                    Inbound::Data { generation, data: buf.split().freeze() }
                }
                Err(e) => {
                    debug!("Read from binding {} failed: {}", generation, e);
                    Inbound::Failed { generation, kind: e.kind() }
                }
            },
        };

        let last = !matches!(message, Inbound::Data { .. });
        if last {
            if activity.bytes_received() == 0 {
                debug!("Binding {} ended before sending data", generation);
                activity.mark_ended();
                break;
            }
            let confirmed = tokio::select! {
                _ = cancel.cancelled() => false,
                confirmed = wait_live(&mut live, generation) => confirmed,
            };
            if !confirmed {
                break;
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = tx.send(message) => {
                if sent.is_err() || last {
                    break;
                }
            }
        }
    }
}

/// Wait until `generation` is confirmed live
async fn wait_live(live: &mut watch::Receiver<u64>, generation: u64) -> bool {
    loop {
        if *live.borrow_and_update() == generation {
            return true;
        }
        if live.changed().await.is_err() {
            return false;
        }
    }
}

impl AsyncRead for DeferredConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut reader = self
            .shared
            .reader
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        loop {
            if let Some(mut data) = reader.pending.take() {
                let n = data.len().min(buf.remaining());
                buf.put_slice(&data[..n]);
                if n < data.len() {
                    reader.pending = Some(data.split_off(n));
                }
                return Poll::Ready(Ok(()));
            }

            if reader.eof || self.shared.closed.load(Ordering::Acquire) {
                return Poll::Ready(Ok(()));
            }

            let current = self.shared.generation.load(Ordering::Acquire);
            match reader.rx.poll_recv(cx) {
                Poll::Ready(Some(Inbound::Data { generation, data })) => {
                    if generation == current {
                        reader.pending = Some(data);
                    }
                }
                Poll::Ready(Some(Inbound::Eof { generation })) => {
                    if generation == current {
                        reader.eof = true;
                    }
                }
                Poll::Ready(Some(Inbound::Failed { generation, kind })) => {
                    if generation == current {
                        reader.eof = true;
                        return Poll::Ready(Err(io::Error::from(kind)));
                    }
                }
                Poll::Ready(Some(Inbound::Closed)) | Poll::Ready(None) => {
                    reader.eof = true;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for DeferredConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut guard = self.state();
        let state = &mut *guard;

        if state.closed {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }

        let writer = state.binding.as_mut().and_then(|b| b.writer.as_mut());
        match writer {
            None => {
                trace!("Buffering {} bytes to send later", buf.len());
                state.buffer.extend_from_slice(buf);
                Poll::Ready(Ok(buf.len()))
            }
            Some(writer) => match Pin::new(writer).poll_write(cx, buf) {
                Poll::Ready(Ok(n)) => {
                    if state.replay {
                        state.buffer.extend_from_slice(&buf[..n]);
                    }
                    Poll::Ready(Ok(n))
                }
                Poll::Ready(Err(e)) => {
                    warn!("Write to phantom connection failed: {}", e);
                    if state.replay {
                        state.buffer.extend_from_slice(buf);
                    }
                    Poll::Ready(Ok(buf.len()))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut state = self.state();
        match state.binding.as_mut().and_then(|b| b.writer.as_mut()) {
            Some(writer) => match Pin::new(writer).poll_flush(cx) {
                Poll::Ready(Err(e)) => {
                    debug!("Flush to phantom connection failed: {}", e);
                    Poll::Ready(Ok(()))
                }
                other => other,
            },
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut state = self.state();
        state.write_shutdown = true;
        match state.binding.as_mut().and_then(|b| b.writer.as_mut()) {
            Some(writer) => Pin::new(writer).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

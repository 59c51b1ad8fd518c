//! Staleness detection for freshly bound phantom connections
//!
//! A station may accept a registration and still never route traffic to the
//! phantom. Such a connection looks healthy but stays silent. The monitor
//! gives each binding a fixed window to deliver its first byte. Once a byte
//! arrives the link is live for good; later idle periods are normal on a
//! proxied circuit and are never treated as staleness. A connection that
//! closes before delivering anything is stale at once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Receive-side activity of one binding
#[derive(Debug)]
pub struct LinkActivity {
    bound_at: Instant,
    last_received: watch::Sender<Option<Instant>>,
    bytes_received: AtomicU64,
    /// Fired when the connection ends before proving live
    ended: CancellationToken,
}

impl LinkActivity {
    pub(crate) fn new() -> Self {
        let (last_received, _) = watch::channel(None);
        Self {
            bound_at: Instant::now(),
            last_received,
            bytes_received: AtomicU64::new(0),
            ended: CancellationToken::new(),
        }
    }

    /// Record `n` bytes read from the phantom connection
    pub(crate) fn record(&self, n: usize) {
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
        self.last_received.send_replace(Some(Instant::now()));
    }

    /// Record that the connection closed or failed without sending anything
    pub(crate) fn mark_ended(&self) {
        self.ended.cancel();
    }

    /// Whether the connection ended before its first byte
    pub fn has_ended(&self) -> bool {
        self.ended.is_cancelled()
    }

    /// When the connection was bound
    pub fn bound_at(&self) -> Instant {
        self.bound_at
    }

    /// Instant of the most recent receipt, if any
    pub fn last_received(&self) -> Option<Instant> {
        *self.last_received.borrow()
    }

    /// Total bytes received on this binding
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Start of the current silence window
    fn idle_since(&self) -> Instant {
        self.last_received().unwrap_or(self.bound_at)
    }

    fn subscribe(&self) -> watch::Receiver<Option<Instant>> {
        self.last_received.subscribe()
    }
}

/// Outcome of watching one binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// At least one byte arrived inside the window
    Live,
    /// The window elapsed with nothing received
    Stale,
    /// The handler shut down first
    Shutdown,
}

/// Decides whether a bound connection ever carries inbound traffic
#[derive(Debug, Clone, Copy)]
pub struct StalenessMonitor {
    timeout: Duration,
}

impl StalenessMonitor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Watch `activity` until it proves live, goes stale, or `shutdown` fires.
    ///
    /// Returns at the first received byte and never fires afterwards.
    pub async fn watch(&self, activity: &LinkActivity, shutdown: &CancellationToken) -> Verdict {
        let mut received = activity.subscribe();

        loop {
            if activity.last_received().is_some() {
                info!("Received data, connection is not stale");
                return Verdict::Live;
            }

            if activity.has_ended() {
                info!("Connection to the station closed before sending data, resetting it");
                return Verdict::Stale;
            }

            let deadline = activity.idle_since() + self.timeout;
            if Instant::now() >= deadline {
                info!(
                    "Connection to the station timed out after {:?}, resetting stale connection",
                    self.timeout
                );
                return Verdict::Stale;
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!("Staleness monitor stopped");
                    return Verdict::Shutdown;
                }
                changed = received.changed() => {
                    if changed.is_err() {
                        // Sender lives in `activity`, which outlives this borrow
                        return Verdict::Shutdown;
                    }
                }
                _ = activity.ended.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }
}

impl Default for StalenessMonitor {
    fn default() -> Self {
        Self::new(super::STALENESS_TIMEOUT)
    }
}

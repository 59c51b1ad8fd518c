//! Registration retry loop
//!
//! ```text
//! Attempting ──fail──▶ backoff ──▶ Attempting
//!     │
//!     └─ok─▶ Bound ──stale / deadline──▶ Attempting
//!              │
//!              └─live──▶ done
//! ```
//!
//! Shutdown ends the loop from any state.

use super::deferred::DeferredConnection;
use super::registrar::{Registrar, RegistrationRequest};
use super::staleness::{StalenessMonitor, Verdict};
use super::RetryPolicy;
use crate::pt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How the loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    /// A binding proved live after `attempts` registrations
    Live { attempts: u32 },
    /// Shutdown fired after `attempts` registrations
    ShutDown { attempts: u32 },
}

impl LoopOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            LoopOutcome::Live { attempts } | LoopOutcome::ShutDown { attempts } => *attempts,
        }
    }
}

/// Registers repeatedly until one phantom connection proves live
pub struct RegistrationRetryLoop {
    registrar: Arc<dyn Registrar>,
    request: RegistrationRequest,
    policy: RetryPolicy,
}

impl RegistrationRetryLoop {
    pub fn new(
        registrar: Arc<dyn Registrar>,
        request: RegistrationRequest,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            registrar,
            request,
            policy,
        }
    }

    /// Run until a binding on `conn` is live or `shutdown` fires
    pub async fn run(&self, conn: &DeferredConnection, shutdown: &CancellationToken) -> LoopOutcome {
        let monitor = StalenessMonitor::new(self.policy.staleness_timeout);
        let mut attempts = 0;

        loop {
            if shutdown.is_cancelled() {
                return LoopOutcome::ShutDown { attempts };
            }
            attempts += 1;
            debug!("Registration attempt {}", attempts);

            let registered = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Registration loop stopped");
                    return LoopOutcome::ShutDown { attempts };
                }
                result = self.registrar.register(&self.request) => result,
            };

            let stream = match registered {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Error registering with station: {}", e);
                    warn!("This may be due to high load, trying again");
                    pt::log(
                        pt::Severity::Notice,
                        "retrying conjure registration, station is under high load",
                    );
                    if !self.backoff(shutdown).await {
                        return LoopOutcome::ShutDown { attempts };
                    }
                    continue;
                }
            };

            let link = match conn.bind(stream).await {
                Ok(link) => link,
                Err(e) => {
                    warn!("Error setting internal conn: {}", e);
                    if !self.backoff(shutdown).await {
                        return LoopOutcome::ShutDown { attempts };
                    }
                    continue;
                }
            };
            info!(
                "Connected to bridge at {} (binding {}, {} bytes flushed)",
                self.request.bridge_address, link.generation, link.flushed
            );

            let watching = shutdown.child_token();
            let mut verdict = tokio::spawn({
                let activity = Arc::clone(&link.activity);
                let watching = watching.clone();
                async move { monitor.watch(&activity, &watching).await }
            });

            let verdict = tokio::select! {
                biased;
                _ = shutdown.cancelled() => Verdict::Shutdown,
                joined = &mut verdict => joined.unwrap_or(Verdict::Shutdown),
                _ = tokio::time::sleep(self.policy.retry_interval) => {
                    debug!("No verdict within {:?}, re-registering", self.policy.retry_interval);
                    Verdict::Stale
                }
            };
            watching.cancel();

            match verdict {
                Verdict::Live => {
                    conn.confirm_live(link.generation);
                    info!("Phantom connection is live after {} attempt(s)", attempts);
                    return LoopOutcome::Live { attempts };
                }
                Verdict::Stale => {
                    conn.discard(link.generation);
                }
                Verdict::Shutdown => {
                    info!("Registration loop stopped");
                    return LoopOutcome::ShutDown { attempts };
                }
            }
        }
    }

    /// Wait out the retry interval. Returns false if shutdown fired first.
    async fn backoff(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!("Registration loop stopped");
                false
            }
            _ = tokio::time::sleep(self.policy.retry_interval) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rendezvous::{BoxedStream, RegistrationError};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc;

    /// What the scripted registrar does on each call
    enum Step {
        Fail,
        /// Hand out a connection; the remote end goes to the test
        Connect,
    }

    struct ScriptedRegistrar {
        steps: Mutex<VecDeque<Step>>,
        calls: AtomicU32,
        remotes: mpsc::UnboundedSender<DuplexStream>,
    }

    impl ScriptedRegistrar {
        fn new(steps: Vec<Step>) -> (Arc<Self>, mpsc::UnboundedReceiver<DuplexStream>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let registrar = Arc::new(Self {
                steps: Mutex::new(steps.into()),
                calls: AtomicU32::new(0),
                remotes: tx,
            });
            (registrar, rx)
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Registrar for ScriptedRegistrar {
        async fn register(
            &self,
            _request: &RegistrationRequest,
        ) -> Result<BoxedStream, RegistrationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let step = self.steps.lock().unwrap().pop_front();
            match step {
                Some(Step::Connect) => {
                    let (local, remote) = duplex(64 * 1024);
                    self.remotes.send(remote).unwrap();
                    Ok(Box::new(local))
                }
                Some(Step::Fail) => Err(RegistrationError::Rejected("station busy".into())),
                None => std::future::pending().await,
            }
        }
    }

    fn retry_loop(registrar: Arc<ScriptedRegistrar>) -> RegistrationRetryLoop {
        let request = RegistrationRequest {
            bridge_address: "192.0.2.1:443".to_string(),
            ..Default::default()
        };
        RegistrationRetryLoop::new(registrar, request, RetryPolicy::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_then_live() {
        let (registrar, mut remotes) =
            ScriptedRegistrar::new(vec![Step::Fail, Step::Fail, Step::Connect]);
        let mut conn = DeferredConnection::new();
        conn.write_all(&[7u8; 100]).await.unwrap();

        let shutdown = CancellationToken::new();
        let run = tokio::spawn({
            let retry = retry_loop(Arc::clone(&registrar));
            let conn = conn.clone();
            let shutdown = shutdown.clone();
            async move { retry.run(&conn, &shutdown).await }
        });

        let mut remote = remotes.recv().await.unwrap();
        let mut buf = [0u8; 100];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [7u8; 100]);
        remote.write_all(b"ok").await.unwrap();

        assert_eq!(run.await.unwrap(), LoopOutcome::Live { attempts: 3 });
        assert_eq!(registrar.calls(), 3);
        assert_eq!(conn.buffered_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_binding_is_replaced() {
        let (registrar, mut remotes) = ScriptedRegistrar::new(vec![Step::Connect, Step::Connect]);
        let mut conn = DeferredConnection::new();
        conn.write_all(b"client hello").await.unwrap();

        let shutdown = CancellationToken::new();
        let run = tokio::spawn({
            let retry = retry_loop(Arc::clone(&registrar));
            let conn = conn.clone();
            let shutdown = shutdown.clone();
            async move { retry.run(&conn, &shutdown).await }
        });

        // First phantom receives the buffer but never answers
        let mut silent = remotes.recv().await.unwrap();
        let mut buf = [0u8; 12];
        silent.read_exact(&mut buf).await.unwrap();

        // After the staleness timeout the loop registers again and replays
        let mut second = remotes.recv().await.unwrap();
        second.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"client hello");

        // The stale connection was closed
        let mut byte = [0u8; 1];
        assert_eq!(silent.read(&mut byte).await.unwrap(), 0);

        second.write_all(b"server hello").await.unwrap();
        assert_eq!(run.await.unwrap(), LoopOutcome::Live { attempts: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_byte_then_idle_stays_live() {
        let (registrar, mut remotes) = ScriptedRegistrar::new(vec![Step::Connect, Step::Connect]);
        let mut conn = DeferredConnection::new();
        let shutdown = CancellationToken::new();
        let run = tokio::spawn({
            let retry = retry_loop(Arc::clone(&registrar));
            let conn = conn.clone();
            let shutdown = shutdown.clone();
            async move { retry.run(&conn, &shutdown).await }
        });

        let mut remote = remotes.recv().await.unwrap();
        remote.write_all(b"!").await.unwrap();
        assert_eq!(run.await.unwrap(), LoopOutcome::Live { attempts: 1 });

        // Idle well past the staleness timeout
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(conn.is_bound());
        assert_eq!(registrar.calls(), 1);

        let mut byte = [0u8; 1];
        conn.read_exact(&mut byte).await.unwrap();
        assert_eq!(&byte, b"!");

        conn.write_all(b"?").await.unwrap();
        remote.read_exact(&mut byte).await.unwrap();
        assert_eq!(&byte, b"?");
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_attempts_after_live() {
        let (registrar, mut remotes) = ScriptedRegistrar::new(vec![
            Step::Connect,
            Step::Connect,
            Step::Connect,
            Step::Connect,
        ]);
        let conn = DeferredConnection::new();
        let shutdown = CancellationToken::new();
        let run = tokio::spawn({
            let retry = retry_loop(Arc::clone(&registrar));
            let conn = conn.clone();
            let shutdown = shutdown.clone();
            async move { retry.run(&conn, &shutdown).await }
        });

        let _stale = remotes.recv().await.unwrap();
        let mut live = remotes.recv().await.unwrap();
        live.write_all(b"x").await.unwrap();

        assert_eq!(run.await.unwrap(), LoopOutcome::Live { attempts: 2 });
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(registrar.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_backoff() {
        let (registrar, _remotes) = ScriptedRegistrar::new(vec![Step::Fail, Step::Fail]);
        let conn = DeferredConnection::new();
        let shutdown = CancellationToken::new();
        let run = tokio::spawn({
            let retry = retry_loop(Arc::clone(&registrar));
            let conn = conn.clone();
            let shutdown = shutdown.clone();
            async move { retry.run(&conn, &shutdown).await }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.cancel();
        shutdown.cancel();

        assert_eq!(run.await.unwrap(), LoopOutcome::ShutDown { attempts: 1 });
        assert_eq!(registrar.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_registration() {
        // An empty script makes every call hang
        let (registrar, _remotes) = ScriptedRegistrar::new(vec![]);
        let conn = DeferredConnection::new();
        let shutdown = CancellationToken::new();
        let run = tokio::spawn({
            let retry = retry_loop(Arc::clone(&registrar));
            let conn = conn.clone();
            let shutdown = shutdown.clone();
            async move { retry.run(&conn, &shutdown).await }
        });

        tokio::time::sleep(Duration::from_secs(30)).await;
        shutdown.cancel();
        assert_eq!(run.await.unwrap(), LoopOutcome::ShutDown { attempts: 1 });

        let outcome = retry_loop(registrar).run(&conn, &shutdown).await;
        assert_eq!(outcome, LoopOutcome::ShutDown { attempts: 0 });
    }
}

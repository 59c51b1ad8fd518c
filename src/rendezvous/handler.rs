//! Per-client connection handler
//!
//! The client is granted before this runs. The handler buffers the client's
//! bytes in a [`DeferredConnection`], registers in the background and relays
//! until either side is done. The relay only drains once a phantom
//! connection is bound; before that there is nothing in flight to wait for.

use super::deferred::DeferredConnection;
use super::registrar::{Registrar, RegistrationRequest};
use super::retry::{LoopOutcome, RegistrationRetryLoop};
use super::RetryPolicy;
use crate::relay::{RelayPump, RelayStats};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// What happened to one client connection
#[derive(Debug, Clone, Copy)]
pub struct HandlerReport {
    /// Bytes relayed; `a_to_b` is client to phantom
    pub stats: RelayStats,
    /// How registration ended, if the loop could be joined
    pub registration: Option<LoopOutcome>,
}

/// Runs the rendezvous and relay for accepted client streams
#[derive(Clone)]
pub struct ConnectionHandler {
    registrar: Arc<dyn Registrar>,
    policy: RetryPolicy,
    relay: RelayPump,
}

impl ConnectionHandler {
    pub fn new(registrar: Arc<dyn Registrar>, policy: RetryPolicy, relay: RelayPump) -> Self {
        Self {
            registrar,
            policy,
            relay,
        }
    }

    /// Handle one client stream until the relay completes
    pub async fn handle<S>(&self, client: S, request: RegistrationRequest) -> HandlerReport
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let bridge = request.bridge_address.clone();
        let phantom = DeferredConnection::new();
        let shutdown = CancellationToken::new();

        let registration = tokio::spawn({
            let retry = RegistrationRetryLoop::new(Arc::clone(&self.registrar), request, self.policy);
            let phantom = phantom.clone();
            let shutdown = shutdown.clone();
            async move { retry.run(&phantom, &shutdown).await }
        });

        let gate = phantom.clone();
        let stats = self
            .relay
            .run_gated(client, phantom.clone(), move || gate.is_bound())
            .await;
        info!("Closed connection to phantom proxy");

        shutdown.cancel();
        phantom.close();

        let registration = registration.await.ok();
        debug!(
            "Connection to {} done: {} bytes up, {} bytes down, registration {:?}",
            bridge, stats.a_to_b, stats.b_to_a, registration
        );

        HandlerReport {
            stats,
            registration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rendezvous::{BoxedStream, RegistrationError};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// Never completes a registration
    struct HangingRegistrar;

    #[async_trait]
    impl Registrar for HangingRegistrar {
        async fn register(
            &self,
            _request: &RegistrationRequest,
        ) -> Result<BoxedStream, RegistrationError> {
            std::future::pending().await
        }
    }

    /// Registers instantly against an echo peer
    struct EchoRegistrar;

    #[async_trait]
    impl Registrar for EchoRegistrar {
        async fn register(
            &self,
            _request: &RegistrationRequest,
        ) -> Result<BoxedStream, RegistrationError> {
            let (local, mut remote) = duplex(4096);
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match remote.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if remote.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
            Ok(Box::new(local))
        }
    }

    /// Hands out prepared phantom connections in order, then hangs
    #[derive(Default)]
    struct QueueRegistrar {
        streams: Mutex<VecDeque<DuplexStream>>,
        calls: AtomicUsize,
    }

    impl QueueRegistrar {
        fn with(streams: Vec<DuplexStream>) -> Arc<Self> {
            Arc::new(Self {
                streams: Mutex::new(streams.into()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Registrar for QueueRegistrar {
        async fn register(
            &self,
            _request: &RegistrationRequest,
        ) -> Result<BoxedStream, RegistrationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.streams.lock().unwrap().pop_front();
            match next {
                Some(stream) => Ok(Box::new(stream)),
                None => std::future::pending().await,
            }
        }
    }

    fn handler(registrar: Arc<dyn Registrar>) -> ConnectionHandler {
        ConnectionHandler::new(
            registrar,
            RetryPolicy::default(),
            RelayPump::new(Duration::from_secs(1)),
        )
    }

    #[tokio::test]
    async fn test_echo_through_phantom() {
        let (client, mut user) = duplex(4096);
        let handler = handler(Arc::new(EchoRegistrar));
        let task = tokio::spawn(async move {
            handler.handle(client, RegistrationRequest::default()).await
        });

        user.write_all(b"hello bridge").await.unwrap();
        let mut buf = [0u8; 12];
        user.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello bridge");

        // Let the retry loop observe the echo before hanging up
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(user);
        let report = task.await.unwrap();
        assert_eq!(report.stats.a_to_b, 12);
        assert_eq!(report.stats.b_to_a, 12);
        assert_eq!(report.registration, Some(LoopOutcome::Live { attempts: 1 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_close_stops_registration() {
        let (client, user) = duplex(4096);
        let handler = handler(Arc::new(HangingRegistrar));
        let task = tokio::spawn(async move {
            handler.handle(client, RegistrationRequest::default()).await
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(user);

        let report = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("handler should finish after the drain period")
            .unwrap();
        assert_eq!(report.registration, Some(LoopOutcome::ShutDown { attempts: 1 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbound_client_close_is_prompt_with_defaults() {
        let (client, user) = duplex(4096);
        let handler = ConnectionHandler::new(
            Arc::new(HangingRegistrar),
            RetryPolicy::default(),
            RelayPump::default(),
        );
        let task = tokio::spawn(async move {
            handler.handle(client, RegistrationRequest::default()).await
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        let dropped = tokio::time::Instant::now();
        drop(user);

        let report = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("nothing is in flight before a phantom is bound")
            .unwrap();
        assert!(dropped.elapsed() < Duration::from_millis(100));
        assert_eq!(report.registration, Some(LoopOutcome::ShutDown { attempts: 1 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bound_client_close_waits_at_most_one_drain() {
        let (phantom, mut remote) = duplex(4096);
        let registrar = QueueRegistrar::with(vec![phantom]);
        let (client, mut user) = duplex(4096);
        let handler = ConnectionHandler::new(
            registrar.clone(),
            RetryPolicy::default(),
            RelayPump::default(),
        );
        let task = tokio::spawn(async move {
            handler.handle(client, RegistrationRequest::default()).await
        });

        user.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        remote.read_exact(&mut buf).await.unwrap();
        remote.write_all(b"pong").await.unwrap();
        user.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // The remote keeps its side open
        let dropped = tokio::time::Instant::now();
        drop(user);
        let report = task.await.unwrap();
        assert!(dropped.elapsed() <= Duration::from_secs(1) + Duration::from_millis(10));
        assert_eq!(report.registration, Some(LoopOutcome::Live { attempts: 1 }));
        drop(remote);
    }

    #[tokio::test(start_paused = true)]
    async fn test_phantom_closing_without_data_is_replaced() {
        let (first, mut first_remote) = duplex(4096);
        let (second, mut second_remote) = duplex(4096);
        let registrar = QueueRegistrar::with(vec![first, second]);

        tokio::spawn(async move {
            let mut buf = [0u8; 5];
            first_remote.read_exact(&mut buf).await.unwrap();
            // Closes without answering
        });
        tokio::spawn(async move {
            let mut buf = [0u8; 5];
            second_remote.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            second_remote.write_all(b"world").await.unwrap();
            let mut rest = Vec::new();
            let _ = second_remote.read_to_end(&mut rest).await;
        });

        let (client, mut user) = duplex(4096);
        let task = tokio::spawn({
            let handler = handler(registrar.clone());
            async move { handler.handle(client, RegistrationRequest::default()).await }
        });

        user.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        user.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");
        assert_eq!(registrar.calls.load(Ordering::SeqCst), 2);

        drop(user);
        let report = task.await.unwrap();
        assert_eq!(report.registration, Some(LoopOutcome::Live { attempts: 2 }));
    }
}

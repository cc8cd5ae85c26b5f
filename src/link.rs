//! Link establishment with unbounded retry.
//!
//! Every role reaches its peers the same way: try to connect, and on failure
//! wait out the backoff and try again, forever. Once connected, the link's
//! connectivity events are logged from a background task for as long as the
//! link lives.

use crate::transport::{Connector, Endpoint, LinkEvent};
use crate::{Error, Result};
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Interval between connection attempts unless configured otherwise.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Decides how long to wait before the next connection attempt.
pub trait BackoffPolicy: Send + Sync {
    /// Delay after the `attempt`-th consecutive failure (1-based).
    fn delay(&self, attempt: u32) -> Duration;
}

/// Waits the same interval after every failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedBackoff {
    interval: Duration,
}

impl FixedBackoff {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl Default for FixedBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_INTERVAL)
    }
}

impl BackoffPolicy for FixedBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        self.interval
    }
}

/// Connects a role to its peer, retrying until it succeeds.
///
/// # Examples
///
/// ```
/// use mqbench::link::{FixedBackoff, LinkEstablisher};
/// use mqbench::transport::memory::{pair, MemoryConnector};
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> mqbench::Result<()> {
/// let (local, _remote) = pair();
/// let connector = MemoryConnector::new("broker", local).failing_first(2);
///
/// let link = LinkEstablisher::new("sender")
///     .with_backoff(FixedBackoff::new(Duration::from_millis(1)));
/// let _endpoint = link.establish(&connector).await?;
/// assert_eq!(connector.attempts(), 3);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct LinkEstablisher {
    role: String,
    backoff: Arc<dyn BackoffPolicy>,
    cancellation_token: CancellationToken,
}

impl LinkEstablisher {
    /// Creates an establisher that tags its log lines with `role`.
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            backoff: Arc::new(FixedBackoff::default()),
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn with_backoff<B: BackoffPolicy + 'static>(mut self, backoff: B) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    /// Stops retrying once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    pub fn backoff(&self) -> Arc<dyn BackoffPolicy> {
        self.backoff.clone()
    }

    /// Connects through `connector`, retrying on every failure.
    ///
    /// # Errors
    ///
    /// Only fails with `Error::Cancelled` if the cancellation token fires;
    /// connection errors are logged and retried.
    pub async fn establish<C: Connector>(&self, connector: &C) -> Result<Endpoint> {
        let peer = connector.peer();
        let mut attempt = 0u32;

        loop {
            if self.cancellation_token.is_cancelled() {
                return Err(Error::Cancelled);
            }

            match connector.connect().await {
                Ok(mut endpoint) => {
                    info!("[{}] connected to {}", self.role, peer);
                    if let Some(events) = endpoint.take_events() {
                        tokio::spawn(log_link_events(self.role.clone(), events));
                    }
                    return Ok(endpoint);
                }
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    let delay = self.backoff.delay(attempt);
                    warn!(
                        "[{}] cannot reach {} (attempt {}): {}; retrying in {:?}",
                        self.role, peer, attempt, e, delay
                    );
                    tokio::select! {
                        _ = self.cancellation_token.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

/// Logs connectivity transitions until the link's event stream closes.
pub async fn log_link_events(role: String, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            LinkEvent::PeerConnected(peer) => info!("[{}] peer connected: {}", role, peer),
            LinkEvent::PeerDisconnected(peer) => warn!("[{}] peer disconnected: {}", role, peer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{pair, MemoryConnector};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct RecordingBackoff {
        calls: AtomicU32,
    }

    impl BackoffPolicy for RecordingBackoff {
        fn delay(&self, attempt: u32) -> Duration {
            self.calls.store(attempt, Ordering::SeqCst);
            Duration::from_millis(1)
        }
    }

    #[test]
    fn test_fixed_backoff_default() {
        let backoff = FixedBackoff::default();
        assert_eq!(backoff.delay(1), Duration::from_secs(5));
        assert_eq!(backoff.delay(100), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_retries_until_connected() {
        let (local, _remote) = pair();
        let connector = MemoryConnector::new("peer", local).failing_first(4);
        let link = LinkEstablisher::new("test").with_backoff(RecordingBackoff {
            calls: AtomicU32::new(0),
        });

        let endpoint = link.establish(&connector).await;
        assert!(endpoint.is_ok());
        assert_eq!(connector.attempts(), 5);
    }

    #[tokio::test]
    async fn test_backoff_sees_attempt_numbers() {
        let (local, _remote) = pair();
        let connector = MemoryConnector::new("peer", local).failing_first(3);
        let backoff = Arc::new(RecordingBackoff {
            calls: AtomicU32::new(0),
        });

        struct Shared(Arc<RecordingBackoff>);
        impl BackoffPolicy for Shared {
            fn delay(&self, attempt: u32) -> Duration {
                self.0.delay(attempt)
            }
        }

        let link = LinkEstablisher::new("test").with_backoff(Shared(backoff.clone()));
        link.establish(&connector).await.unwrap();
        assert_eq!(backoff.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancel_while_retrying() {
        let (local, _remote) = pair();
        let connector = MemoryConnector::new("peer", local).failing_first(usize::MAX);
        let token = CancellationToken::new();
        let link = LinkEstablisher::new("test")
            .with_backoff(FixedBackoff::new(Duration::from_secs(60)))
            .with_cancellation(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let result = tokio::time::timeout(Duration::from_secs(5), link.establish(&connector))
            .await
            .expect("establish should return after cancellation");
        assert!(matches!(result, Err(Error::Cancelled)));
        canceller.await.unwrap();
    }
}

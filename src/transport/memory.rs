//! In-process transport.
//!
//! [`pair`] returns two endpoints wired back to back: whatever one publishes
//! the other receives, in order. [`lossy_pair`] puts a filter task on the
//! first-to-second direction to simulate drops. [`MemoryConnector`] hands out
//! a prepared endpoint through the [`Connector`] interface and can be told to
//! fail a number of attempts first.

use super::{Connector, Endpoint, LinkEvent, Packet, Publisher, Subscription};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn endpoint(
    tx: mpsc::UnboundedSender<Packet>,
    rx: mpsc::UnboundedReceiver<Packet>,
    peer: &str,
) -> Endpoint {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let _ = event_tx.send(LinkEvent::PeerConnected(peer.to_string()));
    Endpoint::new(Publisher::new(tx), Subscription::new(rx), event_rx)
}

/// Two endpoints connected to each other.
pub fn pair() -> (Endpoint, Endpoint) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (endpoint(a_tx, a_rx, "memory-b"), endpoint(b_tx, b_rx, "memory-a"))
}

/// Like [`pair`], but packets from the first endpoint to the second are
/// dropped whenever `keep` returns `false`.
///
/// Must be called from within a tokio runtime.
pub fn lossy_pair<F>(keep: F) -> (Endpoint, Endpoint)
where
    F: FnMut(&Packet) -> bool + Send + 'static,
{
    let (a_tx, mut filter_rx) = mpsc::unbounded_channel::<Packet>();
    let (filter_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();

    let shutdown = CancellationToken::new();
    let stop = shutdown.clone();
    let mut keep = keep;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                packet = filter_rx.recv() => match packet {
                    Some(packet) => {
                        if keep(&packet) && filter_tx.send(packet).is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    });

    (
        endpoint(a_tx, a_rx, "memory-b").with_shutdown(shutdown),
        endpoint(b_tx, b_rx, "memory-a"),
    )
}

/// Serves one prepared endpoint through [`Connector`].
pub struct MemoryConnector {
    name: String,
    endpoint: Mutex<Option<Endpoint>>,
    failures_left: AtomicUsize,
    attempts: AtomicUsize,
}

impl MemoryConnector {
    pub fn new(name: impl Into<String>, endpoint: Endpoint) -> Self {
        Self {
            name: name.into(),
            endpoint: Mutex::new(Some(endpoint)),
            failures_left: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Makes the first `failures` connection attempts fail.
    pub fn failing_first(self, failures: usize) -> Self {
        self.failures_left.store(failures, Ordering::SeqCst);
        self
    }

    /// Number of connection attempts made so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Connector for MemoryConnector {
    fn peer(&self) -> String {
        self.name.clone()
    }

    async fn connect(&self) -> Result<Endpoint> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(Error::Connection(format!("{} is unreachable", self.name)));
        }
        self.endpoint
            .lock()
            .take()
            .ok_or_else(|| Error::Connection(format!("{} is already connected", self.name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Topic;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_pair_delivers_both_ways() {
        let (mut a, mut b) = pair();

        a.publisher.publish(Packet::data(vec![1u8, 2])).unwrap();
        let got = b.subscription.recv().await.unwrap();
        assert_eq!(got.topic, Topic::Data);
        assert_eq!(got.payload, Bytes::from_static(&[1, 2]));

        b.publisher.publish(Packet::signal(vec![9u8])).unwrap();
        assert_eq!(a.subscription.recv().await.unwrap().topic, Topic::Signal);
    }

    #[tokio::test]
    async fn test_pair_reports_connected() {
        let (mut a, _b) = pair();
        let mut events = a.take_events().unwrap();
        assert_eq!(
            events.recv().await,
            Some(LinkEvent::PeerConnected("memory-b".to_string()))
        );
    }

    #[tokio::test]
    async fn test_lossy_pair_drops() {
        let mut n = 0u32;
        let (a, mut b) = lossy_pair(move |_| {
            n += 1;
            n % 2 == 0
        });
        for i in 0..10u8 {
            a.publisher.publish(Packet::data(vec![i])).unwrap();
        }
        let mut received = Vec::new();
        for _ in 0..5 {
            received.push(b.subscription.recv().await.unwrap().payload[0]);
        }
        assert_eq!(received, vec![1, 3, 5, 7, 9]);
    }

    #[tokio::test]
    async fn test_connector_fails_first() {
        let (a, _b) = pair();
        let connector = MemoryConnector::new("peer", a).failing_first(2);
        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_ok());
        assert!(connector.connect().await.is_err());
        assert_eq!(connector.attempts(), 4);
    }
}

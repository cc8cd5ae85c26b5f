//! Broker role: a pass-through hop between the sender side and the receiver side.
//!
//! Packets are forwarded verbatim in both directions, whatever their topic.
//! The relay never looks inside a payload.

use crate::link::LinkEstablisher;
use crate::transport::{Connector, Endpoint, Packet};
use crate::{Error, Result};
use log::{error, info};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Forwarding counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStats {
    /// Packets passed from the upstream (sender) side to downstream
    pub downstream_packets: u64,
    /// Packets passed from the downstream (receiver) side to upstream
    pub upstream_packets: u64,
    /// Payload bytes forwarded in either direction
    pub bytes: u64,
}

/// Forwards packets between two independently established links.
///
/// # Examples
///
/// ```
/// use mqbench::relay::Relay;
/// use mqbench::transport::memory::{pair, MemoryConnector};
/// use mqbench::transport::Packet;
///
/// # #[tokio::main]
/// # async fn main() -> mqbench::Result<()> {
/// let (up_near, mut sender) = pair();
/// let (down_near, mut receiver) = pair();
/// let mut relay = Relay::new(
///     MemoryConnector::new("sender", up_near),
///     MemoryConnector::new("receiver", down_near),
/// );
/// let cancel = relay.cancellation_token().clone();
/// let task = tokio::spawn(async move { relay.run().await });
///
/// sender.publisher.publish(Packet::data(vec![1u8, 2, 3]))?;
/// let packet = receiver.subscription.recv().await.unwrap();
/// assert_eq!(&packet.payload[..], &[1, 2, 3]);
///
/// cancel.cancel();
/// let stats = task.await.unwrap()?;
/// assert_eq!(stats.downstream_packets, 1);
/// # Ok(())
/// # }
/// ```
pub struct Relay<U: Connector, D: Connector> {
    upstream: U,
    downstream: D,
    upstream_link: LinkEstablisher,
    downstream_link: LinkEstablisher,
    stats: RelayStats,
    cancellation_token: CancellationToken,
}

impl<U: Connector, D: Connector> Relay<U, D> {
    pub fn new(upstream: U, downstream: D) -> Self {
        let cancellation_token = CancellationToken::new();
        Self {
            upstream,
            downstream,
            upstream_link: LinkEstablisher::new("BROKER/upstream")
                .with_cancellation(cancellation_token.clone()),
            downstream_link: LinkEstablisher::new("BROKER/downstream")
                .with_cancellation(cancellation_token.clone()),
            stats: RelayStats::default(),
            cancellation_token,
        }
    }

    /// Replaces both link establishers, keeping them tied to this relay's cancellation.
    pub fn with_links(mut self, upstream: LinkEstablisher, downstream: LinkEstablisher) -> Self {
        self.upstream_link = upstream.with_cancellation(self.cancellation_token.clone());
        self.downstream_link = downstream.with_cancellation(self.cancellation_token.clone());
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    pub fn stats(&self) -> RelayStats {
        self.stats
    }

    /// Establishes both links, then forwards until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `Error::Cancelled` if cancelled before both links are up, and
    /// a transport error if either link closes or refuses a packet.
    pub async fn run(&mut self) -> Result<RelayStats> {
        let (mut upstream, mut downstream) = tokio::try_join!(
            self.upstream_link.establish(&self.upstream),
            self.downstream_link.establish(&self.downstream),
        )?;
        info!("[BROKER] Ready!");

        let result = self.forward(&mut upstream, &mut downstream).await;
        if let Err(e) = &result {
            error!("[BROKER] forwarding stopped: {}", e);
        }
        info!(
            "[BROKER] forwarded {} downstream, {} upstream",
            self.stats.downstream_packets, self.stats.upstream_packets
        );
        result.map(|_| self.stats)
    }

    async fn forward(&mut self, upstream: &mut Endpoint, downstream: &mut Endpoint) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.cancellation_token.cancelled() => return Ok(()),
                packet = upstream.subscription.recv() => {
                    let packet = packet.ok_or_else(|| closed("upstream"))?;
                    self.stats.bytes += packet.payload.len() as u64;
                    pass(downstream, packet)?;
                    self.stats.downstream_packets += 1;
                }
                packet = downstream.subscription.recv() => {
                    let packet = packet.ok_or_else(|| closed("downstream"))?;
                    self.stats.bytes += packet.payload.len() as u64;
                    pass(upstream, packet)?;
                    self.stats.upstream_packets += 1;
                }
            }
        }
    }
}

fn pass(to: &Endpoint, packet: Packet) -> Result<()> {
    to.publisher.publish(packet)
}

fn closed(side: &str) -> Error {
    Error::Transport(format!("{} link closed", side))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{pair, MemoryConnector};
    use crate::transport::Topic;
    use std::time::Duration;

    #[tokio::test]
    async fn test_forwards_both_directions() {
        let (up_near, mut sender) = pair();
        let (down_near, mut receiver) = pair();
        let mut relay = Relay::new(
            MemoryConnector::new("sender", up_near),
            MemoryConnector::new("receiver", down_near),
        );
        let cancel = relay.cancellation_token().clone();
        let task = tokio::spawn(async move { relay.run().await });

        sender.publisher.publish(Packet::data(vec![9u8; 4])).unwrap();
        let forwarded = receiver.subscription.recv().await.unwrap();
        assert_eq!(forwarded.topic, Topic::Data);
        assert_eq!(&forwarded.payload[..], &[9, 9, 9, 9]);

        receiver.publisher.publish(Packet::signal(b"{}".to_vec())).unwrap();
        let back = sender.subscription.recv().await.unwrap();
        assert_eq!(back.topic, Topic::Signal);
        assert_eq!(&back.payload[..], b"{}");

        cancel.cancel();
        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.downstream_packets, 1);
        assert_eq!(stats.upstream_packets, 1);
        assert_eq!(stats.bytes, 6);
    }

    #[tokio::test]
    async fn test_waits_for_both_links() {
        let (up_near, mut sender) = pair();
        let (down_near, mut receiver) = pair();
        let fast = LinkEstablisher::new("up")
            .with_backoff(crate::link::FixedBackoff::new(Duration::from_millis(1)));
        let mut relay = Relay::new(
            MemoryConnector::new("sender", up_near),
            MemoryConnector::new("receiver", down_near).failing_first(3),
        )
        .with_links(fast.clone(), fast);
        let cancel = relay.cancellation_token().clone();
        let task = tokio::spawn(async move { relay.run().await });

        sender.publisher.publish(Packet::data(vec![1u8])).unwrap();
        let packet = tokio::time::timeout(Duration::from_secs(5), receiver.subscription.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&packet.payload[..], &[1]);

        cancel.cancel();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_closed_side_is_error() {
        let (up_near, sender) = pair();
        let (down_near, _receiver) = pair();
        let mut relay = Relay::new(
            MemoryConnector::new("sender", up_near),
            MemoryConnector::new("receiver", down_near),
        );
        drop(sender);
        assert!(matches!(relay.run().await, Err(Error::Transport(_))));
    }

    #[tokio::test]
    async fn test_cancel_before_connected() {
        let (up_near, _sender) = pair();
        let (down_near, _receiver) = pair();
        let mut relay = Relay::new(
            MemoryConnector::new("sender", up_near).failing_first(usize::MAX),
            MemoryConnector::new("receiver", down_near),
        );
        relay.cancellation_token().cancel();
        assert!(matches!(relay.run().await, Err(Error::Cancelled)));
    }
}

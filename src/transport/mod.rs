//! Transport collaborator used by every role.
//!
//! A transport link is exposed as an [`Endpoint`]: a fire-and-forget
//! [`Publisher`], a [`Subscription`] delivering inbound packets, and a stream of
//! [`LinkEvent`]s describing peer connectivity. Coordinators drive all three
//! from a single `select!` loop.
//!
//! Delivery is best effort. Backends may drop, and the benchmark measures
//! whatever arrives.
//!
//! Two backends are provided:
//! - [`memory`]: in-process endpoint pairs, with optional simulated loss
//! - [`tcp`]: a publish/subscribe socket pair per node

pub mod memory;
pub mod tcp;

use crate::{Error, Result};
use bytes::Bytes;
use std::fmt;
use std::future::Future;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

/// Logical channel a packet travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Benchmark stream (timestamped messages and the sentinel)
    Data,
    /// Result back-channel from receiver to sender
    Signal,
}

impl Topic {
    pub fn as_byte(self) -> u8 {
        match self {
            Topic::Data => 0,
            Topic::Signal => 1,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Topic::Data),
            1 => Some(Topic::Signal),
            _ => None,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Data => write!(f, "test"),
            Topic::Signal => write!(f, "signal"),
        }
    }
}

/// A payload tagged with its topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub topic: Topic,
    pub payload: Bytes,
}

impl Packet {
    pub fn data(payload: impl Into<Bytes>) -> Self {
        Self {
            topic: Topic::Data,
            payload: payload.into(),
        }
    }

    pub fn signal(payload: impl Into<Bytes>) -> Self {
        Self {
            topic: Topic::Signal,
            payload: payload.into(),
        }
    }
}

/// Connectivity transition reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    PeerConnected(String),
    PeerDisconnected(String),
}

/// Outbound half of a link. Publishing never waits.
#[derive(Debug, Clone)]
pub struct Publisher {
    tx: mpsc::UnboundedSender<Packet>,
}

impl Publisher {
    pub fn new(tx: mpsc::UnboundedSender<Packet>) -> Self {
        Self { tx }
    }

    /// Queues a packet for delivery.
    ///
    /// # Errors
    ///
    /// Returns `Error::Transport` once the link has been torn down.
    pub fn publish(&self, packet: Packet) -> Result<()> {
        self.tx
            .send(packet)
            .map_err(|_| Error::Transport("link is closed".to_string()))
    }
}

/// Inbound half of a link.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Packet>,
}

impl Subscription {
    pub fn new(rx: mpsc::UnboundedReceiver<Packet>) -> Self {
        Self { rx }
    }

    /// Waits for the next packet; `None` once the link is gone.
    pub async fn recv(&mut self) -> Option<Packet> {
        self.rx.recv().await
    }

    /// Returns a packet if one is already queued.
    pub fn try_recv(&mut self) -> Option<Packet> {
        self.rx.try_recv().ok()
    }
}

/// A connected link. Dropping it tears the link down.
pub struct Endpoint {
    pub publisher: Publisher,
    pub subscription: Subscription,
    events: Option<mpsc::UnboundedReceiver<LinkEvent>>,
    _shutdown: Option<DropGuard>,
}

impl Endpoint {
    pub fn new(
        publisher: Publisher,
        subscription: Subscription,
        events: mpsc::UnboundedReceiver<LinkEvent>,
    ) -> Self {
        Self {
            publisher,
            subscription,
            events: Some(events),
            _shutdown: None,
        }
    }

    /// Cancels `token` when the endpoint is dropped, stopping backend tasks.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self._shutdown = Some(token.drop_guard());
        self
    }

    /// Takes the connectivity event stream; later calls return `None`.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<LinkEvent>> {
        self.events.take()
    }

    /// Tears the link down.
    pub fn teardown(self) {}
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("publisher", &self.publisher)
            .field("has_events", &self.events.is_some())
            .finish()
    }
}

/// Something that can open a link to a named peer.
pub trait Connector: Send + Sync {
    /// Human-readable peer name for logs.
    fn peer(&self) -> String;

    /// Makes one connection attempt.
    fn connect(&self) -> impl Future<Output = Result<Endpoint>> + Send;
}

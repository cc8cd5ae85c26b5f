//! TCP publish/subscribe transport.
//!
//! Each node binds a publisher listener and fans every published packet out to
//! all subscribers connected to it. It also connects one subscriber socket to
//! its peer's publisher. Frames use [`crate::protocol::serialize_frame`].
//!
//! Subscribers that fall behind lose frames (the fan-out buffer is bounded)
//! and a subscriber whose connection drops reconnects in the background,
//! waiting out the backoff policy between attempts.

use super::{Connector, Endpoint, LinkEvent, Packet, Publisher, Subscription};
use crate::link::{BackoffPolicy, FixedBackoff};
use crate::protocol::{read_frame, serialize_frame};
use crate::{Error, Result};
use bytes::Bytes;
use log::{debug, error, warn};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// Frames buffered per subscriber before the slowest one starts losing them.
pub const DEFAULT_FANOUT_CAPACITY: usize = 8192;

/// Opens a publisher listener and a subscriber connection to one peer.
pub struct TcpConnector {
    bind: SocketAddr,
    peer: String,
    listener: Mutex<Option<TcpListener>>,
    capacity: usize,
    backoff: Arc<dyn BackoffPolicy>,
}

impl TcpConnector {
    /// Creates a connector that binds `bind` on its first connection attempt.
    pub fn new(bind: SocketAddr, peer: impl Into<String>) -> Self {
        Self {
            bind,
            peer: peer.into(),
            listener: Mutex::new(None),
            capacity: DEFAULT_FANOUT_CAPACITY,
            backoff: Arc::new(FixedBackoff::default()),
        }
    }

    /// Binds the publisher listener right away.
    ///
    /// Use [`TcpConnector::with_peer`] to name the peer afterwards.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the address cannot be bound.
    pub async fn bind(bind: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(bind).await?;
        let connector = Self::new(listener.local_addr()?, String::new());
        *connector.listener.lock() = Some(listener);
        Ok(connector)
    }

    pub fn with_peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = peer.into();
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Backoff used when the subscriber has to reconnect.
    pub fn with_backoff(mut self, backoff: Arc<dyn BackoffPolicy>) -> Self {
        self.backoff = backoff;
        self
    }

    /// Address the publisher listens on.
    pub fn local_addr(&self) -> SocketAddr {
        self.bind
    }
}

impl Connector for TcpConnector {
    fn peer(&self) -> String {
        self.peer.clone()
    }

    async fn connect(&self) -> Result<Endpoint> {
        if self.peer.is_empty() {
            return Err(Error::Config("no peer address configured".to_string()));
        }

        let bound = self.listener.lock().take();
        let listener = match bound {
            Some(listener) => listener,
            None => TcpListener::bind(self.bind).await?,
        };

        let stream = match TcpStream::connect(&self.peer).await {
            Ok(stream) => stream,
            Err(e) => {
                // Keep the listener so the peer can reach us while we retry.
                *self.listener.lock() = Some(listener);
                return Err(Error::Connection(format!("{}: {}", self.peer, e)));
            }
        };
        stream.set_nodelay(true)?;

        let shutdown = CancellationToken::new();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let _ = event_tx.send(LinkEvent::PeerConnected(self.peer.clone()));

        tokio::spawn(run_publisher(
            listener,
            out_rx,
            self.capacity,
            event_tx.clone(),
            shutdown.clone(),
        ));
        tokio::spawn(run_subscriber(
            stream,
            self.peer.clone(),
            in_tx,
            event_tx,
            self.backoff.clone(),
            shutdown.clone(),
        ));

        Ok(
            Endpoint::new(Publisher::new(out_tx), Subscription::new(in_rx), event_rx)
                .with_shutdown(shutdown),
        )
    }
}

async fn run_publisher(
    listener: TcpListener,
    mut outbound: mpsc::UnboundedReceiver<Packet>,
    capacity: usize,
    events: mpsc::UnboundedSender<LinkEvent>,
    shutdown: CancellationToken,
) {
    let (frames, _) = broadcast::channel::<Bytes>(capacity);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let _ = stream.set_nodelay(true);
                    let _ = events.send(LinkEvent::PeerConnected(addr.to_string()));
                    tokio::spawn(serve_subscriber(
                        stream,
                        addr,
                        frames.subscribe(),
                        events.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(e) => error!("Error accepting subscriber: {}", e),
            },
            packet = outbound.recv() => match packet {
                Some(packet) => match serialize_frame(&packet) {
                    // No subscribers means nobody hears it, as with any pub socket.
                    Ok(frame) => { let _ = frames.send(Bytes::from(frame)); }
                    Err(e) => error!("Dropping unframeable packet: {}", e),
                },
                None => break,
            },
        }
    }
}

async fn serve_subscriber(
    mut stream: TcpStream,
    addr: SocketAddr,
    mut frames: broadcast::Receiver<Bytes>,
    events: mpsc::UnboundedSender<LinkEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = frames.recv() => frame,
        };
        match frame {
            Ok(frame) => {
                if let Err(e) = stream.write_all(&frame).await {
                    debug!("Write to subscriber {} failed: {}", addr, e);
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Subscriber {} lagging, dropped {} frames", addr, skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    let _ = events.send(LinkEvent::PeerDisconnected(addr.to_string()));
}

async fn run_subscriber(
    stream: TcpStream,
    peer: String,
    inbound: mpsc::UnboundedSender<Packet>,
    events: mpsc::UnboundedSender<LinkEvent>,
    backoff: Arc<dyn BackoffPolicy>,
    shutdown: CancellationToken,
) {
    let mut connected = Some(stream);
    let mut attempt = 0u32;

    loop {
        let stream = match connected.take() {
            Some(stream) => stream,
            None => {
                let result = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    result = TcpStream::connect(&peer) => result,
                };
                match result {
                    Ok(stream) => {
                        attempt = 0;
                        let _ = stream.set_nodelay(true);
                        let _ = events.send(LinkEvent::PeerConnected(peer.clone()));
                        stream
                    }
                    Err(e) => {
                        attempt = attempt.saturating_add(1);
                        let delay = backoff.delay(attempt);
                        debug!("Reconnect to {} failed: {}; retrying in {:?}", peer, e, delay);
                        tokio::select! {
                            _ = shutdown.cancelled() => return,
                            _ = tokio::time::sleep(delay) => {}
                        }
                        continue;
                    }
                }
            }
        };

        let mut reader = BufReader::new(stream);
        loop {
            let frame = tokio::select! {
                _ = shutdown.cancelled() => return,
                frame = read_frame(&mut reader) => frame,
            };
            match frame {
                Ok(Some(packet)) => {
                    if inbound.send(packet).is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Dropping connection to {}: {}", peer, e);
                    break;
                }
            }
        }
        let _ = events.send(LinkEvent::PeerDisconnected(peer.clone()));
    }
}

//! Sender role: emits a timed message stream and collects the receiver's result.
//!
//! A run moves through `Connecting → Sending → Draining → AwaitingResult → Done`.
//! The sentinel that ends the stream is re-published on a short interval until
//! the receiver's result comes back on the signal topic, because the transport
//! may drop any single copy of it.

use crate::config::RunConfig;
use crate::link::LinkEstablisher;
use crate::measurements::{
    aggregate_sender, loss_percent, BenchmarkResult, SenderRun, SenderSummary,
};
use crate::message::{self, now_ms};
use crate::payload::PayloadBuffer;
use crate::protocol::decode_result;
use crate::traffic::TrafficGenerator;
use crate::transport::{Connector, Endpoint, Packet, Topic};
use crate::{Error, Result};
use bytes::Bytes;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Interval between sentinel copies while waiting for the result.
pub const DEFAULT_SENTINEL_INTERVAL: Duration = Duration::from_millis(1);

/// How long to keep closing the stream once a result arrived mid-run.
pub const EARLY_RESULT_GRACE: Duration = Duration::from_secs(1);

/// Where a sender is in its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SenderState {
    Connecting,
    Sending,
    Draining,
    AwaitingResult,
    Done,
}

impl fmt::Display for SenderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SenderState::Connecting => "connecting",
            SenderState::Sending => "sending",
            SenderState::Draining => "draining",
            SenderState::AwaitingResult => "awaiting result",
            SenderState::Done => "done",
        };
        write!(f, "{}", name)
    }
}

/// Sender and receiver views of one finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderOutcome {
    pub sent: SenderSummary,
    pub received: BenchmarkResult,
    /// `(sent - received) / sent * 100`
    pub loss_percent: f64,
    /// Sentinel copies published before the result arrived
    pub sentinels_sent: u64,
}

/// Drives one benchmark run from the sending side.
///
/// # Examples
///
/// ```no_run
/// use mqbench::sender::Sender;
/// use mqbench::transport::tcp::TcpConnector;
/// use mqbench::RunConfig;
///
/// # #[tokio::main]
/// # async fn main() -> mqbench::Result<()> {
/// let connector = TcpConnector::new(
///     "127.0.0.1:10001".parse().unwrap(),
///     "127.0.0.1:10002",
/// );
/// let mut sender = Sender::new(RunConfig::uniform(1000), connector)?;
///
/// let outcome = sender.run().await?;
/// println!("loss: {:.2}%", outcome.loss_percent);
/// # Ok(())
/// # }
/// ```
pub struct Sender<C: Connector> {
    config: RunConfig,
    connector: C,
    link: LinkEstablisher,
    settle_delay: Duration,
    sentinel_interval: Duration,
    state: SenderState,
    run: SenderRun,
    finish_token: CancellationToken,
    cancellation_token: CancellationToken,
}

impl<C: Connector> Sender<C> {
    /// Creates a sender for `config` that reaches its next hop through `connector`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the configuration is invalid.
    pub fn new(config: RunConfig, connector: C) -> Result<Self> {
        config.validate()?;
        let cancellation_token = CancellationToken::new();
        Ok(Self {
            config,
            connector,
            link: LinkEstablisher::new("SENDER").with_cancellation(cancellation_token.clone()),
            settle_delay: Duration::ZERO,
            sentinel_interval: DEFAULT_SENTINEL_INTERVAL,
            state: SenderState::Done,
            run: SenderRun::new(),
            finish_token: CancellationToken::new(),
            cancellation_token,
        })
    }

    /// Replaces the link establisher. Its cancellation is tied to this sender's.
    pub fn with_link(mut self, link: LinkEstablisher) -> Self {
        self.link = link.with_cancellation(self.cancellation_token.clone());
        self
    }

    /// Pause between connecting and the first message, letting subscriptions settle.
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_sentinel_interval(mut self, interval: Duration) -> Self {
        self.sentinel_interval = interval.max(Duration::from_micros(1));
        self
    }

    /// Token that ends the sending phase early; the run still drains and
    /// waits for the result. This is how an unbounded run is stopped.
    pub fn finish_token(&self) -> &CancellationToken {
        &self.finish_token
    }

    /// Token that aborts the run outright with `Error::Cancelled`.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    pub fn state(&self) -> SenderState {
        self.state
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    fn set_state(&mut self, state: SenderState) {
        debug!("[SENDER] {} -> {}", self.state, state);
        self.state = state;
    }

    /// Connects, sends the configured stream and waits for the receiver's result.
    ///
    /// The sender can be run again afterwards; counters are reset either way.
    ///
    /// # Errors
    ///
    /// Returns `Error::Cancelled` if the cancellation token fires, or a
    /// transport error if the link closes before the result arrives.
    pub async fn run(&mut self) -> Result<SenderOutcome> {
        self.set_state(SenderState::Connecting);
        let result = match self.link.establish(&self.connector).await {
            Ok(mut endpoint) => {
                info!("[SENDER] Ready!");
                let result = self.exchange(&mut endpoint).await;
                endpoint.teardown();
                result
            }
            Err(e) => Err(e),
        };

        self.run.reset();
        self.set_state(SenderState::Done);
        result
    }

    async fn exchange(&mut self, endpoint: &mut Endpoint) -> Result<SenderOutcome> {
        if !self.settle_delay.is_zero() {
            tokio::select! {
                _ = self.cancellation_token.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(self.settle_delay) => {}
            }
        }

        self.set_state(SenderState::Sending);
        let early = self.send_stream(endpoint).await?;
        self.run.finish(now_ms());
        let sent = aggregate_sender(&self.run);
        info!(
            "[SENDER] sent {} messages ({:.2} KiB) in {} ms",
            sent.message_counter, sent.data_kib, sent.time_used_ms
        );

        // Even with a result in hand the stream is closed with a sentinel, so
        // the receiver discards what is still in flight instead of starting
        // a run nobody will end.
        let grace = early.as_ref().map(|_| EARLY_RESULT_GRACE);
        let (reply, sentinels_sent) = self.drain(endpoint, grace).await?;
        let received = early.or(reply).ok_or_else(|| {
            Error::Transport("no result received from the receiver".to_string())
        })?;

        info!(
            "[SENDER] result received: {} messages in {} ms",
            received.message_counter, received.time_used_ms
        );

        Ok(SenderOutcome {
            loss_percent: loss_percent(sent.message_counter, received.message_counter),
            sent,
            received,
            sentinels_sent,
        })
    }

    /// Sends until the generator ends or the finish token fires.
    ///
    /// Returns a result if one showed up before sending finished.
    async fn send_stream(&mut self, endpoint: &mut Endpoint) -> Result<Option<BenchmarkResult>> {
        let mut generator = TrafficGenerator::new(&self.config)?;
        let mut payload = PayloadBuffer::new(generator.max_payload(), self.config.seed);
        info!(
            "[SENDER] {} run, stop after {}",
            self.config.distribution,
            self.config.stop_condition()
        );

        while let Some(emission) = generator.next() {
            if self.finish_token.is_cancelled() {
                info!("[SENDER] finish requested, stopping stream");
                break;
            }

            pace(emission.delay, &self.cancellation_token).await?;

            let sent_at = now_ms();
            let frame = message::encode(sent_at, payload.slice(emission.size));
            endpoint.publisher.publish(Packet::data(frame))?;
            self.run.record_sent(emission.size, sent_at);

            if let Some(result) = take_result(endpoint) {
                warn!("[SENDER] result arrived before the stream ended, stopping");
                return Ok(Some(result));
            }
        }

        Ok(None)
    }

    /// Publishes the sentinel on an interval until the result arrives.
    ///
    /// With a `grace` period the wait gives up after it and returns `None`;
    /// this is used when the result is already known and the receiver only
    /// has to acknowledge the end of the stream.
    async fn drain(
        &mut self,
        endpoint: &mut Endpoint,
        grace: Option<Duration>,
    ) -> Result<(Option<BenchmarkResult>, u64)> {
        self.set_state(SenderState::Draining);
        let sentinel = Bytes::from(message::sentinel());
        let mut sentinels_sent = 0u64;
        let give_up = grace.map(|grace| tokio::time::Instant::now() + grace);

        let mut retry = tokio::time::interval(self.sentinel_interval);
        retry.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = self.cancellation_token.cancelled() => return Err(Error::Cancelled),
                packet = endpoint.subscription.recv() => match packet {
                    Some(packet) if packet.topic == Topic::Signal => {
                        match decode_result(&packet.payload) {
                            Ok(result) => {
                                debug!("[SENDER] result after {} sentinels", sentinels_sent);
                                return Ok((Some(result), sentinels_sent));
                            }
                            Err(e) => warn!("[SENDER] ignoring malformed result: {}", e),
                        }
                    }
                    Some(_) => {}
                    None => {
                        return Err(Error::Transport(
                            "link closed while waiting for the result".to_string(),
                        ))
                    }
                },
                _ = expire(give_up) => {
                    warn!("[SENDER] end of stream not acknowledged after {} sentinels", sentinels_sent);
                    return Ok((None, sentinels_sent));
                }
                _ = retry.tick() => {
                    if let Err(e) = endpoint.publisher.publish(Packet::data(sentinel.clone())) {
                        // The peer may have answered and hung up in the same breath.
                        return match take_result(endpoint) {
                            Some(result) => Ok((Some(result), sentinels_sent)),
                            None if grace.is_some() => Ok((None, sentinels_sent)),
                            None => Err(e),
                        };
                    }
                    sentinels_sent += 1;
                    if sentinels_sent == 1 {
                        self.set_state(SenderState::AwaitingResult);
                    }
                }
            }
        }
    }
}

/// Completes at `deadline`, or never when there is none.
async fn expire(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn take_result(endpoint: &mut Endpoint) -> Option<BenchmarkResult> {
    while let Some(packet) = endpoint.subscription.try_recv() {
        if packet.topic != Topic::Signal {
            continue;
        }
        match decode_result(&packet.payload) {
            Ok(result) => return Some(result),
            Err(e) => warn!("[SENDER] ignoring malformed result: {}", e),
        }
    }
    None
}

/// Waits `delay` before the next send.
///
/// Timer wheels only resolve whole milliseconds, so shorter delays spin on
/// the clock, yielding to the runtime in between. A zero delay still yields
/// once so other tasks keep running during back-to-back sends.
async fn pace(delay: Duration, cancel: &CancellationToken) -> Result<()> {
    if delay >= Duration::from_millis(1) {
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        return Ok(());
    }

    let deadline = Instant::now() + delay;
    loop {
        tokio::task::yield_now().await;
        if Instant::now() >= deadline {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurements::{aggregate_receiver, EndReason, ReceiverRun};
    use crate::message::Frame;
    use crate::protocol::encode_result;
    use crate::transport::memory::{pair, MemoryConnector};

    fn result_with(count: u64) -> BenchmarkResult {
        let mut run = ReceiverRun::new();
        run.start(1);
        for _ in 0..count {
            run.record(1, 2, 10);
        }
        aggregate_receiver(&run, 11, EndReason::Sentinel)
    }

    /// Answers with `result` after the first sentinel and returns the data
    /// payload sizes it saw.
    async fn fake_receiver(mut far: Endpoint, result: BenchmarkResult) -> Vec<usize> {
        let mut sizes = Vec::new();
        while let Some(packet) = far.subscription.recv().await {
            match Frame::parse(&packet.payload).unwrap() {
                Frame::Data { payload, .. } => sizes.push(payload.len()),
                Frame::Sentinel => {
                    let bytes = encode_result(&result).unwrap();
                    far.publisher.publish(Packet::signal(bytes)).unwrap();
                    break;
                }
            }
        }
        sizes
    }

    #[tokio::test]
    async fn test_sender_full_run() {
        let (near, far) = pair();
        let receiver = tokio::spawn(fake_receiver(far, result_with(40)));

        let config = RunConfig::uniform(32).with_message_count(50).with_seed(1);
        let mut sender = Sender::new(config, MemoryConnector::new("receiver", near)).unwrap();
        let outcome = sender.run().await.unwrap();

        assert_eq!(outcome.sent.message_counter, 50);
        assert_eq!(outcome.received.message_counter, 40);
        assert_eq!(outcome.loss_percent, 20.0);
        assert!(outcome.sentinels_sent >= 1);
        assert_eq!(sender.state(), SenderState::Done);

        let sizes = receiver.await.unwrap();
        assert_eq!(sizes.len(), 50);
        assert!(sizes.iter().all(|&s| s == 32));
    }

    #[tokio::test]
    async fn test_sentinel_repeated_until_result() {
        let (near, mut far) = pair();
        let responder = tokio::spawn(async move {
            let mut sentinels = 0;
            while let Some(packet) = far.subscription.recv().await {
                if Frame::parse(&packet.payload).unwrap() == Frame::Sentinel {
                    sentinels += 1;
                    // Pretend the first few copies were lost
                    if sentinels == 5 {
                        let bytes = encode_result(&result_with(1)).unwrap();
                        far.publisher.publish(Packet::signal(bytes)).unwrap();
                        break;
                    }
                }
            }
            sentinels
        });

        let config = RunConfig::uniform(8).with_message_count(1);
        let mut sender = Sender::new(config, MemoryConnector::new("receiver", near))
            .unwrap()
            .with_sentinel_interval(Duration::from_millis(1));
        let outcome = sender.run().await.unwrap();

        assert_eq!(responder.await.unwrap(), 5);
        assert!(outcome.sentinels_sent >= 5);
    }

    #[tokio::test]
    async fn test_awaiting_result_once_sentinel_is_out() {
        let (mut near, mut far) = pair();
        tokio::spawn(async move {
            let mut sentinels = 0;
            while let Some(packet) = far.subscription.recv().await {
                if Frame::parse(&packet.payload).unwrap() == Frame::Sentinel {
                    sentinels += 1;
                    if sentinels == 3 {
                        let bytes = encode_result(&result_with(2)).unwrap();
                        far.publisher.publish(Packet::signal(bytes)).unwrap();
                        break;
                    }
                }
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let (unused, _) = pair();
        let mut sender = Sender::new(
            RunConfig::uniform(8).with_message_count(1),
            MemoryConnector::new("receiver", unused),
        )
        .unwrap();
        let (result, sentinels) = sender.drain(&mut near, None).await.unwrap();

        assert_eq!(result.unwrap().message_counter, 2);
        assert!(sentinels >= 3);
        assert_eq!(sender.state(), SenderState::AwaitingResult);
    }

    /// Answers with a timed-out result as soon as data arrives, like a
    /// receiver whose duration ran out, and acknowledges the closing sentinel.
    async fn impatient_receiver(mut far: Endpoint, acknowledge: bool) -> bool {
        let mut answered = false;
        while let Some(packet) = far.subscription.recv().await {
            let frame = Frame::parse(&packet.payload).unwrap();
            if !answered {
                let bytes = encode_result(&result_with(1)).unwrap();
                far.publisher.publish(Packet::signal(bytes)).unwrap();
                answered = true;
            }
            if frame == Frame::Sentinel {
                if acknowledge {
                    let bytes = encode_result(&result_with(1)).unwrap();
                    far.publisher.publish(Packet::signal(bytes)).unwrap();
                }
                // Keep the link open until the sender is done
                tokio::time::sleep(Duration::from_secs(3)).await;
                return true;
            }
        }
        false
    }

    #[tokio::test]
    async fn test_early_result_still_closes_stream() {
        let (near, far) = pair();
        let receiver = tokio::spawn(impatient_receiver(far, true));

        let config = RunConfig::uniform(16).with_message_count(1_000_000);
        let mut sender = Sender::new(config, MemoryConnector::new("receiver", near)).unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(10), sender.run())
            .await
            .expect("early result should end the run")
            .unwrap();

        assert!(outcome.sent.message_counter < 1_000_000);
        assert_eq!(outcome.received.message_counter, 1);
        assert!(outcome.sentinels_sent >= 1);
        assert!(receiver.await.unwrap(), "stream was never closed");
    }

    #[tokio::test]
    async fn test_early_result_kept_without_acknowledgement() {
        let (near, far) = pair();
        tokio::spawn(impatient_receiver(far, false));

        let config = RunConfig::uniform(16).with_message_count(1_000_000);
        let mut sender = Sender::new(config, MemoryConnector::new("receiver", near))
            .unwrap()
            .with_sentinel_interval(Duration::from_millis(10));
        let started = Instant::now();
        let outcome = tokio::time::timeout(Duration::from_secs(10), sender.run())
            .await
            .expect("grace period should end the wait")
            .unwrap();

        assert!(started.elapsed() >= EARLY_RESULT_GRACE);
        assert_eq!(outcome.received.message_counter, 1);
        assert!(outcome.sentinels_sent > 1);
    }

    #[tokio::test]
    async fn test_malformed_result_is_ignored() {
        let (near, mut far) = pair();
        tokio::spawn(async move {
            while let Some(packet) = far.subscription.recv().await {
                if Frame::parse(&packet.payload).unwrap() == Frame::Sentinel {
                    far.publisher.publish(Packet::signal(b"garbage".to_vec())).unwrap();
                    let bytes = encode_result(&result_with(1)).unwrap();
                    far.publisher.publish(Packet::signal(bytes)).unwrap();
                    break;
                }
            }
            // Keep the link open until the sender is done
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let config = RunConfig::uniform(8).with_message_count(1);
        let mut sender = Sender::new(config, MemoryConnector::new("receiver", near)).unwrap();
        let outcome = sender.run().await.unwrap();
        assert_eq!(outcome.received.message_counter, 1);
    }

    #[tokio::test]
    async fn test_finish_token_ends_unbounded_run() {
        let (near, far) = pair();
        tokio::spawn(fake_receiver(far, result_with(3)));

        let config = RunConfig::uniform(4).without_message_count();
        let mut sender = Sender::new(config, MemoryConnector::new("receiver", near)).unwrap();
        let finish = sender.finish_token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            finish.cancel();
        });

        let outcome = tokio::time::timeout(Duration::from_secs(5), sender.run())
            .await
            .expect("unbounded run should stop")
            .unwrap();
        assert!(outcome.sent.message_counter > 0);
        assert_eq!(outcome.received.message_counter, 3);
    }

    #[tokio::test]
    async fn test_cancel_while_awaiting_result() {
        let (near, _far) = pair();
        let config = RunConfig::uniform(4).with_message_count(2);
        let mut sender = Sender::new(config, MemoryConnector::new("receiver", near)).unwrap();
        let cancel = sender.cancellation_token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let result = sender.run().await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(sender.state(), SenderState::Done);
    }

    #[tokio::test]
    async fn test_link_closed_while_draining() {
        let (near, far) = pair();
        drop(far);
        let config = RunConfig::uniform(4).with_message_count(1);
        let mut sender = Sender::new(config, MemoryConnector::new("receiver", near)).unwrap();
        assert!(sender.run().await.is_err());
    }

    #[tokio::test]
    async fn test_pace_sub_millisecond() {
        let token = CancellationToken::new();
        let start = Instant::now();
        pace(Duration::from_micros(300), &token).await.unwrap();
        assert!(start.elapsed() >= Duration::from_micros(300));
    }

    #[tokio::test]
    async fn test_pace_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(
            pace(Duration::from_secs(10), &token).await,
            Err(Error::Cancelled)
        ));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let (near, _far) = pair();
        let config = RunConfig::poisson().with_avg_delay(5000).with_message_size(1);
        assert!(Sender::new(config, MemoryConnector::new("receiver", near)).is_err());
    }
}

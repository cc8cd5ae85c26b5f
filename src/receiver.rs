//! Receiver role: times the incoming stream and answers with the run's result.
//!
//! The receiver is `Idle` until the first data message arrives. That message
//! anchors the run on the sender's clock and, when a duration is configured,
//! arms a timeout measured from its local arrival. The run ends on the
//! sentinel or on the timeout, whichever the loop sees first. Finalization
//! happens once per run: later sentinels and the disarmed timer are no-ops.
//!
//! A run that timed out leaves the receiver `Draining`: the sender may still
//! have messages in flight, and those are discarded until its sentinel shows
//! up. The sentinel is answered with the same result again so the sender
//! knows the stream was closed. If no sentinel comes, a full duration of
//! silence returns the receiver to `Idle`.

use crate::link::LinkEstablisher;
use crate::measurements::{aggregate_receiver, BenchmarkResult, EndReason, ReceiverRun};
use crate::message::{now_ms, Frame};
use crate::protocol::encode_result;
use crate::transport::{Connector, Endpoint, Packet, Topic};
use crate::{Error, Result};
use log::{debug, info};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Progress notifications emitted by a [`Receiver`].
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// First message of a run accepted.
    ///
    /// `start_ms` is the sender timestamp embedded in that message.
    RunStarted { start_ms: u64 },
    /// Run finalized; the result has been computed and is about to be published.
    RunFinished(BenchmarkResult),
    /// A sentinel arrived while no run was active and was dropped.
    StaleSentinelIgnored,
}

/// Callback trait for receiving run notifications.
///
/// Implemented for any `Fn(ProgressEvent)` closure.
///
/// # Examples
///
/// ```
/// use mqbench::{ProgressCallback, ProgressEvent};
///
/// struct Counter;
///
/// impl ProgressCallback for Counter {
///     fn on_progress(&self, event: ProgressEvent) {
///         if let ProgressEvent::RunFinished(result) = event {
///             println!("{} messages", result.message_counter);
///         }
///     }
/// }
/// ```
pub trait ProgressCallback: Send + Sync {
    fn on_progress(&self, event: ProgressEvent);
}

impl<F> ProgressCallback for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn on_progress(&self, event: ProgressEvent) {
        self(event)
    }
}

type CallbackRef = Arc<dyn ProgressCallback>;

/// Where a receiver is in its current run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Connecting,
    Idle,
    Receiving,
    Finalizing,
    /// Discarding the tail of a timed-out run until its sentinel arrives.
    Draining,
}

impl fmt::Display for ReceiverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReceiverState::Connecting => "connecting",
            ReceiverState::Idle => "idle",
            ReceiverState::Receiving => "receiving",
            ReceiverState::Finalizing => "finalizing",
            ReceiverState::Draining => "draining",
        };
        write!(f, "{}", name)
    }
}

/// Serves benchmark runs until cancelled.
///
/// # Examples
///
/// ```no_run
/// use mqbench::receiver::Receiver;
/// use mqbench::transport::tcp::TcpConnector;
/// use mqbench::ProgressEvent;
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> mqbench::Result<()> {
/// let connector = TcpConnector::new(
///     "127.0.0.1:20002".parse().unwrap(),
///     "127.0.0.1:20001",
/// );
/// let mut receiver = Receiver::new(connector)
///     .with_duration(Some(Duration::from_secs(60)))
///     .with_callback(|event: ProgressEvent| println!("{:?}", event));
///
/// receiver.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct Receiver<C: Connector> {
    connector: C,
    link: LinkEstablisher,
    duration: Option<Duration>,
    state: ReceiverState,
    run: ReceiverRun,
    deadline: Option<Instant>,
    // Result of the timed-out run, repeated when its sentinel arrives.
    timed_out_result: Option<BenchmarkResult>,
    runs_completed: u64,
    callback: Option<CallbackRef>,
    cancellation_token: CancellationToken,
}

impl<C: Connector> Receiver<C> {
    pub fn new(connector: C) -> Self {
        let cancellation_token = CancellationToken::new();
        Self {
            connector,
            link: LinkEstablisher::new("RECEIVER").with_cancellation(cancellation_token.clone()),
            duration: None,
            state: ReceiverState::Idle,
            run: ReceiverRun::new(),
            deadline: None,
            timed_out_result: None,
            runs_completed: 0,
            callback: None,
            cancellation_token,
        }
    }

    /// Ends a run this long after its first message arrives, sentinel or not.
    pub fn with_duration(mut self, duration: Option<Duration>) -> Self {
        self.duration = duration;
        self
    }

    /// Replaces the link establisher. Its cancellation is tied to this receiver's.
    pub fn with_link(mut self, link: LinkEstablisher) -> Self {
        self.link = link.with_cancellation(self.cancellation_token.clone());
        self
    }

    pub fn with_callback<F: ProgressCallback + 'static>(mut self, callback: F) -> Self {
        self.callback = Some(Arc::new(callback));
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    /// Runs finalized since this receiver was created.
    pub fn runs_completed(&self) -> u64 {
        self.runs_completed
    }

    fn notify(&self, event: ProgressEvent) {
        if let Some(callback) = &self.callback {
            callback.on_progress(event);
        }
    }

    fn set_state(&mut self, state: ReceiverState) {
        debug!("[RECEIVER] {} -> {}", self.state, state);
        self.state = state;
    }

    /// Connects upstream and serves runs until the cancellation token fires.
    ///
    /// # Errors
    ///
    /// Returns `Error::Cancelled` if cancelled while still connecting, and
    /// `Error::Transport` if the upstream link closes.
    pub async fn run(&mut self) -> Result<()> {
        self.set_state(ReceiverState::Connecting);
        let mut endpoint = self.link.establish(&self.connector).await?;
        info!("[RECEIVER] Ready!");
        self.set_state(ReceiverState::Idle);

        let result = self.serve(&mut endpoint).await;

        self.deadline = None;
        self.timed_out_result = None;
        self.run.reset();
        self.set_state(ReceiverState::Idle);
        endpoint.teardown();
        result
    }

    async fn serve(&mut self, endpoint: &mut Endpoint) -> Result<()> {
        loop {
            let deadline = self.deadline;
            tokio::select! {
                _ = self.cancellation_token.cancelled() => {
                    info!("[RECEIVER] stopping");
                    return Ok(());
                }
                _ = expire(deadline) => {
                    if let Some(result) = self.on_deadline(now_ms()) {
                        publish_result(endpoint, &result)?;
                    }
                }
                packet = endpoint.subscription.recv() => match packet {
                    Some(packet) => {
                        if let Some(result) = self.handle_packet(&packet, now_ms()) {
                            publish_result(endpoint, &result)?;
                        }
                    }
                    None => {
                        return Err(Error::Transport("upstream link closed".to_string()));
                    }
                },
            }
        }
    }

    /// Applies one inbound packet received at `received_ms`.
    ///
    /// Returns the result when the packet ended a run.
    fn handle_packet(&mut self, packet: &Packet, received_ms: u64) -> Option<BenchmarkResult> {
        if packet.topic != Topic::Data {
            return None;
        }

        let frame = match Frame::parse(&packet.payload) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("[RECEIVER] dropping message: {}", e);
                return None;
            }
        };

        if self.state == ReceiverState::Draining {
            return self.discard(frame);
        }

        match frame {
            Frame::Sentinel => {
                if self.state != ReceiverState::Receiving {
                    debug!("[RECEIVER] ignoring sentinel outside a run");
                    self.notify(ProgressEvent::StaleSentinelIgnored);
                    return None;
                }
                self.finalize(received_ms, EndReason::Sentinel)
            }
            Frame::Data {
                timestamp_ms,
                payload,
            } => {
                if self.state != ReceiverState::Receiving {
                    self.begin(timestamp_ms);
                }
                self.run.record(timestamp_ms, received_ms, payload.len());
                None
            }
        }
    }

    /// Handles a message arriving after a timeout, before the sender's sentinel.
    fn discard(&mut self, frame: Frame<'_>) -> Option<BenchmarkResult> {
        match frame {
            Frame::Sentinel => {
                info!("[RECEIVER] timed-out stream closed by the sender");
                self.deadline = None;
                self.set_state(ReceiverState::Idle);
                self.timed_out_result.take()
            }
            Frame::Data { .. } => {
                debug!("[RECEIVER] discarding message from a timed-out run");
                self.arm_quiet_period();
                None
            }
        }
    }

    /// Fires the armed deadline: the run timeout, or the end of a drain.
    fn on_deadline(&mut self, now_ms: u64) -> Option<BenchmarkResult> {
        match self.state {
            ReceiverState::Receiving => self.finalize(now_ms, EndReason::Timeout),
            ReceiverState::Draining => {
                debug!("[RECEIVER] no sentinel after the timeout, back to idle");
                self.deadline = None;
                self.timed_out_result = None;
                self.set_state(ReceiverState::Idle);
                None
            }
            _ => {
                self.deadline = None;
                None
            }
        }
    }

    fn arm_quiet_period(&mut self) {
        self.deadline = self.duration.map(|d| Instant::now() + d);
    }

    fn begin(&mut self, start_ms: u64) {
        self.run.start(start_ms);
        self.deadline = self.duration.map(|d| Instant::now() + d);
        self.set_state(ReceiverState::Receiving);
        info!("[RECEIVER] >>> START");
        self.notify(ProgressEvent::RunStarted { start_ms });
    }

    /// Closes the active run. A no-op when no run is active.
    fn finalize(&mut self, end_ms: u64, reason: EndReason) -> Option<BenchmarkResult> {
        if self.state != ReceiverState::Receiving {
            return None;
        }
        self.set_state(ReceiverState::Finalizing);
        self.deadline = None;

        let result = aggregate_receiver(&self.run, end_ms, reason);
        match reason {
            EndReason::Sentinel => info!("[RECEIVER] >>> FINISH"),
            EndReason::Timeout => info!("[RECEIVER] >>> TIMEOUT"),
        }
        info!(
            "[RECEIVER] {} messages, {:.2} KiB in {} ms, avg latency {}",
            result.message_counter,
            result.data_kib,
            result.time_used_ms,
            result
                .avg_latency_ms
                .map(|l| format!("{:.3} ms", l))
                .unwrap_or_else(|| "n/a".to_string())
        );

        self.run.reset();
        self.runs_completed += 1;
        match reason {
            EndReason::Sentinel => self.set_state(ReceiverState::Idle),
            EndReason::Timeout => {
                self.timed_out_result = Some(result.clone());
                self.arm_quiet_period();
                self.set_state(ReceiverState::Draining);
            }
        }
        self.notify(ProgressEvent::RunFinished(result.clone()));
        Some(result)
    }
}

fn publish_result(endpoint: &Endpoint, result: &BenchmarkResult) -> Result<()> {
    endpoint
        .publisher
        .publish(Packet::signal(encode_result(result)?))
}

/// Completes at `deadline`, or never when there is none.
async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

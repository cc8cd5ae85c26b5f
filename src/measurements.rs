use serde::{Deserialize, Serialize};

/// How a receiver run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// The sender's end-of-stream sentinel arrived
    Sentinel,
    /// The configured duration elapsed first
    Timeout,
}

/// Counters accumulated by the sender during one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SenderRun {
    pub message_counter: u64,
    /// Payload bytes sent, headers excluded
    pub bytes_sent: u64,
    pub start_ms: Option<u64>,
    pub end_ms: Option<u64>,
}

impl SenderRun {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&mut self, payload_len: usize, now_ms: u64) {
        self.start_ms.get_or_insert(now_ms);
        self.message_counter += 1;
        self.bytes_sent += payload_len as u64;
    }

    pub fn finish(&mut self, now_ms: u64) {
        self.start_ms.get_or_insert(now_ms);
        self.end_ms = Some(now_ms);
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Counters accumulated by the receiver during one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiverRun {
    pub message_counter: u64,
    /// Payload bytes received, headers excluded
    pub bytes_received: u64,
    /// Receive time minus embedded send time, per message
    pub latencies_ms: Vec<i64>,
    /// Embedded timestamp of the first accepted message
    pub start_ms: Option<u64>,
}

impl ReceiverRun {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.start_ms.is_some()
    }

    /// Anchors the run on the sender's clock.
    pub fn start(&mut self, embedded_ms: u64) {
        self.start_ms = Some(embedded_ms);
    }

    pub fn record(&mut self, embedded_ms: u64, received_ms: u64, payload_len: usize) {
        self.latencies_ms
            .push(received_ms as i64 - embedded_ms as i64);
        self.bytes_received += payload_len as u64;
        self.message_counter += 1;
    }

    pub fn reset(&mut self) {
        self.message_counter = 0;
        self.bytes_received = 0;
        self.latencies_ms.clear();
        self.start_ms = None;
    }
}

/// Receiver-side statistics for one finished run.
///
/// This is what travels back to the sender on the result back-channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchmarkResult {
    pub message_counter: u64,
    pub time_used_ms: u64,
    pub data_kib: f64,
    pub throughput_msg_per_sec: f64,
    pub throughput_kib_per_sec: f64,
    /// `None` when no message was received
    pub avg_latency_ms: Option<f64>,
    pub timed_out: bool,
}

/// Sender-side statistics for one finished run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderSummary {
    pub message_counter: u64,
    pub time_used_ms: u64,
    pub data_kib: f64,
    pub throughput_msg_per_sec: f64,
    pub throughput_kib_per_sec: f64,
}

/// `amount` per second over `time_ms`; zero when no time elapsed.
fn per_second(amount: f64, time_ms: u64) -> f64 {
    if time_ms > 0 {
        amount * 1000.0 / time_ms as f64
    } else {
        0.0
    }
}

fn mean(values: &[i64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<i64>() as f64 / values.len() as f64)
    }
}

/// Turns receiver counters into the published result.
///
/// `end_ms` is the local time the run terminated. Elapsed time is measured
/// from the sender-embedded timestamp of the first message.
pub fn aggregate_receiver(run: &ReceiverRun, end_ms: u64, reason: EndReason) -> BenchmarkResult {
    let time_used_ms = run
        .start_ms
        .map(|start| end_ms.saturating_sub(start))
        .unwrap_or(0);
    let data_kib = run.bytes_received as f64 / 1024.0;

    BenchmarkResult {
        message_counter: run.message_counter,
        time_used_ms,
        data_kib,
        throughput_msg_per_sec: per_second(run.message_counter as f64, time_used_ms),
        throughput_kib_per_sec: per_second(data_kib, time_used_ms),
        avg_latency_ms: mean(&run.latencies_ms),
        timed_out: reason == EndReason::Timeout,
    }
}

/// Turns sender counters into its half of the report.
pub fn aggregate_sender(run: &SenderRun) -> SenderSummary {
    let time_used_ms = match (run.start_ms, run.end_ms) {
        (Some(start), Some(end)) => end.saturating_sub(start),
        _ => 0,
    };
    let data_kib = run.bytes_sent as f64 / 1024.0;

    SenderSummary {
        message_counter: run.message_counter,
        time_used_ms,
        data_kib,
        throughput_msg_per_sec: per_second(run.message_counter as f64, time_used_ms),
        throughput_kib_per_sec: per_second(data_kib, time_used_ms),
    }
}

/// Percentage of sent messages the receiver never saw: `(sent - received) / sent * 100`.
///
/// Zero when nothing was sent.
///
/// # Examples
///
/// ```
/// use mqbench::measurements::loss_percent;
///
/// assert_eq!(loss_percent(1000, 990), 1.0);
/// assert_eq!(loss_percent(0, 0), 0.0);
/// ```
pub fn loss_percent(sent: u64, received: u64) -> f64 {
    if sent == 0 {
        return 0.0;
    }
    (sent as f64 - received as f64) / sent as f64 * 100.0
}

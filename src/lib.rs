//! mqbench - latency, throughput and loss benchmarks for publish/subscribe paths
//!
//! This library measures a message path made of a sender, an optional broker
//! and a receiver. The sender emits a timed stream, the receiver timestamps
//! what arrives and sends its figures back, and the sender merges both sides
//! into a report.
//!
//! # Features
//!
//! - Uniform (constant size and rate) and Poisson (bursty) traffic
//! - Runs bounded by message count, duration, or external cancellation
//! - Sentinel-delimited runs with retransmission and a duration fallback
//! - In-memory and TCP publish/subscribe transports
//! - Asynchronous I/O using tokio

pub mod config;
pub mod error;
pub mod link;
pub mod measurements;
pub mod message;
pub mod payload;
pub mod poisson;
pub mod protocol;
pub mod receiver;
pub mod relay;
pub mod report;
pub mod sender;
pub mod traffic;
pub mod transport;

pub use config::{DelayUnit, Distribution, Role, RunConfig};
pub use error::{Error, Result};
pub use link::{BackoffPolicy, FixedBackoff, LinkEstablisher};
pub use measurements::{BenchmarkResult, SenderSummary};
pub use receiver::{ProgressCallback, ProgressEvent, Receiver, ReceiverState};
pub use relay::{Relay, RelayStats};
pub use report::Report;
pub use sender::{Sender, SenderOutcome, SenderState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

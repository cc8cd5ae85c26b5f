//! Human-readable run reports.
//!
//! A report echoes the run configuration, the host it ran on, both sides'
//! counters and the message loss. Reports are appended to a file one record
//! at a time, separated by a blank line.

use crate::config::{Distribution, RunConfig};
use crate::sender::SenderOutcome;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::Path;

/// Host and version details stamped on a report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub version: String,
    pub system_info: String,
    pub timestamp_str: String,
    pub timestamp: i64,
}

/// Gathers version, OS, architecture and hostname.
pub fn get_system_info() -> SystemInfo {
    let now = chrono::Utc::now();
    SystemInfo {
        version: format!("mqbench {}", env!("CARGO_PKG_VERSION")),
        system_info: format!(
            "{} {} {}",
            std::env::consts::OS,
            std::env::consts::ARCH,
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string())
        ),
        timestamp_str: now.to_rfc2822(),
        timestamp: now.timestamp(),
    }
}

/// One finished run, ready to print or append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub config: RunConfig,
    pub outcome: SenderOutcome,
    pub system: SystemInfo,
}

impl Report {
    pub fn new(config: &RunConfig, outcome: &SenderOutcome) -> Self {
        Self {
            config: config.clone(),
            outcome: outcome.clone(),
            system: get_system_info(),
        }
    }

    /// Formats the report as a text block.
    ///
    /// # Examples
    ///
    /// ```
    /// use mqbench::measurements::{BenchmarkResult, SenderSummary};
    /// use mqbench::report::Report;
    /// use mqbench::sender::SenderOutcome;
    /// use mqbench::RunConfig;
    ///
    /// let outcome = SenderOutcome {
    ///     sent: SenderSummary {
    ///         message_counter: 10,
    ///         time_used_ms: 5,
    ///         data_kib: 1.0,
    ///         throughput_msg_per_sec: 2000.0,
    ///         throughput_kib_per_sec: 200.0,
    ///     },
    ///     received: BenchmarkResult {
    ///         message_counter: 9,
    ///         time_used_ms: 6,
    ///         data_kib: 0.9,
    ///         throughput_msg_per_sec: 1500.0,
    ///         throughput_kib_per_sec: 150.0,
    ///         avg_latency_ms: Some(0.5),
    ///         timed_out: false,
    ///     },
    ///     loss_percent: 10.0,
    ///     sentinels_sent: 1,
    /// };
    /// let text = Report::new(&RunConfig::uniform(100), &outcome).render();
    /// assert!(text.contains("Message loss:     10.00%"));
    /// ```
    pub fn render(&self) -> String {
        let config = &self.config;
        let sent = &self.outcome.sent;
        let received = &self.outcome.received;
        let mut out = String::new();

        // Writing into a String cannot fail.
        let _ = writeln!(
            out,
            "=== {} ===",
            config.name.as_deref().unwrap_or("benchmark")
        );
        let _ = writeln!(out, "{}", self.system.version);
        let _ = writeln!(out, "Host:             {}", self.system.system_info);
        let _ = writeln!(out, "Time:             {}", self.system.timestamp_str);
        let _ = writeln!(out, "Mode:             {}", config.distribution);
        let _ = writeln!(out, "Stop after:       {}", config.stop_condition());

        let unit = config.delay_unit.suffix();
        match config.distribution {
            Distribution::Uniform => {
                if let Some(size) = config.message_size {
                    let _ = writeln!(out, "Message size:     {} bytes", size);
                }
                let _ = writeln!(out, "Delay:            {}{}", config.delay.unwrap_or(0), unit);
            }
            Distribution::Poisson => {
                match config.avg_size {
                    Some(avg_size) => {
                        let _ = writeln!(out, "Avg size:         {} bytes", avg_size);
                    }
                    None => {
                        let _ = writeln!(
                            out,
                            "Message size:     {} bytes",
                            config.message_size.unwrap_or(0)
                        );
                    }
                }
                match config.avg_delay {
                    Some(avg_delay) => {
                        let _ = writeln!(out, "Avg delay:        {}{}", avg_delay, unit);
                    }
                    None => {
                        let _ = writeln!(out, "Avg delay:        none");
                    }
                }
            }
        }

        let _ = writeln!(out, "--- sender ---");
        let _ = writeln!(out, "Messages sent:    {}", sent.message_counter);
        let _ = writeln!(out, "Data sent:        {:.2} KiB", sent.data_kib);
        let _ = writeln!(out, "Time used:        {} ms", sent.time_used_ms);
        let _ = writeln!(
            out,
            "Throughput:       {:.2} msg/s, {:.2} KiB/s",
            sent.throughput_msg_per_sec, sent.throughput_kib_per_sec
        );

        let _ = writeln!(out, "--- receiver ---");
        let _ = writeln!(out, "Messages received: {}", received.message_counter);
        let _ = writeln!(out, "Data received:    {:.2} KiB", received.data_kib);
        let _ = writeln!(out, "Time used:        {} ms", received.time_used_ms);
        let _ = writeln!(
            out,
            "Throughput:       {:.2} msg/s, {:.2} KiB/s",
            received.throughput_msg_per_sec, received.throughput_kib_per_sec
        );
        match received.avg_latency_ms {
            Some(latency) => {
                let _ = writeln!(out, "Avg latency:      {:.3} ms", latency);
            }
            None => {
                let _ = writeln!(out, "Avg latency:      n/a (no messages)");
            }
        }
        let _ = writeln!(
            out,
            "Ended by:         {}",
            if received.timed_out { "timeout" } else { "sentinel" }
        );

        let _ = writeln!(out, "Message loss:     {:.2}%", self.outcome.loss_percent);
        out
    }

    /// Appends the rendered report to `path`, creating the file if needed.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the file cannot be opened or written.
    pub fn append_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        file.write_all(self.render().as_bytes())?;
        file.write_all(b"\n")?;
        log::debug!("Report appended to {}", path.as_ref().display());
        Ok(())
    }
}

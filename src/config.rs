use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Smallest accepted mean inter-send delay for Poisson runs.
pub const MIN_AVG_DELAY: u64 = 1;
/// Largest accepted mean inter-send delay for Poisson runs.
pub const MAX_AVG_DELAY: u64 = 1000;
/// Smallest accepted mean payload size (bytes) for Poisson runs.
pub const MIN_AVG_SIZE: usize = 1024;
/// Largest accepted mean payload size (bytes) for Poisson runs.
pub const MAX_AVG_SIZE: usize = 1024 * 1024;

/// Traffic model used by the sender.
///
/// # Examples
///
/// ```
/// use mqbench::Distribution;
///
/// let d: Distribution = "poisson".parse().unwrap();
/// assert_eq!(d, Distribution::Poisson);
/// assert_eq!(d.to_string(), "poisson");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Distribution {
    /// Constant payload size and constant inter-send delay
    Uniform,
    /// Payload sizes and/or delays drawn from Poisson distributions
    Poisson,
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Distribution::Uniform => write!(f, "uniform"),
            Distribution::Poisson => write!(f, "poisson"),
        }
    }
}

impl FromStr for Distribution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "uniform" => Ok(Distribution::Uniform),
            "poisson" => Ok(Distribution::Poisson),
            other => Err(Error::Config(format!("unknown distribution '{}'", other))),
        }
    }
}

/// Role a process plays on the measured path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Generates the timed stream and collects the final result
    Sender,
    /// Forwards payloads between sender and receiver
    Broker,
    /// Times the stream and publishes the result back
    Receiver,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Sender => write!(f, "sender"),
            Role::Broker => write!(f, "broker"),
            Role::Receiver => write!(f, "receiver"),
        }
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sender" => Ok(Role::Sender),
            "broker" => Ok(Role::Broker),
            "receiver" => Ok(Role::Receiver),
            other => Err(Error::Config(format!("unknown role '{}'", other))),
        }
    }
}

/// Unit applied to configured and sampled delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelayUnit {
    #[default]
    Micros,
    Millis,
}

impl DelayUnit {
    /// Converts a raw delay value in this unit into a `Duration`.
    pub fn to_duration(self, value: u64) -> Duration {
        match self {
            DelayUnit::Micros => Duration::from_micros(value),
            DelayUnit::Millis => Duration::from_millis(value),
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            DelayUnit::Micros => "us",
            DelayUnit::Millis => "ms",
        }
    }
}

/// Configuration for one benchmark run.
///
/// A run is fixed for its whole lifetime. Use the named constructors and the
/// `with_*` builder methods, then call [`RunConfig::validate`] before handing
/// the configuration to a coordinator.
///
/// # Examples
///
/// ## Uniform run with a fixed message count
///
/// ```
/// use mqbench::RunConfig;
///
/// let config = RunConfig::uniform(100).with_message_count(1000);
/// assert!(config.validate().is_ok());
/// ```
///
/// ## Poisson run bounded by duration
///
/// ```
/// use mqbench::RunConfig;
/// use std::time::Duration;
///
/// let config = RunConfig::poisson()
///     .with_avg_size(2048)
///     .with_duration(Duration::from_secs(5));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Traffic model
    pub distribution: Distribution,

    /// Free-form run name echoed in the report
    pub name: Option<String>,

    /// Fixed payload size in bytes
    pub message_size: Option<usize>,

    /// Stop after this many messages
    pub message_count: Option<u64>,

    /// Stop once this much time has elapsed since the first send
    pub duration: Option<Duration>,

    /// Fixed delay between sends (uniform mode), in `delay_unit`
    pub delay: Option<u64>,

    /// Mean payload size in bytes (Poisson mode)
    pub avg_size: Option<usize>,

    /// Mean inter-send delay in `delay_unit` (Poisson mode)
    pub avg_delay: Option<u64>,

    /// Unit of `delay` and `avg_delay`
    pub delay_unit: DelayUnit,

    /// Seed for the samplers and payload bytes; random when absent
    pub seed: Option<u64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            distribution: Distribution::Uniform,
            name: None,
            message_size: Some(1000),
            message_count: Some(1000),
            duration: None,
            delay: None,
            avg_size: None,
            avg_delay: None,
            delay_unit: DelayUnit::Micros,
            seed: None,
        }
    }
}

impl RunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uniform run sending `message_size` bytes per message.
    ///
    /// The default stop condition is 1000 messages.
    pub fn uniform(message_size: usize) -> Self {
        Self {
            distribution: Distribution::Uniform,
            message_size: Some(message_size),
            ..Default::default()
        }
    }

    /// Poisson run with no sizes, delays or stop condition set yet.
    pub fn poisson() -> Self {
        Self {
            distribution: Distribution::Poisson,
            message_size: None,
            message_count: None,
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_message_size(mut self, size: usize) -> Self {
        self.message_size = Some(size);
        self
    }

    pub fn with_message_count(mut self, count: u64) -> Self {
        self.message_count = Some(count);
        self
    }

    /// Removes the message-count stop condition.
    pub fn without_message_count(mut self) -> Self {
        self.message_count = None;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Sets the fixed delay applied before every uniform send.
    pub fn with_delay(mut self, delay: u64) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_avg_size(mut self, avg_size: usize) -> Self {
        self.avg_size = Some(avg_size);
        self
    }

    pub fn with_avg_delay(mut self, avg_delay: u64) -> Self {
        self.avg_delay = Some(avg_delay);
        self
    }

    pub fn with_delay_unit(mut self, unit: DelayUnit) -> Self {
        self.delay_unit = unit;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Checks the invariants the coordinators rely on.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` when:
    /// - a uniform run has no message size (zero is a valid, header-only size)
    /// - a Poisson run has neither `message_size` nor `avg_size`
    /// - `avg_delay` is outside [1, 1000]
    /// - `avg_size` is outside [1024, 1048576]
    pub fn validate(&self) -> Result<()> {
        match self.distribution {
            Distribution::Uniform => {
                if self.message_size.is_none() {
                    return Err(Error::Config(
                        "uniform mode requires a message size".to_string(),
                    ));
                }
            }
            Distribution::Poisson => {
                if self.message_size.is_none() && self.avg_size.is_none() {
                    return Err(Error::Config(
                        "poisson mode requires messageSize or avgSize".to_string(),
                    ));
                }
            }
        }

        if let Some(avg_delay) = self.avg_delay {
            if !(MIN_AVG_DELAY..=MAX_AVG_DELAY).contains(&avg_delay) {
                return Err(Error::Config(format!(
                    "avgDelay must be within [{}, {}], got {}",
                    MIN_AVG_DELAY, MAX_AVG_DELAY, avg_delay
                )));
            }
        }

        if let Some(avg_size) = self.avg_size {
            if !(MIN_AVG_SIZE..=MAX_AVG_SIZE).contains(&avg_size) {
                return Err(Error::Config(format!(
                    "avgSize must be within [{}, {}], got {}",
                    MIN_AVG_SIZE, MAX_AVG_SIZE, avg_size
                )));
            }
        }

        Ok(())
    }

    /// Short description of the stop condition(s), e.g. `"1000 messages"`.
    pub fn stop_condition(&self) -> String {
        match (self.message_count, self.duration) {
            (Some(count), Some(duration)) => {
                format!("{} messages or {}s", count, duration.as_secs_f64())
            }
            (Some(count), None) => format!("{} messages", count),
            (None, Some(duration)) => format!("{}s", duration.as_secs_f64()),
            (None, None) => "unbounded".to_string(),
        }
    }
}

//! Traffic generation: the sequence of (payload size, pre-send delay) pairs.
//!
//! The generator is pulled lazily by the sender. It ends when the configured
//! message count is exhausted or when the configured duration has elapsed
//! since the first pull, whichever happens first. With neither configured it
//! never ends and the sender must be cancelled.

use crate::config::{DelayUnit, Distribution, RunConfig};
use crate::poisson::PoissonSampler;
use crate::Result;
use std::time::{Duration, Instant};

/// One message to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Emission {
    /// Payload size in bytes (excluding the timestamp header)
    pub size: usize,
    /// How long to wait before sending
    pub delay: Duration,
}

#[derive(Debug)]
enum SizeSource {
    Fixed(usize),
    /// Samples are in KiB and scaled to bytes
    Poisson(PoissonSampler),
}

#[derive(Debug)]
enum DelaySource {
    Fixed(Duration),
    Poisson(PoissonSampler, DelayUnit),
}

/// Lazy producer of [`Emission`]s for one run.
///
/// # Examples
///
/// ```
/// use mqbench::traffic::TrafficGenerator;
/// use mqbench::RunConfig;
///
/// let config = RunConfig::uniform(100).with_message_count(3);
/// let generator = TrafficGenerator::new(&config).unwrap();
///
/// let sizes: Vec<usize> = generator.map(|e| e.size).collect();
/// assert_eq!(sizes, vec![100, 100, 100]);
/// ```
#[derive(Debug)]
pub struct TrafficGenerator {
    size: SizeSource,
    delay: DelaySource,
    remaining: Option<u64>,
    duration: Option<Duration>,
    started: Option<Instant>,
    max_payload: usize,
}

impl TrafficGenerator {
    /// Builds the generator for a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the configuration is invalid.
    pub fn new(config: &RunConfig) -> Result<Self> {
        config.validate()?;

        let message_size = config.message_size.unwrap_or(0);
        let fixed_delay = config
            .delay
            .map(|d| config.delay_unit.to_duration(d))
            .unwrap_or(Duration::ZERO);

        let (size, delay, max_payload) = match config.distribution {
            Distribution::Uniform => (
                SizeSource::Fixed(message_size),
                DelaySource::Fixed(fixed_delay),
                message_size,
            ),
            Distribution::Poisson => {
                let (size, max_payload) = match config.avg_size {
                    Some(avg_size) => {
                        let lambda = avg_size as f64 / 1024.0;
                        let sampler = match config.seed {
                            Some(seed) => PoissonSampler::with_seed(lambda, seed)?,
                            None => PoissonSampler::new(lambda)?,
                        };
                        (SizeSource::Poisson(sampler), 2 * avg_size)
                    }
                    None => (SizeSource::Fixed(message_size), message_size),
                };
                let delay = match config.avg_delay {
                    Some(avg_delay) => {
                        let lambda = avg_delay as f64;
                        let sampler = match config.seed {
                            Some(seed) => PoissonSampler::with_seed(lambda, seed.wrapping_add(1))?,
                            None => PoissonSampler::new(lambda)?,
                        };
                        DelaySource::Poisson(sampler, config.delay_unit)
                    }
                    None => DelaySource::Fixed(Duration::ZERO),
                };
                (size, delay, max_payload)
            }
        };

        Ok(Self {
            size,
            delay,
            remaining: config.message_count,
            duration: config.duration,
            started: None,
            max_payload,
        })
    }

    /// Payload buffer size to pre-allocate: `2 * avg_size`, or the fixed size.
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Time of the first pull, if any.
    pub fn started_at(&self) -> Option<Instant> {
        self.started
    }

    /// Whether the generator can end on its own.
    pub fn is_bounded(&self) -> bool {
        self.remaining.is_some() || self.duration.is_some()
    }

    fn exhausted(&self, now: Instant) -> bool {
        if self.remaining == Some(0) {
            return true;
        }
        match (self.duration, self.started) {
            (Some(duration), Some(started)) => now.duration_since(started) >= duration,
            _ => false,
        }
    }
}

impl Iterator for TrafficGenerator {
    type Item = Emission;

    fn next(&mut self) -> Option<Emission> {
        let now = Instant::now();
        self.started.get_or_insert(now);
        if self.exhausted(now) {
            return None;
        }
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= 1;
        }

        let size = match &mut self.size {
            SizeSource::Fixed(size) => *size,
            SizeSource::Poisson(sampler) => sampler.sample() as usize * 1024,
        };
        let delay = match &mut self.delay {
            DelaySource::Fixed(delay) => *delay,
            DelaySource::Poisson(sampler, unit) => unit.to_duration(sampler.sample()),
        };

        Some(Emission { size, delay })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_count() {
        let config = RunConfig::uniform(64).with_message_count(5).with_delay(10);
        let generator = TrafficGenerator::new(&config).unwrap();
        assert_eq!(generator.max_payload(), 64);

        let emissions: Vec<_> = generator.collect();
        assert_eq!(emissions.len(), 5);
        assert!(emissions.iter().all(|e| e.size == 64));
        assert!(emissions
            .iter()
            .all(|e| e.delay == Duration::from_micros(10)));
    }

    #[test]
    fn test_uniform_delay_in_millis() {
        let config = RunConfig::uniform(1)
            .with_message_count(1)
            .with_delay(2)
            .with_delay_unit(DelayUnit::Millis);
        let mut generator = TrafficGenerator::new(&config).unwrap();
        assert_eq!(generator.next().unwrap().delay, Duration::from_millis(2));
    }

    #[test]
    fn test_zero_count_is_empty() {
        let config = RunConfig::uniform(1).with_message_count(0);
        let mut generator = TrafficGenerator::new(&config).unwrap();
        assert!(generator.next().is_none());
    }

    #[test]
    fn test_poisson_sizes_are_kib_multiples() {
        let config = RunConfig::poisson()
            .with_avg_size(4096)
            .with_message_count(2000)
            .with_seed(11);
        let generator = TrafficGenerator::new(&config).unwrap();
        assert_eq!(generator.max_payload(), 8192);

        let sizes: Vec<usize> = generator.map(|e| e.size).collect();
        assert_eq!(sizes.len(), 2000);
        assert!(sizes.iter().all(|s| s % 1024 == 0));
        let mean = sizes.iter().sum::<usize>() as f64 / sizes.len() as f64;
        assert!((mean - 4096.0).abs() < 300.0, "mean size {}", mean);
    }

    #[test]
    fn test_poisson_without_size_uses_message_size() {
        let config = RunConfig::poisson()
            .with_message_size(300)
            .with_avg_delay(5)
            .with_message_count(100)
            .with_seed(3);
        let emissions: Vec<_> = TrafficGenerator::new(&config).unwrap().collect();
        assert!(emissions.iter().all(|e| e.size == 300));
        let mean_us = emissions
            .iter()
            .map(|e| e.delay.as_micros() as f64)
            .sum::<f64>()
            / emissions.len() as f64;
        assert!(mean_us > 3.0 && mean_us < 7.0, "mean delay {}us", mean_us);
    }

    #[test]
    fn test_poisson_without_delay_sends_back_to_back() {
        let config = RunConfig::poisson()
            .with_avg_size(2048)
            .with_message_count(10);
        let generator = TrafficGenerator::new(&config).unwrap();
        assert!(generator.into_iter().all(|e| e.delay == Duration::ZERO));
    }

    #[test]
    fn test_duration_stop() {
        let config = RunConfig::poisson()
            .with_message_size(1)
            .with_duration(Duration::from_millis(30));
        let mut generator = TrafficGenerator::new(&config).unwrap();
        assert!(generator.is_bounded());

        let start = Instant::now();
        let mut count = 0u64;
        while generator.next().is_some() {
            count += 1;
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(count > 0);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_count_wins_race_with_long_duration() {
        let config = RunConfig::uniform(1)
            .with_message_count(3)
            .with_duration(Duration::from_secs(60));
        assert_eq!(TrafficGenerator::new(&config).unwrap().count(), 3);
    }

    #[test]
    fn test_unbounded() {
        let config = RunConfig::uniform(1).without_message_count();
        let mut generator = TrafficGenerator::new(&config).unwrap();
        assert!(!generator.is_bounded());
        assert_eq!(generator.by_ref().take(10_000).count(), 10_000);
        assert!(generator.started_at().is_some());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = RunConfig::poisson().with_avg_size(10);
        assert!(TrafficGenerator::new(&config).is_err());
    }
}

//! Poisson sampling by inverse CDF with a memoized, append-only CDF table.
//!
//! The sampler draws `u` uniformly from `[0, 1)` and returns the smallest `k`
//! with `cdf(k) >= u`. The table is extended lazily: asking for a `k` that is
//! already cached is a plain lookup, and growing it from `n` to `k` costs
//! `k - n` steps.
//!
//! The probability mass is evaluated with the recurrence
//! `pmf(k) = pmf(k - 1) * lambda / k`, dividing by `e` one unit at a time while
//! the running product is above one. This keeps both `lambda^k` and
//! `e^lambda` out of the computation, so large rates such as `lambda = 1024`
//! neither overflow nor collapse to zero at the mode.
//!
//! # Examples
//!
//! ```
//! use mqbench::poisson::PoissonSampler;
//!
//! let mut sampler = PoissonSampler::with_seed(4.0, 7).unwrap();
//! let mean = (0..10_000).map(|_| sampler.sample() as f64).sum::<f64>() / 10_000.0;
//! assert!((mean - 4.0).abs() < 0.2);
//! ```

use crate::{Error, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::E;

/// Poisson(lambda) sampler.
#[derive(Debug, Clone)]
pub struct PoissonSampler<R = StdRng> {
    lambda: f64,
    cdf: Vec<f64>,
    // Running product for the next pmf term, with part of e^-lambda applied.
    scaled: f64,
    // Exponent of e still to be divided out of `scaled`.
    budget: f64,
    rng: R,
}

impl PoissonSampler<StdRng> {
    /// Creates a sampler seeded from the operating system.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` unless `lambda` is finite and positive.
    pub fn new(lambda: f64) -> Result<Self> {
        Self::with_rng(lambda, StdRng::from_entropy())
    }

    /// Creates a sampler with a reproducible random stream.
    pub fn with_seed(lambda: f64, seed: u64) -> Result<Self> {
        Self::with_rng(lambda, StdRng::seed_from_u64(seed))
    }
}

impl<R: Rng> PoissonSampler<R> {
    /// Creates a sampler drawing uniforms from `rng`.
    ///
    /// The CDF table is pre-extended up to `k = 2 * lambda` so that the first
    /// samples do not pay for building it.
    pub fn with_rng(lambda: f64, rng: R) -> Result<Self> {
        if !lambda.is_finite() || lambda <= 0.0 {
            return Err(Error::Config(format!(
                "poisson lambda must be positive, got {}",
                lambda
            )));
        }

        let mut sampler = Self {
            lambda,
            cdf: Vec::new(),
            scaled: 1.0,
            budget: lambda,
            rng,
        };
        let first = sampler.take_pmf(0);
        sampler.cdf.push(first);
        sampler.extend_to((2.0 * lambda).ceil() as usize);
        Ok(sampler)
    }

    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    /// Number of CDF entries computed so far.
    pub fn cached_len(&self) -> usize {
        self.cdf.len()
    }

    /// Cumulative probability `P(X <= k)`, extending the table if needed.
    pub fn cdf(&mut self, k: usize) -> f64 {
        self.extend_to(k);
        self.cdf[k]
    }

    /// Probability mass `P(X = k)` computed from scratch.
    ///
    /// This walks the whole recurrence and does not touch the CDF table.
    pub fn pmf(&self, k: usize) -> f64 {
        let mut result = 1.0;
        let mut remaining = self.lambda;
        for i in 1..=k {
            result *= self.lambda / i as f64;
            if remaining >= 1.0 {
                remaining -= 1.0;
                result /= E;
            }
        }
        result / remaining.exp()
    }

    /// Draws one sample.
    pub fn sample(&mut self) -> u64 {
        let target: f64 = self.rng.gen();
        let mut k = 0usize;
        loop {
            let cumulative = self.cdf(k);
            if target <= cumulative {
                return k as u64;
            }
            // Past the mode the tail has underflowed: the table can no longer
            // grow, so the remaining mass is attributed to this k.
            if k as f64 > self.lambda && k > 0 && cumulative == self.cdf[k - 1] {
                return k as u64;
            }
            k += 1;
        }
    }

    fn extend_to(&mut self, k: usize) {
        while self.cdf.len() <= k {
            let next = self.cdf.len();
            let mass = self.take_pmf(next);
            let last = self.cdf[next - 1];
            self.cdf.push(last + mass);
        }
    }

    // Advances the running product to `k` (callers go in order) and returns pmf(k).
    fn take_pmf(&mut self, k: usize) -> f64 {
        if k > 0 {
            self.scaled *= self.lambda / k as f64;
        }
        while self.budget >= 1.0 && self.scaled > 1.0 {
            self.scaled /= E;
            self.budget -= 1.0;
        }
        self.scaled * (-self.budget).exp()
    }
}

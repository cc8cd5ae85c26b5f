//! Pre-allocated payload bytes for the send loop
//!
//! The sender fills one buffer with random bytes before the run starts and
//! slices a prefix of it for every message, so the hot path never allocates
//! for payload data.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// A buffer of random filler bytes sliced per message
pub struct PayloadBuffer {
    data: Vec<u8>,
    rng: StdRng,
}

impl PayloadBuffer {
    /// Allocates `capacity` random bytes.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Largest payload expected in the run
    /// * `seed` - Seed for the filler bytes, random when `None`
    pub fn new(capacity: usize, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        let mut buffer = Self {
            data: Vec::new(),
            rng,
        };
        buffer.grow(capacity);
        buffer
    }

    /// Returns the first `len` bytes, growing the buffer if a sample exceeds it.
    pub fn slice(&mut self, len: usize) -> &[u8] {
        if len > self.data.len() {
            log::debug!(
                "payload of {} bytes exceeds buffer of {}, growing",
                len,
                self.data.len()
            );
            self.grow(len);
        }
        &self.data[..len]
    }

    /// Current capacity in bytes
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    fn grow(&mut self, len: usize) {
        let start = self.data.len();
        self.data.resize(len, 0);
        self.rng.fill(&mut self.data[start..]);
    }
}

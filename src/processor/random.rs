//! Precomputed random ring used to pick a slot per request.
//!
//! Reading the ring is one atomic fetch-add; there is no per-worker RNG and
//! no lock.

use std::sync::atomic::{AtomicUsize, Ordering};

use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Number of values in the process-wide ring.
pub const RING_SIZE: usize = 1_000_001;

/// Ring of random `u32` values read round-robin.
pub struct RandomRing {
    values: Box<[u32]>,
    cursor: AtomicUsize,
}

impl RandomRing {
    /// Fill a ring of `len` values from `seed`.
    pub fn with_seed(len: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        Self::fill(len, &mut rng)
    }

    /// Fill a ring of `len` values from OS entropy.
    pub fn from_entropy(len: usize) -> Self {
        let mut rng = StdRng::from_entropy();
        Self::fill(len, &mut rng)
    }

    fn fill(len: usize, rng: &mut StdRng) -> Self {
        let values: Vec<u32> = (0..len.max(1)).map(|_| rng.gen()).collect();
        Self {
            values: values.into_boxed_slice(),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Next value of the ring.
    #[inline]
    pub fn next_u32(&self) -> u32 {
        let i = self.cursor.fetch_add(1, Ordering::Relaxed);
        self.values[i % self.values.len()]
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

static GLOBAL_RING: Lazy<RandomRing> = Lazy::new(|| RandomRing::from_entropy(RING_SIZE));

/// Next value of the process-wide ring.
#[inline]
pub fn rand_u32() -> u32 {
    GLOBAL_RING.next_u32()
}

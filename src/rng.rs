//! Seedable random number generator for deterministic testing.
//!
//! When a seed is provided via [`Config::rng_seed`](crate::Config::rng_seed),
//! handshake randoms, session ids and cookie secrets are deterministic. Key
//! exchange secrets always come from the OS.

use rand::distributions::{Distribution, Standard};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// A random number generator that can be seeded for deterministic behavior.
///
/// When created with a seed, it produces deterministic random values.
/// When created without a seed, it uses the thread-local random generator.
pub struct SeededRng {
    inner: Option<StdRng>,
}

impl SeededRng {
    /// Create a new RNG with an optional seed.
    pub fn new(seed: Option<u64>) -> Self {
        let inner = seed.map(StdRng::seed_from_u64);
        Self { inner }
    }

    /// Generate a random value of type T.
    pub fn random<T>(&mut self) -> T
    where
        Standard: Distribution<T>,
    {
        match self.inner.as_mut() {
            Some(rng) => rng.gen(),
            None => rand::random(),
        }
    }

    /// Fill `dest` with random bytes.
    pub fn fill(&mut self, dest: &mut [u8]) {
        match self.inner.as_mut() {
            Some(rng) => rng.fill(dest),
            None => rand::thread_rng().fill(dest),
        }
    }
}

impl std::fmt::Debug for SeededRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let is_seeded = self.inner.is_some();
        f.debug_struct("SeededRng")
            .field("seeded", &is_seeded)
            .finish()
    }
}

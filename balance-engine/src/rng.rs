//! Explicit, seedable randomness for Monte Carlo batches.
//!
//! A user seed is never fed to a generator directly. Each batch derives its
//! own seed from `(user_seed, domain_tag)` and each trial runs on its own
//! ChaCha stream of that seed, so a trial's draws depend only on
//! `(seed, tag, trial_index)` and never on execution order.
use hmac::{Hmac, Mac};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use sha2::Sha256;

/// Derive an independent 64-bit seed for a named stream.
#[must_use]
pub fn derive_stream_seed(user_seed: u64, domain_tag: &[u8]) -> u64 {
    Hmac::<Sha256>::new_from_slice(&user_seed.to_le_bytes()).map_or(user_seed, |mut mac| {
        mac.update(domain_tag);
        let digest = mac.finalize().into_bytes();
        let mut seed_bytes = [0u8; 8];
        seed_bytes.copy_from_slice(&digest[..8]);
        u64::from_le_bytes(seed_bytes)
    })
}

/// Counting wrapper for RNG streams providing instrumentation.
#[derive(Debug, Clone)]
pub struct CountingRng<R> {
    rng: R,
    draws: u64,
}

impl<R> CountingRng<R> {
    pub const fn new(rng: R) -> Self {
        Self { rng, draws: 0 }
    }

    /// Number of draw calls performed against this stream.
    #[must_use]
    pub const fn draws(&self) -> u64 {
        self.draws
    }
}

impl<R: rand::RngCore> rand::RngCore for CountingRng<R> {
    fn next_u32(&mut self) -> u32 {
        self.draws = self.draws.saturating_add(1);
        self.rng.next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.draws = self.draws.saturating_add(1);
        self.rng.next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.draws = self.draws.saturating_add(1);
        self.rng.fill_bytes(dest);
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.draws = self.draws.saturating_add(1);
        self.rng.try_fill_bytes(dest)
    }
}

/// Generator handed to a single Monte Carlo trial.
pub type TrialRng = CountingRng<ChaCha20Rng>;

/// Build the generator for trial `trial_index` of a batch.
#[must_use]
pub fn trial_rng(batch_seed: u64, trial_index: u64) -> TrialRng {
    let mut rng = ChaCha20Rng::seed_from_u64(batch_seed);
    rng.set_stream(trial_index);
    CountingRng::new(rng)
}

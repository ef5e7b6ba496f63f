//! Environment abstraction for deterministic testing.
//!
//! Decouples protocol logic from system resources (wall clock, randomness).
//! Token lifetimes are wall-clock seconds because they are compared across
//! machines; every entropy draw for nonces, session keys and ids goes through
//! the same trait so tests can replay exact byte streams.

use std::sync::{
    Mutex,
    atomic::{AtomicU64, Ordering},
};

use msl_crypto::{ENTROPY_SIZE, Entropy};
use msl_proto::MAX_COUNTER;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Abstract environment providing time and randomness.
///
/// # Safety
///
/// Implementations MUST guarantee:
///
/// - `random_bytes()` uses cryptographically secure entropy in production
/// - Methods are infallible except in exceptional circumstances (e.g., OS
///   entropy exhaustion)
pub trait Environment: Send + Sync {
    /// Seconds since the Unix epoch.
    ///
    /// # Invariants
    ///
    /// - Token expiration, renewal windows and wrap data expiration are all
    ///   compared against this clock.
    fn now_secs(&self) -> u64;

    /// Fills the provided buffer with random bytes.
    ///
    /// # Invariants
    ///
    /// - Given the same RNG seed, this produces the same sequence of bytes
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u64`.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Generates a random value in the 53-bit counter space.
    ///
    /// Used for message ids and token serial numbers.
    fn random_counter(&self) -> u64 {
        self.random_u64() & MAX_COUNTER
    }

    /// Draws an entropy block for a crypto context operation.
    fn entropy(&self) -> Entropy {
        let mut entropy = [0u8; ENTROPY_SIZE];
        self.random_bytes(&mut entropy);
        entropy
    }
}

/// Production environment using the system clock and OS RNG.
///
/// # Panics
///
/// Panics if the OS RNG fails. An endpoint without functioning cryptographic
/// randomness cannot issue session keys, nonces or message ids safely.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    #[allow(clippy::disallowed_methods)]
    #[allow(clippy::expect_used)]
    fn now_secs(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("invariant: system clock is after Unix epoch (1970-01-01)")
            .as_secs()
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer)
            .expect("invariant: OS RNG failure is unrecoverable - endpoint cannot operate securely");
    }
}

/// Deterministic environment with a manual clock and seeded RNG.
///
/// The clock only moves when [`advance`](Self::advance) or
/// [`set_now`](Self::set_now) is called. Two instances built from the same
/// seed produce identical random streams.
#[derive(Debug)]
pub struct FixedEnv {
    now: AtomicU64,
    rng: Mutex<ChaCha20Rng>,
}

impl FixedEnv {
    /// Create an environment at `now` seconds with RNG `seed`.
    pub fn new(now: u64, seed: u64) -> Self {
        Self { now: AtomicU64::new(now), rng: Mutex::new(ChaCha20Rng::seed_from_u64(seed)) }
    }

    /// Move the clock forward.
    pub fn advance(&self, secs: u64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }

    /// Set the clock.
    pub fn set_now(&self, now: u64) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl Environment for FixedEnv {
    fn now_secs(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().expect("Mutex poisoned").fill_bytes(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_env_is_reproducible() {
        let a = FixedEnv::new(1_000, 42);
        let b = FixedEnv::new(1_000, 42);

        assert_eq!(a.entropy(), b.entropy());
        assert_eq!(a.random_u64(), b.random_u64());
    }

    #[test]
    fn fixed_env_clock_moves_only_on_request() {
        let env = FixedEnv::new(1_000, 1);
        assert_eq!(env.now_secs(), 1_000);

        env.advance(15);
        assert_eq!(env.now_secs(), 1_015);

        env.set_now(10);
        assert_eq!(env.now_secs(), 10);
    }

    #[test]
    fn random_counter_within_53_bits() {
        let env = FixedEnv::new(0, 7);
        for _ in 0..1_000 {
            assert!(env.random_counter() <= MAX_COUNTER);
        }
    }

    #[test]
    fn system_env_random_bytes_are_random() {
        let env = SystemEnv::new();

        let mut bytes1 = [0u8; 32];
        let mut bytes2 = [0u8; 32];
        env.random_bytes(&mut bytes1);
        env.random_bytes(&mut bytes2);

        assert_ne!(bytes1, bytes2, "Random bytes should differ");
    }

    #[test]
    fn system_env_clock_is_after_2020() {
        assert!(SystemEnv::new().now_secs() > 1_577_836_800);
    }
}

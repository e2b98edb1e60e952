//! Clock and Rng Capability Seams
//!
//! Two of the four small capability sets from §9 Design Notes
//! (`CryptoProvider` and `KeychainProvider` live in `crypto.rs` /
//! `keychain.rs`). Kept this small on purpose: timestamps and randomness
//! are the only ambient inputs the vault service needs to mock to make
//! recovery-challenge and usage-tracking tests deterministic.

use chrono::{DateTime, Utc};
use rand::Rng as _;

/// Wall-clock time, injectable so that `UsageRecord` monotonicity tests
/// don't depend on real elapsed time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only ever advances when told to — used by recovery and
/// usage-tracking tests that need `updated_at >= created_at` without
/// sleeping.
#[derive(Debug)]
pub struct FixedClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: std::sync::Mutex::new(start) }
    }

    pub fn advance(&self, duration: chrono::Duration) {
        let mut now = self.now.lock().expect("fixed clock lock poisoned");
        *now += duration;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("fixed clock lock poisoned")
    }
}

/// Source of randomness for non-cryptographic choices (recovery challenge
/// position selection). Cryptographic randomness always goes through
/// `crypto::random_bytes`/`random_key`/`random_nonce`, never through this
/// trait — this exists only so challenge-position selection is testable.
pub trait IndexRng: Send + Sync {
    /// Returns a uniformly random index in `[0, bound)`.
    fn gen_below(&self, bound: usize) -> usize;
}

/// The real OS-backed RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRng;

impl IndexRng for SystemRng {
    fn gen_below(&self, bound: usize) -> usize {
        rand::thread_rng().gen_range(0..bound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_only_advances_when_told() {
        let start = Utc::now();
        let clock = FixedClock::new(start);
        assert_eq!(clock.now(), start);
        clock.advance(chrono::Duration::seconds(5));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(5));
    }

    #[test]
    fn system_rng_stays_in_bounds() {
        let rng = SystemRng;
        for _ in 0..50 {
            let v = rng.gen_below(24);
            assert!(v < 24);
        }
    }
}

//! Controlled randomness.
//!
//! Every random choice the client makes (reconnect jitter, drops, fault
//! percentages, weighted picks, random ring hash keys) comes from PRNGs that
//! can be deterministically seeded from the `MERIDIAN_SEED` environment
//! variable, falling back to system entropy.
//!
//! A single global PRNG behind a `Mutex` lazily seeds thread-local PRNGs.
//! After initialization each thread has unfettered access to its own PRNG,
//! a-la `rand::thread_rng()`.

use std::cell::RefCell;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Call a function with access to a thread-local PRNG.
///
/// Prefer this to `rand::thread_rng()`. It's seeded globally so tests can be
/// deterministic.
pub fn with_thread_rng<F, T>(f: F) -> T
where
    F: FnMut(&mut StdRng) -> T,
{
    thread_local! {
        static THREAD_RNG: RefCell<StdRng> = RefCell::new(seeded_std_rng());
    }

    THREAD_RNG.with_borrow_mut(f)
}

pub fn random<T>() -> T
where
    rand::distributions::Standard: rand::distributions::Distribution<T>,
{
    with_thread_rng(|rng| rng.gen())
}

/// A uniformly random value in `[0, upper)`. `upper` must be non-zero.
pub(crate) fn random_below(upper: u64) -> u64 {
    with_thread_rng(|rng| rng.gen_range(0..upper))
}

fn seeded_std_rng() -> StdRng {
    // a poisoned seed rng is still a perfectly good rng.
    let seed = {
        let mut rng = SEED_RNG.lock().unwrap_or_else(|e| e.into_inner());
        rng.gen()
    };
    StdRng::from_seed(seed)
}

static SEED_RNG: Lazy<Mutex<StdRng>> = Lazy::new(|| {
    let env_seed: Option<u64> = match std::env::var("MERIDIAN_SEED") {
        Ok(seed_str) => seed_str.parse().ok(),
        _ => None,
    };

    let rng = match env_seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    Mutex::new(rng)
});

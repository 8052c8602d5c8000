//! I/O abstraction layer
//!
//! TigerStyle: All non-deterministic inputs go through abstraction traits.
//!
//! - **Time**: wall clock, so tests can substitute their own
//! - **Random**: a seedable ChaCha generator, so election jitter and replica
//!   shuffling can be replayed from a seed

use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

// =============================================================================
// Time Provider
// =============================================================================

/// Source of hive time
#[async_trait]
pub trait TimeProvider: Send + Sync + std::fmt::Debug {
    /// Milliseconds since the Unix epoch
    fn now_ms(&self) -> u64;

    async fn sleep_ms(&self, ms: u64);
}

/// System clock and tokio timers
#[derive(Debug, Clone, Default)]
pub struct WallClockTime;

impl WallClockTime {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TimeProvider for WallClockTime {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    async fn sleep_ms(&self, ms: u64) {
        tokio::time::sleep(tokio::time::Duration::from_millis(ms)).await;
    }
}

// =============================================================================
// RNG Provider
// =============================================================================

/// Shared random source for election jitter and replica choice
pub trait RngProvider: Send + Sync + std::fmt::Debug {
    fn next_u64(&self) -> u64;

    /// Uniform value in `[min, max)`; panics when the range is empty
    fn gen_range(&self, min: u64, max: u64) -> u64 {
        assert!(min < max, "min must be less than max");
        min + (self.next_u64() % (max - min))
    }
}

/// ChaCha-backed RNG provider
///
/// Seeded instances produce the same sequence on every run.
#[derive(Debug)]
pub struct ChaChaRngProvider {
    rng: Mutex<ChaCha8Rng>,
}

impl Default for ChaChaRngProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ChaChaRngProvider {
    /// Create a provider seeded from OS entropy
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(ChaCha8Rng::from_entropy()),
        }
    }

    /// Provider replaying the sequence of `seed`
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
        }
    }
}

impl RngProvider for ChaChaRngProvider {
    fn next_u64(&self) -> u64 {
        match self.rng.lock() {
            Ok(mut rng) => rng.next_u64(),
            Err(poisoned) => poisoned.into_inner().next_u64(),
        }
    }

    fn gen_range(&self, min: u64, max: u64) -> u64 {
        assert!(min < max, "min must be less than max");
        match self.rng.lock() {
            Ok(mut rng) => rng.gen_range(min..max),
            Err(poisoned) => poisoned.into_inner().gen_range(min..max),
        }
    }
}

/// [`RngCore`] view of an [`RngProvider`], for `rand`'s helpers
pub struct ProviderRng<'a>(pub &'a dyn RngProvider);

impl RngCore for ProviderRng<'_> {
    fn next_u32(&mut self) -> u32 {
        (self.0.next_u64() >> 32) as u32
    }

    fn next_u64(&mut self) -> u64 {
        self.0.next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(8) {
            let bytes = self.0.next_u64().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

/// Shuffle `items` uniformly with randomness from `rng`
pub fn shuffle<T>(rng: &dyn RngProvider, items: &mut [T]) {
    items.shuffle(&mut ProviderRng(rng));
}

// =============================================================================
// I/O Context
// =============================================================================

/// Clock and random source handed to every hive component
#[derive(Clone)]
pub struct IoContext {
    pub time: Arc<dyn TimeProvider>,
    pub rng: Arc<dyn RngProvider>,
}

impl std::fmt::Debug for IoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoContext")
            .field("time", &self.time)
            .field("rng", &format!("{:?}", self.rng))
            .finish()
    }
}

impl Default for IoContext {
    fn default() -> Self {
        Self::production()
    }
}

impl IoContext {
    /// Wall clock with an entropy-seeded RNG
    pub fn production() -> Self {
        Self {
            time: Arc::new(WallClockTime::new()),
            rng: Arc::new(ChaChaRngProvider::new()),
        }
    }

    /// Wall clock with a seeded RNG
    pub fn seeded(seed: u64) -> Self {
        Self {
            time: Arc::new(WallClockTime::new()),
            rng: Arc::new(ChaChaRngProvider::with_seed(seed)),
        }
    }

    pub fn new(time: Arc<dyn TimeProvider>, rng: Arc<dyn RngProvider>) -> Self {
        Self { time, rng }
    }

    pub fn now_ms(&self) -> u64 {
        self.time.now_ms()
    }

    pub async fn sleep_ms(&self, ms: u64) {
        self.time.sleep_ms(ms).await;
    }

    /// Shuffle a slice with this context's RNG
    pub fn shuffle<T>(&self, items: &mut [T]) {
        shuffle(self.rng.as_ref(), items);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wall_clock_time_now_ms() {
        let clock = WallClockTime::new();
        let first = clock.now_ms();
        // 2020-01-01
        assert!(first > 1_577_836_800_000);
        assert!(clock.now_ms() >= first);
    }

    #[tokio::test]
    async fn test_wall_clock_time_sleep() {
        let ctx = IoContext::production();
        let start = ctx.now_ms();
        ctx.sleep_ms(10).await;
        let elapsed = ctx.now_ms() - start;
        assert!(elapsed >= 9, "elapsed: {}", elapsed);
    }

    #[test]
    fn test_seeded_rng_is_deterministic() {
        let a = IoContext::seeded(12345);
        let b = IoContext::seeded(12345);
        let left: Vec<u64> = (0..16).map(|_| a.rng.next_u64()).collect();
        let right: Vec<u64> = (0..16).map(|_| b.rng.next_u64()).collect();
        assert_eq!(left, right);
    }

    #[test]
    fn test_gen_range_bounds() {
        let rng = ChaChaRngProvider::with_seed(42);

        for _ in 0..100 {
            let value = rng.gen_range(10, 20);
            assert!((10..20).contains(&value));
        }
    }

    #[test]
    fn test_shuffle_is_a_permutation() {
        let rng = ChaChaRngProvider::with_seed(7);
        let mut items: Vec<u32> = (0..50).collect();
        shuffle(&rng, &mut items);

        let mut sorted = items.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..50).collect::<Vec<_>>());
        assert_ne!(items, sorted);
    }

    #[test]
    fn test_shuffle_reaches_every_position() {
        let ctx = IoContext::seeded(99);
        let mut first_seen = [false; 4];
        for _ in 0..200 {
            let mut items = [0u8, 1, 2, 3];
            ctx.shuffle(&mut items);
            first_seen[items[0] as usize] = true;
        }
        assert!(first_seen.iter().all(|seen| *seen));
    }

    #[test]
    fn test_shuffle_replays_from_seed() {
        let shuffled = |seed| {
            let rng = ChaChaRngProvider::with_seed(seed);
            let mut items: Vec<u32> = (0..20).collect();
            shuffle(&rng, &mut items);
            items
        };
        assert_eq!(shuffled(3), shuffled(3));
        assert_ne!(shuffled(3), shuffled(4));
    }

    #[test]
    fn test_provider_rng_fills_partial_words() {
        let provider = ChaChaRngProvider::with_seed(11);
        let mut rng = ProviderRng(&provider);
        let mut bytes = [0u8; 13];
        rng.fill_bytes(&mut bytes);
        assert!(bytes.iter().any(|b| *b != 0));
    }
}

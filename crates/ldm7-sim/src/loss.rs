//! Deterministic loss injection.

use async_trait::async_trait;
use ldm7::{ChannelTransport, McastSender};
use pq::ProductInfo;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::Mutex;

/// Folds the harness's three-part seed into one RNG seed.
pub fn seed_from_triple(a: u64, b: u64, c: u64) -> u64 {
    a ^ b.rotate_left(21) ^ c.rotate_left(42)
}

/// Replays the backstop-exercise schedule: how many of `count` draws from
/// the seeded RNG fall under `rate`.
pub fn expected_deletions(seed: u64, rate: f64, count: usize) -> u64 {
    let mut rng = SmallRng::seed_from_u64(seed);
    (0..count).filter(|_| rng.gen::<f64>() < rate).count() as u64
}

/// A multicast sender that drops whole products by index and reports them
/// lost, exactly as a transport's NACK timeout would.
pub struct LossyTransport {
    inner: ChannelTransport,
    drop: Mutex<HashSet<u32>>,
}

impl LossyTransport {
    pub fn new(inner: ChannelTransport, drop: HashSet<u32>) -> LossyTransport {
        LossyTransport {
            inner,
            drop: Mutex::new(drop),
        }
    }
}

#[async_trait]
impl McastSender for LossyTransport {
    async fn send(&self, index: u32, info: &ProductInfo, data: &[u8]) -> ldm7::Result<()> {
        let dropped = self
            .drop
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&index);
        if dropped {
            tracing::info!(index, "dropping product on the multicast path");
            self.inner.inject_missed(index);
            return Ok(());
        }
        self.inner.send(index, info, data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deletion_schedule_is_deterministic() {
        let seed = seed_from_triple(1, 2, 3);
        assert_eq!(
            expected_deletions(seed, 0.1, 1000),
            expected_deletions(seed, 0.1, 1000)
        );
        assert_eq!(expected_deletions(seed, 0.0, 100), 0);
        assert_eq!(expected_deletions(seed, 1.0, 100), 100);
    }
}

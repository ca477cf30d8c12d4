//! Synthetic flow used while the hub is unreachable

use crate::shared::schedule::Throttle;
use crate::shared::types::SamplePoint;
use chrono::{DateTime, Utc};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::time::{Duration, Instant};

pub const SIMULATION_INTERVAL: Duration = Duration::from_secs(2);

/// Starting point when there is no history to continue from
const SEED_PRICE: f64 = 600.0;

#[derive(Debug, Clone)]
pub struct SimulatedFeed {
    rng: StdRng,
    throttle: Throttle,
}

impl SimulatedFeed {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            throttle: Throttle::new(SIMULATION_INTERVAL),
        }
    }

    /// Produce the next sample if the interval has elapsed
    pub fn poll(
        &mut self,
        tick: Instant,
        now: DateTime<Utc>,
        previous: Option<SamplePoint>,
    ) -> Option<SamplePoint> {
        if !self.throttle.try_fire(tick) {
            return None;
        }
        Some(self.next_sample(now, previous))
    }

    /// Random walk continuing `previous`: calls grow, puts shrink, price drifts
    pub fn next_sample(&mut self, now: DateTime<Utc>, previous: Option<SamplePoint>) -> SamplePoint {
        let base = previous.unwrap_or(SamplePoint::new(now, 0.0, 0.0, SEED_PRICE));
        let timestamp = now.max(base.timestamp);

        SamplePoint::new(
            timestamp,
            base.call_flow + self.rng.random_range(0.15..0.35),
            base.put_flow - self.rng.random_range(0.10..0.25),
            base.price + self.rng.random_range(-0.15..0.15),
        )
    }
}

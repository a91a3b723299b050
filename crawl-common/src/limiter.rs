//! Multi-stratum rate limiting.
//!
//! A task can carry several token buckets at once (say, 1/s sustained plus
//! a 20/min window). A fetch proceeds only once every stratum admits it, so
//! the observed rate never exceeds the slowest bucket.

use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// One token-bucket stratum: `event_count` events per `event_dur`, with a
/// bucket of `bucket` for bursts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimitSpec {
    pub event_count: u32,
    pub event_dur: Duration,
    pub bucket: u32,
}

impl LimitSpec {
    pub fn new(event_count: u32, event_dur: Duration, bucket: u32) -> Self {
        Self {
            event_count,
            event_dur,
            bucket,
        }
    }

    fn rate(&self) -> f64 {
        f64::from(self.event_count) / self.event_dur.as_secs_f64()
    }

    /// Token replenishment interval, `event_dur / event_count`.
    fn period(&self) -> Duration {
        let period = self.event_dur / self.event_count.max(1);
        if period.is_zero() {
            Duration::from_nanos(1)
        } else {
            period
        }
    }
}

/// Composed token buckets, waited on slowest-first.
pub struct MultiLimiter {
    limiters: Vec<(f64, DirectLimiter)>,
}

impl MultiLimiter {
    pub fn new(specs: Vec<LimitSpec>) -> Self {
        let mut specs: Vec<LimitSpec> = specs
            .into_iter()
            .filter(|s| s.event_count > 0 && !s.event_dur.is_zero())
            .collect();
        // Waiting on the slowest stratum first keeps faster buckets from
        // leaking tokens while we sleep.
        specs.sort_by(|a, b| a.rate().total_cmp(&b.rate()));

        let limiters = specs
            .into_iter()
            .map(|spec| {
                let burst = NonZeroU32::new(spec.bucket.max(1)).expect("burst is at least one");
                let quota = Quota::with_period(spec.period())
                    .expect("limit period is non-zero")
                    .allow_burst(burst);
                (spec.rate(), RateLimiter::direct(quota))
            })
            .collect();
        Self { limiters }
    }

    /// A limiter that admits everything. Tasks without configured limits
    /// use this.
    pub fn unlimited() -> Self {
        Self {
            limiters: Vec::new(),
        }
    }

    /// Block until every stratum admits one event.
    pub async fn wait(&self) {
        for (_, limiter) in &self.limiters {
            limiter.until_ready().await;
        }
    }

    /// Rate of the slowest stratum in events per second, if any.
    pub fn min_rate(&self) -> Option<f64> {
        self.limiters.first().map(|(rate, _)| *rate)
    }

    pub fn is_unlimited(&self) -> bool {
        self.limiters.is_empty()
    }
}

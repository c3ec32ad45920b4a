use std::fmt;

use parking_lot::Mutex;

use crate::Bucket;
use crate::BucketError;
use crate::ConsumptionProbe;
use crate::configuration::BucketConfiguration;
use crate::error;
use crate::state::BucketState;
use crate::time::MonotonicTimeSource;
use crate::time::TimeSource;

/// A bucket that serializes every operation behind a mutex.
///
/// The time sample is taken before the lock is acquired; the critical
/// section is exactly the refill-inspect-mutate sequence, so successful
/// operations linearize in lock-acquisition order. Under contention
/// threads block on the lock; fairness follows the underlying mutex.
pub struct SynchronizedBucket<T = MonotonicTimeSource> {
    configuration: BucketConfiguration,
    time_source: T,
    state: Mutex<BucketState>,
}

impl SynchronizedBucket<MonotonicTimeSource> {
    /// Builds a bucket reading the monotonic clock.
    pub fn new(configuration: BucketConfiguration) -> Self {
        Self::with_time_source(configuration, MonotonicTimeSource::new())
    }
}

impl<T: TimeSource> SynchronizedBucket<T> {
    /// Builds a bucket reading the given time source.
    pub fn with_time_source(configuration: BucketConfiguration, time_source: T) -> Self {
        let state = BucketState::initial(&configuration, time_source.current_time_nanos());
        Self {
            configuration,
            time_source,
            state: Mutex::new(state),
        }
    }
}

impl<T: TimeSource> Bucket for SynchronizedBucket<T> {
    fn try_consume(&self, tokens: u64) -> Result<bool, BucketError> {
        self.configuration.check_consumption(tokens)?;
        let now = self.time_source.current_time_nanos();
        let mut state = self.state.lock();
        state.refill_all(self.configuration.bandwidths(), now);
        if tokens > state.available_tokens() {
            return Ok(false);
        }
        state.consume(tokens);
        Ok(true)
    }

    fn try_consume_and_return_remaining(
        &self,
        tokens: u64,
    ) -> Result<ConsumptionProbe, BucketError> {
        self.configuration.check_consumption(tokens)?;
        let now = self.time_source.current_time_nanos();
        let mut state = self.state.lock();
        state.refill_all(self.configuration.bandwidths(), now);
        let available = state.available_tokens();
        if tokens > available {
            let wait = state.nanos_until_consumable(self.configuration.bandwidths(), tokens, now);
            return Ok(ConsumptionProbe::Rejected {
                remaining_tokens: available,
                nanos_to_wait_for_refill: wait,
            });
        }
        state.consume(tokens);
        Ok(ConsumptionProbe::Consumed {
            remaining_tokens: available - tokens,
        })
    }

    fn consume_as_much_as_possible(&self, limit: u64) -> u64 {
        let now = self.time_source.current_time_nanos();
        let mut state = self.state.lock();
        state.refill_all(self.configuration.bandwidths(), now);
        let to_consume = limit.min(state.available_tokens());
        if to_consume == 0 {
            return 0;
        }
        state.consume(to_consume);
        to_consume
    }

    fn reserve_and_calculate_time_to_sleep(
        &self,
        tokens: u64,
        wait_limit_nanos: u64,
    ) -> Result<u64, BucketError> {
        error::ensure_positive(tokens)?;
        let now = self.time_source.current_time_nanos();
        let mut state = self.state.lock();
        state.refill_all(self.configuration.bandwidths(), now);
        let delay = state.nanos_until_consumable(self.configuration.bandwidths(), tokens, now);
        if wait_limit_nanos > 0 && delay > wait_limit_nanos {
            trace!(delay, wait_limit_nanos, "reservation exceeds wait limit");
            return Ok(u64::MAX);
        }
        state.consume(tokens);
        Ok(delay)
    }

    fn add_tokens(&self, tokens: u64) -> Result<(), BucketError> {
        error::ensure_positive(tokens)?;
        let now = self.time_source.current_time_nanos();
        let mut state = self.state.lock();
        state.refill_all(self.configuration.bandwidths(), now);
        state.add_tokens(self.configuration.bandwidths(), tokens);
        Ok(())
    }

    fn available_tokens(&self) -> u64 {
        let now = self.time_source.current_time_nanos();
        let mut state = self.state.lock();
        state.refill_all(self.configuration.bandwidths(), now);
        state.available_tokens()
    }

    fn create_snapshot(&self) -> BucketState {
        self.state.lock().clone()
    }

    fn configuration(&self) -> &BucketConfiguration {
        &self.configuration
    }
}

impl<T: TimeSource> fmt::Debug for SynchronizedBucket<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SynchronizedBucket")
            .field("state", &*self.state.lock())
            .field("configuration", &self.configuration)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU64;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use crate::Bandwidth;
    use crate::Bucket;
    use crate::BucketConfiguration;
    use crate::ManualTimeSource;
    use crate::SynchronizedBucket;

    #[test]
    fn threads_split_the_bucket_exactly() {
        let configuration = BucketConfiguration::new(vec![Bandwidth::greedy(
            NonZeroU64::new(100).unwrap(),
            NonZeroU64::new(1).unwrap(),
            Duration::from_secs(3600),
        )]);
        let bucket = Arc::new(SynchronizedBucket::with_time_source(
            configuration,
            Arc::new(ManualTimeSource::new()),
        ));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let bucket = Arc::clone(&bucket);
            handles.push(thread::spawn(move || {
                let mut granted = 0u64;
                for _ in 0..50 {
                    if bucket.try_consume(1).unwrap() {
                        granted += 1;
                    }
                }
                granted
            }));
        }

        let granted: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(granted, 100);
        assert_eq!(bucket.available_tokens(), 0);
    }
}

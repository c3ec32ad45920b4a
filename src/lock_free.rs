use std::fmt;
use std::mem;
use std::ops::ControlFlow;
use std::sync::atomic::Ordering;

use crossbeam_epoch::{self as epoch, Atomic, Owned};

use crate::Bucket;
use crate::BucketError;
use crate::ConsumptionProbe;
use crate::configuration::BucketConfiguration;
use crate::error;
use crate::state::BucketState;
use crate::time::MonotonicTimeSource;
use crate::time::TimeSource;

/// A bucket whose operations never block.
///
/// The state lives behind an atomically swappable pointer and is immutable
/// once published. A writer clones it, applies refill and mutation to the
/// clone, and installs the clone with a compare-and-swap, retrying from the
/// freshly published state when another writer got there first. Readers
/// clone and discard; they never publish anything.
///
/// Progress is lock-free system-wide rather than per-thread: an operation
/// may retry an unbounded number of times under extreme contention, but
/// every failed compare-and-swap means some other operation succeeded.
pub struct LockFreeBucket<T = MonotonicTimeSource> {
    configuration: BucketConfiguration,
    time_source: T,
    state: Atomic<BucketState>,
}

impl LockFreeBucket<MonotonicTimeSource> {
    /// Builds a bucket reading the monotonic clock.
    pub fn new(configuration: BucketConfiguration) -> Self {
        Self::with_time_source(configuration, MonotonicTimeSource::new())
    }
}

impl<T: TimeSource> LockFreeBucket<T> {
    /// Builds a bucket reading the given time source.
    pub fn with_time_source(configuration: BucketConfiguration, time_source: T) -> Self {
        let state = BucketState::initial(&configuration, time_source.current_time_nanos());
        Self {
            configuration,
            time_source,
            state: Atomic::new(state),
        }
    }

    /// Runs one refill-inspect-mutate cycle against a private working copy
    /// and publishes it, retrying until the compare-and-swap wins.
    ///
    /// `op` returns `Continue` to publish its mutation or `Break` to finish
    /// without touching the shared pointer (the speculative refill is then
    /// simply discarded). The time sample is taken once, before the loop;
    /// a retry re-applies refill to the newly observed state with the same
    /// sample, which is sound because refill never rewinds a bandwidth
    /// whose boundary has already moved past it.
    fn update<R>(&self, mut op: impl FnMut(&mut BucketState, u64) -> ControlFlow<R, R>) -> R {
        let bandwidths = self.configuration.bandwidths();
        let now = self.time_source.current_time_nanos();
        let guard = epoch::pin();
        let mut published = self.state.load(Ordering::Acquire, &guard);
        // A fresh allocation on every entry: the first compare-and-swap can
        // never alias a pointer a concurrent writer is installing, and the
        // epoch guard keeps `published` from being freed and its address
        // recycled while we still compare against it.
        let mut working = Owned::new(unsafe { published.deref() }.clone());
        loop {
            working.refill_all(bandwidths, now);
            match op(&mut working, now) {
                ControlFlow::Break(result) => return result,
                ControlFlow::Continue(result) => {
                    match self.state.compare_exchange(
                        published,
                        working,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        &guard,
                    ) {
                        Ok(_) => {
                            // Pinned peers may still be reading the old
                            // state; retire it instead of dropping now.
                            unsafe { guard.defer_destroy(published) };
                            return result;
                        }
                        Err(race) => {
                            trace!("bucket state changed underneath, retrying");
                            published = race.current;
                            working = race.new;
                            working.copy_state_from(unsafe { published.deref() });
                        }
                    }
                }
            }
        }
    }
}

impl<T: TimeSource> Bucket for LockFreeBucket<T> {
    fn try_consume(&self, tokens: u64) -> Result<bool, BucketError> {
        self.configuration.check_consumption(tokens)?;
        Ok(self.update(|state, _now| {
            if tokens > state.available_tokens() {
                return ControlFlow::Break(false);
            }
            state.consume(tokens);
            ControlFlow::Continue(true)
        }))
    }

    fn try_consume_and_return_remaining(
        &self,
        tokens: u64,
    ) -> Result<ConsumptionProbe, BucketError> {
        self.configuration.check_consumption(tokens)?;
        let bandwidths = self.configuration.bandwidths();
        Ok(self.update(|state, now| {
            let available = state.available_tokens();
            if tokens > available {
                let wait = state.nanos_until_consumable(bandwidths, tokens, now);
                return ControlFlow::Break(ConsumptionProbe::Rejected {
                    remaining_tokens: available,
                    nanos_to_wait_for_refill: wait,
                });
            }
            state.consume(tokens);
            ControlFlow::Continue(ConsumptionProbe::Consumed {
                remaining_tokens: available - tokens,
            })
        }))
    }

    fn consume_as_much_as_possible(&self, limit: u64) -> u64 {
        self.update(|state, _now| {
            let to_consume = limit.min(state.available_tokens());
            if to_consume == 0 {
                return ControlFlow::Break(0);
            }
            state.consume(to_consume);
            ControlFlow::Continue(to_consume)
        })
    }

    fn reserve_and_calculate_time_to_sleep(
        &self,
        tokens: u64,
        wait_limit_nanos: u64,
    ) -> Result<u64, BucketError> {
        error::ensure_positive(tokens)?;
        let bandwidths = self.configuration.bandwidths();
        Ok(self.update(|state, now| {
            let delay = state.nanos_until_consumable(bandwidths, tokens, now);
            if wait_limit_nanos > 0 && delay > wait_limit_nanos {
                trace!(delay, wait_limit_nanos, "reservation exceeds wait limit");
                return ControlFlow::Break(u64::MAX);
            }
            state.consume(tokens);
            ControlFlow::Continue(delay)
        }))
    }

    fn add_tokens(&self, tokens: u64) -> Result<(), BucketError> {
        error::ensure_positive(tokens)?;
        let bandwidths = self.configuration.bandwidths();
        Ok(self.update(|state, _now| {
            state.add_tokens(bandwidths, tokens);
            ControlFlow::Continue(())
        }))
    }

    fn available_tokens(&self) -> u64 {
        let now = self.time_source.current_time_nanos();
        let guard = epoch::pin();
        let published = self.state.load(Ordering::Acquire, &guard);
        // Refill lands on a discarded local copy. Two readers at the same
        // instant compute the same answer independently; neither publishes,
        // which is fine because refill is idempotent over a fixed sample.
        let mut local = unsafe { published.deref() }.clone();
        local.refill_all(self.configuration.bandwidths(), now);
        local.available_tokens()
    }

    fn create_snapshot(&self) -> BucketState {
        let guard = epoch::pin();
        unsafe { self.state.load(Ordering::Acquire, &guard).deref() }.clone()
    }

    fn configuration(&self) -> &BucketConfiguration {
        &self.configuration
    }
}

impl<T> Drop for LockFreeBucket<T> {
    fn drop(&mut self) {
        // Exclusive access here; the only outstanding state is the
        // published one, so reclaim it directly.
        let state = mem::replace(&mut self.state, Atomic::null());
        drop(unsafe { state.into_owned() });
    }
}

impl<T: TimeSource> fmt::Debug for LockFreeBucket<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockFreeBucket")
            .field("state", &self.create_snapshot())
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
    use crate::LockFreeBucket;
    use crate::ManualTimeSource;

    fn frozen_bucket(capacity: u64) -> LockFreeBucket<Arc<ManualTimeSource>> {
        let configuration = BucketConfiguration::new(vec![Bandwidth::greedy(
            NonZeroU64::new(capacity).unwrap(),
            NonZeroU64::new(1).unwrap(),
            Duration::from_secs(3600),
        )]);
        LockFreeBucket::with_time_source(configuration, Arc::new(ManualTimeSource::new()))
    }

    #[test]
    fn contended_consumes_are_exact() {
        let bucket = Arc::new(frozen_bucket(10_000));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let bucket = Arc::clone(&bucket);
            handles.push(thread::spawn(move || {
                let mut granted = 0u64;
                for _ in 0..1_000 {
                    if bucket.try_consume(1).unwrap() {
                        granted += 1;
                    }
                }
                granted
            }));
        }

        let granted: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        // Plenty of tokens for every request, so contention must not cost
        // a single grant, and the final balance must account for each one.
        assert_eq!(granted, 8_000);
        assert_eq!(bucket.available_tokens(), 2_000);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_tasks_never_overdraw() {
        let capacity = 100;
        let bucket = Arc::new(frozen_bucket(capacity));

        let mut handles = Vec::new();
        for _ in 0..capacity + 10 {
            let bucket = Arc::clone(&bucket);
            handles.push(tokio::spawn(async move { bucket.try_consume(1).unwrap() }));
        }

        let results = futures::future::join_all(handles).await;
        let granted = results.into_iter().filter(|r| matches!(r, Ok(true))).count();

        assert_eq!(granted as u64, capacity);
        assert_eq!(bucket.available_tokens(), 0);
    }

    #[test]
    fn mixed_writers_preserve_the_token_ledger() {
        let bucket = Arc::new(frozen_bucket(1_000));
        // Drain so adders and consumers race on a mostly-empty bucket.
        assert_eq!(bucket.consume_as_much_as_possible(u64::MAX), 1_000);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let bucket = Arc::clone(&bucket);
            handles.push(thread::spawn(move || {
                let mut consumed = 0u64;
                for _ in 0..500 {
                    consumed += bucket.consume_as_much_as_possible(1);
                }
                consumed
            }));
        }
        for _ in 0..2 {
            let bucket = Arc::clone(&bucket);
            handles.push(thread::spawn(move || {
                for _ in 0..500 {
                    bucket.add_tokens(1).unwrap();
                }
                0u64
            }));
        }

        let consumed: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        // 1000 tokens were added; consumers cannot take more than that,
        // and whatever they left behind is still in the bucket.
        assert_eq!(consumed + bucket.available_tokens(), 1_000);
    }

    #[test]
    fn snapshot_is_detached_from_the_live_bucket() {
        let bucket = frozen_bucket(10);
        let snapshot = bucket.create_snapshot();

        assert!(bucket.try_consume(4).unwrap());
        assert_eq!(snapshot.available_tokens(), 10);
        assert_eq!(bucket.create_snapshot().available_tokens(), 6);
    }
}

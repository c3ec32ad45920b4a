use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use quanta::Clock;
use quanta::Instant;

/// A monotonically non-decreasing nanosecond clock consumed by the buckets.
///
/// Readings are nanoseconds since the source's own epoch. Correctness only
/// requires that readings never go backward; a source that does step back
/// (say, one backed by a wall clock) degrades to no-op refills rather than
/// corrupting state.
pub trait TimeSource: Debug + Send + Sync {
    /// Nanoseconds elapsed since this source's epoch.
    fn current_time_nanos(&self) -> u64;
}

impl<T: TimeSource + ?Sized> TimeSource for Arc<T> {
    fn current_time_nanos(&self) -> u64 {
        (**self).current_time_nanos()
    }
}

/// The production time source: high-performance monotonic time measured
/// from the instant the source was created.
#[derive(Debug, Clone)]
pub struct MonotonicTimeSource {
    clock: Clock,
    anchor: Instant,
}

impl MonotonicTimeSource {
    pub fn new() -> Self {
        let clock = Clock::new();
        let anchor = clock.now();
        Self { clock, anchor }
    }
}

impl Default for MonotonicTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicTimeSource {
    #[inline]
    fn current_time_nanos(&self) -> u64 {
        self.clock.now().duration_since(self.anchor).as_nanos() as u64
    }
}

/// A hand-advanced time source for tests and simulations. Starts at zero.
///
/// Share one with a bucket through an `Arc` and drive it from the test:
///
/// ```rust
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// use burst_bucket::ManualTimeSource;
/// use burst_bucket::TimeSource;
///
/// let clock = Arc::new(ManualTimeSource::new());
/// clock.advance(Duration::from_millis(500));
/// assert_eq!(clock.current_time_nanos(), 500_000_000);
/// ```
#[derive(Debug, Default)]
pub struct ManualTimeSource {
    nanos: AtomicU64,
}

impl ManualTimeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves time forward by `duration`.
    pub fn advance(&self, duration: Duration) {
        self.nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::SeqCst);
    }

    /// Jumps to an absolute reading. Jumping backward violates the
    /// monotonicity contract; buckets shrug it off as "no time passed".
    pub fn set(&self, nanos: u64) {
        self.nanos.store(nanos, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn current_time_nanos(&self) -> u64 {
        self.nanos.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_source_never_goes_backward() {
        let source = MonotonicTimeSource::new();
        let mut previous = source.current_time_nanos();
        for _ in 0..1000 {
            let next = source.current_time_nanos();
            assert!(next >= previous);
            previous = next;
        }
    }

    #[test]
    fn manual_source_advances_and_jumps() {
        let source = ManualTimeSource::new();
        assert_eq!(source.current_time_nanos(), 0);

        source.advance(Duration::from_secs(1));
        source.advance(Duration::from_millis(500));
        assert_eq!(source.current_time_nanos(), 1_500_000_000);

        source.set(42);
        assert_eq!(source.current_time_nanos(), 42);
    }
}

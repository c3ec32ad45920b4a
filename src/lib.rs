//! # burst-bucket
//!
//! `burst-bucket` is an in-process rate limiter built around a token bucket
//! composed from one or more *bandwidths*, each pairing a capacity with its
//! own refill schedule. A consume attempt succeeds only if every bandwidth
//! can admit it, so the tightest rule always governs.
//!
//! ## Core Philosophy
//!
//! The refill-inspect-mutate sequence must appear indivisible to other
//! threads. This crate ships two buckets that honor that contract with
//! different disciplines:
//!
//! * [`SynchronizedBucket`] serializes the critical section behind a mutex.
//! * [`LockFreeBucket`] copies the state, speculatively modifies the copy,
//!   and installs it with a compare-and-swap, retrying on interference.
//!   No operation ever blocks.
//!
//! Both present the same [`Bucket`] operation set and produce identical
//! single-threaded traces, so callers can pick a discipline per workload
//! without changing semantics.
//!
//! ## Key Concepts
//!
//! * **Lazy refill**: tokens are recalculated at the moment of the request
//!   from elapsed time; no background thread or timer is needed.
//! * **Reservation**: [`Bucket::reserve_and_calculate_time_to_sleep`] may
//!   drive a bandwidth's balance negative and tells the caller how long to
//!   sleep while refill heals the deficit.
//! * **Injectable time**: buckets read a [`TimeSource`]; production code
//!   uses the monotonic clock, tests advance time by hand.
//!
//! ## Example
//!
//! ```rust
//! use std::num::NonZeroU64;
//! use std::time::Duration;
//!
//! use burst_bucket::Bandwidth;
//! use burst_bucket::Bucket;
//! use burst_bucket::BucketConfiguration;
//! use burst_bucket::LockFreeBucket;
//!
//! // 100 tokens, refilled continuously at 100 per minute.
//! let bandwidth = Bandwidth::greedy(
//!     NonZeroU64::new(100).unwrap(),
//!     NonZeroU64::new(100).unwrap(),
//!     Duration::from_secs(60),
//! );
//! let bucket = LockFreeBucket::new(BucketConfiguration::new(vec![bandwidth]));
//!
//! if bucket.try_consume(1).unwrap() {
//!     // Request allowed
//! }
//! ```

use std::fmt::Debug;
use std::future::Ready;
use std::future::ready;

#[cfg(feature = "tracing")]
macro_rules! trace {
    ($($arg:tt)*) => {
        tracing::trace!($($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! trace {
    ($($arg:tt)*) => {};
}

mod bandwidth;
mod configuration;
mod error;
mod lock_free;
mod state;
mod synchronized;
mod time;


pub use bandwidth::Bandwidth;
pub use bandwidth::RefillMode;
pub use configuration::BucketConfiguration;
pub use error::BucketError;
pub use lock_free::LockFreeBucket;
pub use state::BandwidthState;
pub use state::BucketState;
pub use synchronized::SynchronizedBucket;
pub use time::ManualTimeSource;
pub use time::MonotonicTimeSource;
pub use time::TimeSource;

/// Outcome of a consume attempt that also reports the bucket balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumptionProbe {
    /// The tokens were consumed; `remaining_tokens` is the balance left
    /// immediately afterwards.
    Consumed {
        /// Tokens still available after the consume.
        remaining_tokens: u64,
    },
    /// The tokens were not consumed and the bucket was left untouched.
    Rejected {
        /// Tokens available at the moment of rejection.
        remaining_tokens: u64,
        /// How long refill needs, with no further consumption, before the
        /// requested amount would fit.
        nanos_to_wait_for_refill: u64,
    },
}

impl ConsumptionProbe {
    /// Returns `true` iff the tokens were consumed.
    pub fn is_consumed(&self) -> bool {
        matches!(self, ConsumptionProbe::Consumed { .. })
    }

    /// The bucket balance observed by the attempt.
    pub fn remaining_tokens(&self) -> u64 {
        match *self {
            ConsumptionProbe::Consumed { remaining_tokens } => remaining_tokens,
            ConsumptionProbe::Rejected {
                remaining_tokens, ..
            } => remaining_tokens,
        }
    }

    /// Wait estimate carried by a rejection; zero on a successful consume.
    pub fn nanos_to_wait_for_refill(&self) -> u64 {
        match *self {
            ConsumptionProbe::Consumed { .. } => 0,
            ConsumptionProbe::Rejected {
                nanos_to_wait_for_refill,
                ..
            } => nanos_to_wait_for_refill,
        }
    }
}

/// The shared operation set of both bucket variants.
///
/// Implementations must be `Send` and `Sync` so a bucket can be shared
/// across threads via `Arc`; every operation takes `&self`.
///
/// All mutating operations and [`Bucket::available_tokens`] first refill
/// every bandwidth to the current time, then inspect and possibly mutate,
/// as one indivisible step. Validation happens before that step, so a
/// returned error never leaves the bucket partially modified.
pub trait Bucket: Debug {
    /// Consumes exactly `tokens` if every bandwidth admits it.
    ///
    /// Returns `Ok(false)`, without mutating, when fewer tokens are
    /// available.
    ///
    /// # Errors
    ///
    /// [`BucketError::ZeroTokens`] if `tokens` is zero,
    /// [`BucketError::TokensMoreThanCapacity`] if `tokens` exceeds the
    /// smallest configured capacity.
    fn try_consume(&self, tokens: u64) -> Result<bool, BucketError>;

    /// Like [`Bucket::try_consume`], but reports the balance, and on
    /// rejection an estimate of how long refill needs before the request
    /// would fit.
    ///
    /// # Errors
    ///
    /// Same as [`Bucket::try_consume`].
    fn try_consume_and_return_remaining(
        &self,
        tokens: u64,
    ) -> Result<ConsumptionProbe, BucketError>;

    /// Consumes as many tokens as are available, up to `limit`, and returns
    /// the consumed amount. A `limit` of zero (or an empty bucket) consumes
    /// nothing. `u64::MAX` drains the bucket.
    fn consume_as_much_as_possible(&self, limit: u64) -> u64;

    /// Reserves `tokens` even when they are not yet available, returning
    /// the nanoseconds the caller should sleep while refill covers the
    /// deficit. The reservation may drive bandwidth balances negative.
    ///
    /// When `wait_limit_nanos` is positive and the required delay exceeds
    /// it, nothing is reserved and `u64::MAX` is returned as a rejection
    /// sentinel. A `wait_limit_nanos` of `0` or `u64::MAX` accepts any
    /// delay.
    ///
    /// # Errors
    ///
    /// Same as [`Bucket::try_consume`].
    fn reserve_and_calculate_time_to_sleep(
        &self,
        tokens: u64,
        wait_limit_nanos: u64,
    ) -> Result<u64, BucketError>;

    /// Adds `tokens` to every bandwidth, clamping each at its capacity.
    ///
    /// A bandwidth in deficit heals toward (at most) full; a bandwidth
    /// already at capacity is unchanged, so this is not a pure counter.
    ///
    /// # Errors
    ///
    /// [`BucketError::ZeroTokens`] if `tokens` is zero.
    fn add_tokens(&self, tokens: u64) -> Result<(), BucketError>;

    /// Tokens currently available across all bandwidths, after refilling
    /// to the present. A reservation deficit is reported as zero.
    fn available_tokens(&self) -> u64;

    /// A deep copy of the current state, consistent with some point
    /// between invocation and return.
    fn create_snapshot(&self) -> BucketState;

    /// The bandwidth set this bucket was built from.
    fn configuration(&self) -> &BucketConfiguration;
}

/// Asynchronous lifting of the [`Bucket`] operations.
///
/// Local buckets complete synchronously, so these adapters execute the
/// operation on the caller and hand back an already-completed future. The
/// blanket impl covers every bucket; no variant-specific wrappers exist.
pub trait AsyncBucket: Bucket {
    /// Async lifting of [`Bucket::try_consume`].
    fn try_consume_async(&self, tokens: u64) -> Ready<Result<bool, BucketError>> {
        ready(self.try_consume(tokens))
    }

    /// Async lifting of [`Bucket::try_consume_and_return_remaining`].
    fn try_consume_and_return_remaining_async(
        &self,
        tokens: u64,
    ) -> Ready<Result<ConsumptionProbe, BucketError>> {
        ready(self.try_consume_and_return_remaining(tokens))
    }

    /// Async lifting of [`Bucket::consume_as_much_as_possible`].
    fn consume_as_much_as_possible_async(&self, limit: u64) -> Ready<u64> {
        ready(self.consume_as_much_as_possible(limit))
    }

    /// Async lifting of [`Bucket::reserve_and_calculate_time_to_sleep`].
    fn reserve_and_calculate_time_to_sleep_async(
        &self,
        tokens: u64,
        wait_limit_nanos: u64,
    ) -> Ready<Result<u64, BucketError>> {
        ready(self.reserve_and_calculate_time_to_sleep(tokens, wait_limit_nanos))
    }

    /// Async lifting of [`Bucket::add_tokens`].
    fn add_tokens_async(&self, tokens: u64) -> Ready<Result<(), BucketError>> {
        ready(self.add_tokens(tokens))
    }
}

impl<B: Bucket + ?Sized> AsyncBucket for B {}

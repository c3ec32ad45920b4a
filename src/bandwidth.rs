use std::num::NonZeroU64;
use std::time::Duration;

use crate::state::BandwidthState;

/// How a bandwidth turns elapsed time into tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefillMode {
    /// Tokens accrue continuously at `refill_tokens / refill_period`.
    Greedy,
    /// Tokens arrive in lump sums of `refill_tokens` at period boundaries.
    Intervally,
}

/// An immutable rate-limit rule pairing a capacity with a refill schedule.
///
/// A bucket built from several bandwidths admits a consume only when every
/// bandwidth does, so composing e.g. a per-second rule with a per-hour rule
/// enforces both at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bandwidth {
    capacity: u64,
    initial_tokens: u64,
    refill_tokens: u64,
    refill_period_nanos: u64,
    refill_mode: RefillMode,
}

impl Bandwidth {
    /// A bandwidth that refills continuously: `refill_tokens` spread evenly
    /// over `refill_period`. Starts full.
    ///
    /// # Panics
    ///
    /// Panics if `refill_period` is zero.
    pub fn greedy(
        capacity: NonZeroU64,
        refill_tokens: NonZeroU64,
        refill_period: Duration,
    ) -> Self {
        Self::build(capacity, refill_tokens, refill_period, RefillMode::Greedy)
    }

    /// A bandwidth that refills in whole lumps of `refill_tokens` once per
    /// `refill_period`. Starts full.
    ///
    /// # Panics
    ///
    /// Panics if `refill_period` is zero.
    pub fn intervally(
        capacity: NonZeroU64,
        refill_tokens: NonZeroU64,
        refill_period: Duration,
    ) -> Self {
        Self::build(capacity, refill_tokens, refill_period, RefillMode::Intervally)
    }

    fn build(
        capacity: NonZeroU64,
        refill_tokens: NonZeroU64,
        refill_period: Duration,
        refill_mode: RefillMode,
    ) -> Self {
        assert!(
            !refill_period.is_zero(),
            "refill period must be positive"
        );
        // Balances are signed so reservations can drive them negative;
        // everything token-valued must therefore fit in an i64.
        let capacity = capacity.get().min(i64::MAX as u64);
        let refill_tokens = refill_tokens.get().min(capacity);
        Self {
            capacity,
            initial_tokens: capacity,
            refill_tokens,
            refill_period_nanos: refill_period.as_nanos().min(u128::from(u64::MAX)) as u64,
            refill_mode,
        }
    }

    /// Overrides the starting balance, clamped to the capacity.
    pub fn with_initial_tokens(mut self, tokens: u64) -> Self {
        self.initial_tokens = tokens.min(self.capacity);
        self
    }

    /// Maximum tokens this bandwidth can hold.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Tokens present when a bucket is constructed.
    pub fn initial_tokens(&self) -> u64 {
        self.initial_tokens
    }

    /// Tokens credited per refill period.
    pub fn refill_tokens(&self) -> u64 {
        self.refill_tokens
    }

    /// Length of the refill period in nanoseconds.
    pub fn refill_period_nanos(&self) -> u64 {
        self.refill_period_nanos
    }

    /// Whether refill is continuous or interval-based.
    pub fn refill_mode(&self) -> RefillMode {
        self.refill_mode
    }

    /// Credits the tokens earned since the last refill boundary and moves
    /// the boundary forward. Time standing still or stepping backward is a
    /// no-op, which keeps `last_refill_nanos` monotone under out-of-order
    /// samples from concurrent callers.
    pub(crate) fn refill(&self, state: &mut BandwidthState, current_time_nanos: u64) {
        let last = state.last_refill_nanos;
        if current_time_nanos <= last {
            return;
        }
        let elapsed = current_time_nanos - last;
        match self.refill_mode {
            RefillMode::Greedy => {
                let minted = u128::from(elapsed) * u128::from(self.refill_tokens)
                    / u128::from(self.refill_period_nanos);
                if minted == 0 {
                    return;
                }
                // Advance only by the nanos it took to mint whole tokens;
                // the fractional remainder stays banked in elapsed time.
                let spent = minted * u128::from(self.refill_period_nanos)
                    / u128::from(self.refill_tokens);
                state.last_refill_nanos = last + spent as u64;
                self.credit(state, minted);
            }
            RefillMode::Intervally => {
                let periods = elapsed / self.refill_period_nanos;
                if periods == 0 {
                    return;
                }
                state.last_refill_nanos = last + periods * self.refill_period_nanos;
                self.credit(state, u128::from(periods) * u128::from(self.refill_tokens));
            }
        }
    }

    fn credit(&self, state: &mut BandwidthState, minted: u128) {
        // Widened arithmetic upstream means `minted` can be enormous;
        // anything past capacity clamps rather than erroring. A deficit
        // from a reservation heals first, the surplus clamps.
        let minted = minted.min(u128::from(u64::MAX)) as i128;
        let raised = i128::from(state.tokens).saturating_add(minted);
        state.tokens = raised.min(i128::from(self.capacity)) as i64;
    }

    /// Smallest duration after which `tokens` would be available on this
    /// bandwidth, assuming no further consumption. Zero when they already
    /// are. Call after refilling to `current_time_nanos`.
    pub(crate) fn nanos_until_available(
        &self,
        state: &BandwidthState,
        tokens: u64,
        current_time_nanos: u64,
    ) -> u64 {
        let deficit = i128::from(tokens) - i128::from(state.tokens);
        if deficit <= 0 {
            return 0;
        }
        let deficit = deficit as u128;
        match self.refill_mode {
            RefillMode::Greedy => deficit
                .saturating_mul(u128::from(self.refill_period_nanos))
                .div_ceil(u128::from(self.refill_tokens))
                .min(u128::from(u64::MAX)) as u64,
            RefillMode::Intervally => {
                let periods = deficit.div_ceil(u128::from(self.refill_tokens));
                let full_wait = periods.saturating_mul(u128::from(self.refill_period_nanos));
                // The part of the current period already behind us counts
                // toward the next lump.
                let into_period =
                    u128::from(current_time_nanos.saturating_sub(state.last_refill_nanos));
                full_wait
                    .saturating_sub(into_period)
                    .min(u128::from(u64::MAX)) as u64
            }
        }
    }
}

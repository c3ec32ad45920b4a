use crate::bandwidth::Bandwidth;
use crate::configuration::BucketConfiguration;

/// Runtime counters for a single bandwidth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandwidthState {
    pub(crate) tokens: i64,
    pub(crate) last_refill_nanos: u64,
}

impl BandwidthState {
    /// Current balance; negative while a reservation deficit is healing.
    pub fn current_tokens(&self) -> i64 {
        self.tokens
    }

    /// Timestamp of the last refill boundary, in the bucket's time source
    /// epoch. Never decreases.
    pub fn last_refill_nanos(&self) -> u64 {
        self.last_refill_nanos
    }
}

/// The mutable runtime state of a bucket: one slot per configured
/// bandwidth, in configuration order.
///
/// This is a plain data container. `Clone` is the deep copy the lock-free
/// bucket publishes through compare-and-swap, O(bandwidth count) with a
/// single allocation; snapshots returned to callers are the same copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketState {
    bandwidths: Vec<BandwidthState>,
}

impl BucketState {
    pub(crate) fn initial(
        configuration: &BucketConfiguration,
        current_time_nanos: u64,
    ) -> Self {
        let bandwidths = configuration
            .bandwidths()
            .iter()
            .map(|bandwidth| BandwidthState {
                tokens: bandwidth.initial_tokens() as i64,
                last_refill_nanos: current_time_nanos,
            })
            .collect();
        Self { bandwidths }
    }

    /// Replaces this state's contents with `other`'s, reusing the existing
    /// allocation. Both states come from the same configuration, so the
    /// lengths always match.
    pub(crate) fn copy_state_from(&mut self, other: &BucketState) {
        self.bandwidths.copy_from_slice(&other.bandwidths);
    }

    pub(crate) fn refill_all(&mut self, bandwidths: &[Bandwidth], current_time_nanos: u64) {
        for (bandwidth, state) in bandwidths.iter().zip(&mut self.bandwidths) {
            bandwidth.refill(state, current_time_nanos);
        }
    }

    /// Smallest balance across bandwidths, floored at zero. A deficit is
    /// reported as nothing available, not as a negative amount.
    pub fn available_tokens(&self) -> u64 {
        self.bandwidths
            .iter()
            .map(|state| state.tokens)
            .min()
            .unwrap_or(0)
            .max(0) as u64
    }

    /// Subtracts `tokens` from every bandwidth. Refill happens before this,
    /// never inside it; the balance may go negative, which is exactly what
    /// reservations rely on.
    pub(crate) fn consume(&mut self, tokens: u64) {
        // Reservations are not bounded by capacity, so the amount may
        // exceed what an i64 holds; together with the saturation below it
        // bottoms out instead of wrapping.
        let tokens = tokens.min(i64::MAX as u64) as i64;
        for state in &mut self.bandwidths {
            state.tokens = state.tokens.saturating_sub(tokens);
        }
    }

    /// Adds `tokens` to every bandwidth, clamping each at its capacity.
    pub(crate) fn add_tokens(&mut self, bandwidths: &[Bandwidth], tokens: u64) {
        for (bandwidth, state) in bandwidths.iter().zip(&mut self.bandwidths) {
            let raised = i128::from(state.tokens).saturating_add(i128::from(tokens));
            state.tokens = raised.min(i128::from(bandwidth.capacity())) as i64;
        }
    }

    /// Smallest duration after which every bandwidth would hold `tokens`,
    /// assuming no further consumption: the worst single-bandwidth wait.
    pub(crate) fn nanos_until_consumable(
        &self,
        bandwidths: &[Bandwidth],
        tokens: u64,
        current_time_nanos: u64,
    ) -> u64 {
        let mut worst = 0;
        for (bandwidth, state) in bandwidths.iter().zip(&self.bandwidths) {
            worst = worst.max(bandwidth.nanos_until_available(
                state,
                tokens,
                current_time_nanos,
            ));
        }
        worst
    }

    /// Per-bandwidth runtime values, in configuration order. External
    /// collaborators persist and reconstruct snapshots through this.
    pub fn bandwidth_states(&self) -> &[BandwidthState] {
        &self.bandwidths
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU64;
    use std::time::Duration;

    use super::*;

    fn nz(value: u64) -> NonZeroU64 {
        NonZeroU64::new(value).unwrap()
    }

    fn two_lane_config() -> BucketConfiguration {
        BucketConfiguration::new(vec![
            Bandwidth::greedy(nz(100), nz(100), Duration::from_secs(1)),
            Bandwidth::greedy(nz(10), nz(1), Duration::from_secs(1)),
        ])
    }

    #[test]
    fn initial_state_starts_at_configured_tokens() {
        let configuration = BucketConfiguration::new(vec![
            Bandwidth::greedy(nz(10), nz(10), Duration::from_secs(1)).with_initial_tokens(3),
        ]);
        let state = BucketState::initial(&configuration, 42);

        assert_eq!(state.bandwidth_states()[0].current_tokens(), 3);
        assert_eq!(state.bandwidth_states()[0].last_refill_nanos(), 42);
    }

    #[test]
    fn available_is_minimum_across_bandwidths() {
        let configuration = two_lane_config();
        let mut state = BucketState::initial(&configuration, 0);
        assert_eq!(state.available_tokens(), 10);

        state.consume(10);
        assert_eq!(state.available_tokens(), 0);
        assert_eq!(state.bandwidth_states()[0].current_tokens(), 90);
    }

    #[test]
    fn deficit_reports_zero_available() {
        let configuration = two_lane_config();
        let mut state = BucketState::initial(&configuration, 0);
        state.consume(15);
        assert_eq!(state.bandwidth_states()[1].current_tokens(), -5);
        assert_eq!(state.available_tokens(), 0);
    }

    #[test]
    fn add_tokens_heals_deficit_and_clamps_at_capacity() {
        let configuration = two_lane_config();
        let mut state = BucketState::initial(&configuration, 0);
        state.consume(15);

        state.add_tokens(configuration.bandwidths(), 30);
        // Wide lane: 85 + 30 clamps at 100; tight lane: -5 + 30 clamps at 10.
        assert_eq!(state.bandwidth_states()[0].current_tokens(), 100);
        assert_eq!(state.bandwidth_states()[1].current_tokens(), 10);
    }

    #[test]
    fn delay_is_governed_by_the_tightest_bandwidth() {
        let configuration = two_lane_config();
        let mut state = BucketState::initial(&configuration, 0);
        state.consume(10);

        // Wide lane refills 5 tokens in 50ms; the 1/s lane needs 5s.
        assert_eq!(
            state.nanos_until_consumable(configuration.bandwidths(), 5, 0),
            5_000_000_000
        );
    }

    #[test]
    fn copy_state_from_mirrors_contents() {
        let configuration = two_lane_config();
        let original = BucketState::initial(&configuration, 7);
        let mut scratch = BucketState::initial(&configuration, 0);
        scratch.consume(4);

        scratch.copy_state_from(&original);
        assert_eq!(scratch, original);
    }

    #[test]
    fn clone_is_a_deep_copy() {
        let configuration = two_lane_config();
        let mut state = BucketState::initial(&configuration, 0);
        let snapshot = state.clone();

        state.consume(10);
        assert_eq!(snapshot.available_tokens(), 10);
        assert_eq!(state.available_tokens(), 0);
    }
}

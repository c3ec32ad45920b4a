use crate::bandwidth::Bandwidth;
use crate::error::BucketError;

/// An ordered, non-empty set of bandwidths.
///
/// The set is a conjunction: a consume succeeds only if every bandwidth can
/// admit it, so the tightest rule governs the observable rate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketConfiguration {
    bandwidths: Vec<Bandwidth>,
}

impl BucketConfiguration {
    /// # Panics
    ///
    /// Panics if `bandwidths` is empty. Richer cross-bandwidth validation
    /// (redundant rules, refill-rate sanity) is a caller concern.
    pub fn new(bandwidths: Vec<Bandwidth>) -> Self {
        assert!(
            !bandwidths.is_empty(),
            "a bucket needs at least one bandwidth"
        );
        Self { bandwidths }
    }

    /// The configured bandwidths, in order.
    pub fn bandwidths(&self) -> &[Bandwidth] {
        &self.bandwidths
    }

    /// The tightest capacity across bandwidths. No fixed-amount consume can
    /// ever exceed it, whatever the refill schedule.
    pub fn min_capacity(&self) -> u64 {
        self.bandwidths
            .iter()
            .map(Bandwidth::capacity)
            .min()
            .unwrap_or(0)
    }

    /// Rejects amounts a plain consume could never satisfy. Runs before the
    /// atomic section, so a failed request leaves the bucket untouched.
    pub(crate) fn check_consumption(&self, tokens: u64) -> Result<(), BucketError> {
        crate::error::ensure_positive(tokens)?;
        let capacity = self.min_capacity();
        if tokens > capacity {
            return Err(BucketError::TokensMoreThanCapacity {
                requested: tokens,
                capacity,
            });
        }
        Ok(())
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

    #[test]
    fn min_capacity_picks_the_tightest_bandwidth() {
        let configuration = BucketConfiguration::new(vec![
            Bandwidth::greedy(nz(100), nz(100), Duration::from_secs(1)),
            Bandwidth::greedy(nz(10), nz(1), Duration::from_secs(1)),
        ]);
        assert_eq!(configuration.min_capacity(), 10);
    }

    #[test]
    fn consumption_checks_reject_zero_and_over_capacity() {
        let configuration = BucketConfiguration::new(vec![Bandwidth::greedy(
            nz(10),
            nz(10),
            Duration::from_secs(1),
        )]);

        assert_eq!(
            configuration.check_consumption(0),
            Err(BucketError::ZeroTokens)
        );
        assert_eq!(configuration.check_consumption(10), Ok(()));
        assert_eq!(
            configuration.check_consumption(11),
            Err(BucketError::TokensMoreThanCapacity {
                requested: 11,
                capacity: 10,
            })
        );
    }

    #[test]
    #[should_panic(expected = "at least one bandwidth")]
    fn empty_configuration_is_refused() {
        let _ = BucketConfiguration::new(Vec::new());
    }
}

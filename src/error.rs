/// Errors produced by bucket operations.
///
/// Every variant is raised before the atomic section is entered, so an
/// error never leaves a bucket partially modified.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BucketError {
    /// A consume, reserve, or add was asked for zero tokens.
    #[error("token amount must be positive")]
    ZeroTokens,

    /// A consume asked for more tokens than the tightest bandwidth can
    /// hold, so no amount of refilling would ever satisfy it.
    #[error("requested {requested} tokens but the smallest configured capacity is {capacity}")]
    TokensMoreThanCapacity {
        /// The amount the caller asked for.
        requested: u64,
        /// The smallest capacity across the configured bandwidths.
        capacity: u64,
    },
}

pub(crate) fn ensure_positive(tokens: u64) -> Result<(), BucketError> {
    if tokens == 0 {
        return Err(BucketError::ZeroTokens);
    }
    Ok(())
}

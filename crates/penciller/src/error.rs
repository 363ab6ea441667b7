use thiserror::Error;

/// Typed outcomes the penciller's API contract names.
///
/// Flow-control results are not here on purpose: a returned push and a
/// missing key are ordinary values (`PushResult::Returned`, `Ok(None)`),
/// not failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PencillerError {
    /// The key's codec declined to hash it; point lookups are impossible.
    #[error("key is not point-lookable (codec returned no hash)")]
    KeyNotHashable,

    /// A pushed batch's highest SQN fell behind the ledger SQN. The
    /// upstream journal is the only writer and must never reorder.
    #[error("pushed batch max sqn {pushed} regresses ledger sqn {ledger}")]
    SqnRegression {
        /// Highest SQN in the rejected batch.
        pushed: u64,
        /// Ledger SQN at the time of the push.
        ledger: u64,
    },

    /// Every persisted manifest generation failed its integrity check and
    /// strict recovery is configured.
    #[error("no readable manifest generation found")]
    CorruptManifest,

    /// A range-materialized snapshot was asked for a point lookup.
    #[error("snapshot was registered for range folds only")]
    RangeOnlySnapshot,
}

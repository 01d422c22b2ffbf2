//! Error taxonomy of an evaluation run.
//!
//! Configuration and execution errors abort the whole run. Data sparsity is never
//! an error: it travels as `None` predictions and metric-side exclusions.

use thiserror::Error;

/// Fatal conditions of an evaluation run.
#[derive(Debug, Error)]
pub enum EvalError {
    /// Missing, malformed or contradictory settings.
    #[error("configuration error: {0}")]
    Config(String),

    /// The time-based split needs the timestamp side channel of the store.
    #[error("time-based split requested but the rating store carries no timestamp information")]
    MissingTimestamps,

    /// Applying the min-ratings constraint left nothing to test on.
    #[error("condensing the data to {min_per_user} ratings per user / {min_per_item} per item removed all ratings")]
    EmptyCondensedData {
        min_per_user: usize,
        min_per_item: usize,
    },

    /// A recommender failed while preparing its model.
    #[error("initialization of {algorithm} (round {round}) failed: {reason}")]
    Init {
        algorithm: String,
        round: usize,
        reason: String,
    },

    /// An experiment unit failed while producing predictions or recommendations.
    #[error("experiment {algorithm} (round {round}) failed: {reason}")]
    Execution {
        algorithm: String,
        round: usize,
        reason: String,
    },

    /// A round produced a result whose identity is unknown to the aggregator.
    #[error("no aggregation slot for {algorithm}:{metric} (round {round})")]
    InconsistentResults {
        algorithm: String,
        metric: String,
        round: usize,
    },

    /// The run was stopped by a signal before all units completed.
    #[error("evaluation interrupted before all experiments completed")]
    Interrupted,

    /// The rating source could not be parsed.
    #[error("data error: {0}")]
    Data(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EvalError {
    /// True for errors that must be reported before any round starts.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            EvalError::Config(_) | EvalError::MissingTimestamps | EvalError::EmptyCondensedData { .. }
        )
    }
}

impl From<String> for EvalError {
    fn from(message: String) -> Self {
        EvalError::Config(message)
    }
}

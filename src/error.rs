use std::io;

use crate::model::FallbackReason;

/// Errors surfaced by the undercut core.
///
/// Fitting failures that a model can recover from through the parameter
/// fallback chain never leave the model as an error; see
/// [`crate::model::FallbackReason`] for how they are recorded instead.
#[derive(Debug, thiserror::Error)]
pub enum UndercutError {
    #[error("{model}: insufficient data, need at least {needed} valid points, got {got}")]
    DataInsufficiency {
        model: &'static str,
        needed: usize,
        got: usize,
    },

    #[error("data validation failed: {0}")]
    DataValidation(String),

    #[error("simulation input out of range: {0}")]
    SimulationInputOutOfRange(String),

    #[error("{model}: no local fit, stored parameters or default available ({})", join_reasons(.reasons))]
    FallbackExhausted {
        model: &'static str,
        /// Why each level of the chain was skipped, in order.
        reasons: Vec<FallbackReason>,
    },

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

fn join_reasons(reasons: &[FallbackReason]) -> String {
    reasons.iter().map(|r| r.to_string()).collect::<Vec<_>>().join("; ")
}

pub type Result<T> = std::result::Result<T, UndercutError>;

use thiserror::Error;

/// Errors raised while rewriting a training graph. All of these indicate a
/// broken schedule or a planner bug; no partial recovery is attempted.
#[derive(Error, Debug)]
pub enum RgError {
    #[error("Value '{name}' is not staged")]
    UnstagedValue { name: String },
    #[error("Phase violation: {reason}")]
    PhaseViolation { reason: String },
    #[error("Forward recompute without forgetting the output of node '{node}' (value '{value}')")]
    DuplicateStaging { node: String, value: String },
    #[error("No forward computation recorded for node '{node}'")]
    MissingLastForward { node: String },
    #[error("No gradient for parameter '{name}'")]
    MissingParamGradient { name: String },
    #[error("Initial gradient seeding requires exactly one graph output, found {count}")]
    SeedRequiresSingleOutput { count: usize },
    #[error("Cycle detected among nodes: {names}")]
    Cycle { names: String },
    #[error("Reference into another graph cannot be resolved here: {reason}")]
    GraphMismatch { reason: String },
    #[error("Invalid reference: {reason}")]
    InvalidRef { reason: String },
}

pub type RgResult<T> = Result<T, RgError>;

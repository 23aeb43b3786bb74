use thiserror::Error;

/// Top-level error taxonomy for the campaign engine.
///
/// Recovery semantics differ per variant: `Generation` failures for a
/// single donor are recorded on the session and never abort a batch;
/// `Dispatch` failures are retried up to a bound and then terminal on the
/// job only; `CapacityExceeded` leaves the session ready to send.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("{entity} '{id}' belongs to a different organization")]
    Forbidden { entity: &'static str, id: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Concurrent modification of flow '{0}': a turn is already in flight")]
    ConcurrentModification(String),

    #[error("No send slot available for organization '{organization_id}' within {horizon_days} days")]
    CapacityExceeded {
        organization_id: String,
        horizon_days: u32,
    },

    #[error("Generation failed: {0}")]
    Generation(#[from] GenerationError),

    #[error("Dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

/// Errors from the external content-generation collaborator.
#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Generation timed out after {0}s")]
    Timeout(u64),

    #[error("Provider returned an unusable response: {0}")]
    InvalidResponse(String),
}

/// Errors from the mail transport collaborator.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Dispatch timed out after {0}s")]
    Timeout(u64),
}

pub type Result<T> = std::result::Result<T, EngineError>;

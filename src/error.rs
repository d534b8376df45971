use thiserror::Error;
use uuid::Uuid;

use crate::models::Instrument;

pub type Result<T> = std::result::Result<T, EngineError>;

/// A structural or numeric invariant that an incoming record violates.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("{instrument}: required field `{field}` is missing")]
    MissingField {
        instrument: Instrument,
        field: &'static str,
    },

    #[error("{instrument}: {field} {actual} exceeds {limit_field} {limit}")]
    Exceeds {
        instrument: Instrument,
        field: &'static str,
        actual: f64,
        limit_field: &'static str,
        limit: f64,
    },

    #[error("{instrument}: {field} {value} is outside [{min}, {max}]")]
    OutOfRange {
        instrument: Instrument,
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: Uuid },

    #[error("access denied: {actor} may not {action}")]
    AccessDenied { actor: String, action: String },

    #[error("account `{0}` is not linked to any coordinator or user record")]
    UnlinkedAccount(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: Uuid) -> Self {
        EngineError::NotFound { kind, id }
    }

    pub fn denied(actor: &str, action: impl Into<String>) -> Self {
        EngineError::AccessDenied {
            actor: actor.to_string(),
            action: action.into(),
        }
    }
}

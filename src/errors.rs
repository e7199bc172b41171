//! Typed error hierarchy for the marketplace.
//!
//! `MarketError` is raised by the persistence and workflow layers and
//! travels up through `anyhow::Error`. The HTTP layer downcasts it back to
//! pick a status code (see `market::api::ApiError`).

use thiserror::Error;

/// Errors from the marketplace domain.
#[derive(Debug, Error)]
pub enum MarketError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Cannot move {entity} from '{from}' to '{to}'")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("Provider {provider_id} already applied to request {request_id}")]
    DuplicateApplication { request_id: i64, provider_id: i64 },

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Invalid commission schedule: {0}")]
    InvalidSchedule(String),

    #[error("Database lock poisoned")]
    LockPoisoned,
}

impl MarketError {
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        Self::NotFound { entity, id }
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

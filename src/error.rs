//! Error taxonomy for the access-control core.
//!
//! `NotFound`, `InvalidState` and `Unauthorized` describe caller misuse and are
//! returned unchanged. `Upstream` wraps any store, cache or protocol failure.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("upstream failure: {0:#}")]
    Upstream(#[from] anyhow::Error),
}

impl AccessError {
    pub fn session_not_found(id: impl ToString) -> Self {
        AccessError::NotFound {
            entity: "session",
            id: id.to_string(),
        }
    }

    pub fn impression_not_found(id: impl ToString) -> Self {
        AccessError::NotFound {
            entity: "impression",
            id: id.to_string(),
        }
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        AccessError::InvalidState(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        AccessError::Unauthorized(msg.into())
    }

    /// Stable machine-readable code, used by the HTTP adapter.
    pub fn code(&self) -> &'static str {
        match self {
            AccessError::NotFound { .. } => "not_found",
            AccessError::InvalidState(_) => "invalid_state",
            AccessError::Unauthorized(_) => "unauthorized",
            AccessError::Upstream(_) => "upstream_error",
        }
    }
}

pub type AccessResult<T> = Result<T, AccessError>;

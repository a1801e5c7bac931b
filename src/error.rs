use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("invalid {kind} id: {value:?}")]
    InvalidId { kind: &'static str, value: String },

    #[error("unknown {kind}: {value:?}")]
    InvalidValue { kind: &'static str, value: String },

    #[error("student {0} not found")]
    StudentNotFound(Uuid),

    #[error("{what} read timed out after {after:?}")]
    Timeout { what: &'static str, after: Duration },

    #[error("stored values do not match scope {0}")]
    ScopeMismatch(&'static str),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("malformed stored document: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl StatsError {
    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            StatsError::InvalidId { .. } => "INVALID_ID",
            StatsError::InvalidValue { .. } => "INVALID_VALUE",
            StatsError::StudentNotFound(_) => "NOT_FOUND",
            StatsError::Timeout { .. } => "TIMEOUT",
            StatsError::ScopeMismatch(_) => "SCOPE_MISMATCH",
            StatsError::Config(_) => "CONFIG",
            StatsError::Decode(_) => "DECODE_ERROR",
            StatsError::Database(_) | StatsError::Migrate(_) => "DATABASE_ERROR",
        }
    }
}

/// Parse an entity id before any read touches the store.
pub fn parse_id(kind: &'static str, value: &str) -> Result<Uuid, StatsError> {
    Uuid::parse_str(value.trim()).map_err(|_| StatsError::InvalidId {
        kind,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_id_rejects_garbage() {
        let err = parse_id("class", "not-a-uuid").unwrap_err();
        assert_eq!(err.code(), "INVALID_ID");
        assert!(err.to_string().contains("class"));
    }

    #[test]
    fn parse_id_trims_whitespace() {
        let id = Uuid::new_v4();
        assert_eq!(parse_id("student", &format!(" {id} ")).unwrap(), id);
    }
}

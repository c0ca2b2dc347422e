// 🚨 Error Taxonomy
// Every engine operation reports one of these. Validation and business-rule
// failures are detected before any ledger write.

use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// Malformed or out-of-range input. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// State machine misuse (wrong state, or wrong role for the current gate)
    #[error("invalid state transition: cannot {action} from {from}")]
    InvalidStateTransition { from: String, action: String },

    #[error("insufficient balance for {owner}: available {available}, requested {requested}")]
    InsufficientBalance {
        owner: String,
        available: Decimal,
        requested: Decimal,
    },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("permission denied: {role} may not {action}")]
    PermissionDenied { role: String, action: String },

    /// Lock or serialization failure. Safe to retry the whole operation once.
    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// Fatal setup problem (e.g. no current pay period). Never defaulted.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("storage error: {0}")]
    Storage(rusqlite::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LedgerError>;

impl LedgerError {
    pub fn validation(message: impl Into<String>) -> Self {
        LedgerError::Validation(message.into())
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        LedgerError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn transition(from: impl Into<String>, action: impl Into<String>) -> Self {
        LedgerError::InvalidStateTransition {
            from: from.into(),
            action: action.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::ConcurrencyConflict(_))
    }

    /// Short machine-readable code, used by the API layer
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::Validation(_) => "validation_error",
            LedgerError::InvalidStateTransition { .. } => "invalid_state_transition",
            LedgerError::InsufficientBalance { .. } => "insufficient_balance",
            LedgerError::NotFound { .. } => "not_found",
            LedgerError::PermissionDenied { .. } => "permission_denied",
            LedgerError::ConcurrencyConflict(_) => "concurrency_conflict",
            LedgerError::Configuration(_) => "configuration_error",
            LedgerError::Storage(_) => "storage_error",
            LedgerError::Csv(_) => "csv_error",
            LedgerError::Io(_) => "io_error",
            LedgerError::Json(_) => "json_error",
        }
    }
}

impl From<rusqlite::Error> for LedgerError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::DatabaseBusy
                    || code.code == rusqlite::ErrorCode::DatabaseLocked =>
            {
                LedgerError::ConcurrencyConflict(err.to_string())
            }
            _ => LedgerError::Storage(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_maps_to_concurrency_conflict() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".to_string()),
        );
        let mapped: LedgerError = err.into();
        assert!(mapped.is_retryable());
        assert_eq!(mapped.code(), "concurrency_conflict");
    }

    #[test]
    fn test_other_sqlite_errors_are_storage() {
        let mapped: LedgerError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(!mapped.is_retryable());
        assert_eq!(mapped.code(), "storage_error");
    }

    #[test]
    fn test_display_messages() {
        let err = LedgerError::transition("approved", "approve");
        assert_eq!(
            err.to_string(),
            "invalid state transition: cannot approve from approved"
        );

        let err = LedgerError::not_found("practice", "P-1");
        assert_eq!(err.to_string(), "practice not found: P-1");
    }
}

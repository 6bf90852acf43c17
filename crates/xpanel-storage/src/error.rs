//! Storage error types for the panel storage abstraction layer.

use std::fmt;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The requested row was not found.
    #[error("Record not found: {table}/{id}")]
    NotFound {
        /// Table the lookup ran against.
        table: String,
        /// Key of the missing row.
        id: String,
    },

    /// Attempted to insert a row that collides with an existing one.
    #[error("Record already exists: {table}/{id}")]
    AlreadyExists {
        /// Table the insert ran against.
        table: String,
        /// Key of the conflicting row.
        id: String,
    },

    /// Stored data could not be decoded.
    #[error("Invalid stored data: {message}")]
    InvalidData {
        /// Description of what was wrong.
        message: String,
    },

    /// The backend failed (I/O, SQL, lock poisoning).
    #[error("Backend error: {message}")]
    Backend {
        /// Description of the backend failure.
        message: String,
    },
}

impl StorageError {
    /// Creates a new `NotFound` error.
    #[must_use]
    pub fn not_found(table: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            table: table.into(),
            id: id.to_string(),
        }
    }

    /// Creates a new `AlreadyExists` error.
    #[must_use]
    pub fn already_exists(table: impl Into<String>, id: impl ToString) -> Self {
        Self::AlreadyExists {
            table: table.into(),
            id: id.to_string(),
        }
    }

    /// Creates a new `InvalidData` error.
    #[must_use]
    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    /// Creates a new `Backend` error.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Returns `true` if this is a not found error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns `true` if this is an already exists error.
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    /// Returns the error category for logging/monitoring purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::AlreadyExists { .. } => ErrorCategory::Conflict,
            Self::InvalidData { .. } => ErrorCategory::Validation,
            Self::Backend { .. } => ErrorCategory::Infrastructure,
        }
    }
}

impl From<xpanel_core::CoreError> for StorageError {
    fn from(err: xpanel_core::CoreError) -> Self {
        Self::invalid_data(err.to_string())
    }
}

/// Categories of storage errors for logging and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Row not found.
    NotFound,
    /// Key collision.
    Conflict,
    /// Stored data failed to decode.
    Validation,
    /// Backend/connection error.
    Infrastructure,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not_found"),
            Self::Conflict => write!(f, "conflict"),
            Self::Validation => write!(f, "validation"),
            Self::Infrastructure => write!(f, "infrastructure"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StorageError::not_found("client_traffics", 12);
        assert_eq!(err.to_string(), "Record not found: client_traffics/12");

        let err = StorageError::already_exists("client_traffics", "user_0001");
        assert_eq!(err.to_string(), "Record already exists: client_traffics/user_0001");
    }

    #[test]
    fn test_error_category() {
        assert_eq!(
            StorageError::not_found("inbounds", 1).category(),
            ErrorCategory::NotFound
        );
        assert_eq!(
            StorageError::already_exists("inbounds", 1).category(),
            ErrorCategory::Conflict
        );
        assert_eq!(
            StorageError::invalid_data("bad blob").category(),
            ErrorCategory::Validation
        );
        assert_eq!(
            StorageError::backend("disk full").category().to_string(),
            "infrastructure"
        );
        assert!(StorageError::not_found("inbounds", 1).is_not_found());
    }
}

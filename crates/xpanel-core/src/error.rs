use thiserror::Error;

/// Core error types for xpanel domain operations
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid inbound settings: {message}")]
    InvalidSettings { message: String },

    #[error("Invalid client email: {0:?}")]
    InvalidEmail(String),
}

impl CoreError {
    /// Create a new InvalidSettings error
    pub fn invalid_settings(message: impl Into<String>) -> Self {
        Self::InvalidSettings {
            message: message.into(),
        }
    }

    /// Create a new InvalidEmail error
    pub fn invalid_email(email: impl Into<String>) -> Self {
        Self::InvalidEmail(email.into())
    }

    /// Check if this error was caused by caller-supplied data
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidEmail(_))
    }

    /// Get error category for logging/monitoring
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::JsonError(_) => ErrorCategory::Serialization,
            Self::InvalidSettings { .. } => ErrorCategory::Data,
            Self::InvalidEmail(_) => ErrorCategory::Validation,
        }
    }
}

/// Error categories for monitoring and classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    Serialization,
    Data,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::Serialization => write!(f, "serialization"),
            Self::Data => write!(f, "data"),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

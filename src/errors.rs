use crate::validation::ValidationErrors;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum AppError {
    #[error("NOT_AUTHENTICATED: no active session")]
    NotAuthenticated,
    #[error("INVALID_CREDENTIALS: invalid login credentials")]
    InvalidCredentials,
    #[error("VALIDATION_FAILED: {0}")]
    Validation(ValidationErrors),
    #[error("{0}")]
    Backend(String),
    #[error("DUPLICATE_PROFILE: {0}")]
    DuplicateProfile(String),
    #[error("TIMEOUT: {0}")]
    Timeout(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl AppError {
    /// Message shown to the user in the dismissible error banner.
    pub fn display_message(&self) -> String {
        match self {
            Self::Backend(message) => message.clone(),
            other => other.to_string(),
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Backend(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<ValidationErrors> for AppError {
    fn from(value: ValidationErrors) -> Self {
        Self::Validation(value)
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::AppError;

    #[test]
    fn backend_errors_surface_verbatim() {
        let error = AppError::Backend("network down".to_string());
        assert_eq!(error.display_message(), "network down");
        assert_eq!(error.to_string(), "network down");
    }

    #[test]
    fn coded_errors_keep_their_prefix() {
        assert!(AppError::NotAuthenticated.to_string().starts_with("NOT_AUTHENTICATED"));
        assert!(AppError::Timeout("get_profile".to_string())
            .display_message()
            .starts_with("TIMEOUT"));
    }
}

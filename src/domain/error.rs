use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("domain validation failed: {message}")]
    Validation { message: String },
}

impl DomainError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Message without the layer prefix, for field-level reporting.
    pub fn reason(&self) -> &str {
        match self {
            DomainError::Validation { message } => message,
        }
    }
}

use thiserror::Error;

/// Lens runtime error types.
///
/// Validation errors are raised before any resolver runs, so resolvers never
/// see malformed input. Resolver-thrown domain errors travel through
/// [`LensError::Resolver`] with whatever `code` and `data` they carry.
#[derive(Error, Debug)]
pub enum LensError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Transport error: {0}")]
    Transport(String),

    /// Domain error raised by a resolver, passed through to the caller.
    #[error("{message}")]
    Resolver {
        message: String,
        code: Option<String>,
        data: Option<serde_json::Value>,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LensError {
    /// Create a resolver-level domain error without a code.
    pub fn resolver(message: impl Into<String>) -> Self {
        Self::Resolver {
            message: message.into(),
            code: None,
            data: None,
        }
    }

    /// Create a resolver-level domain error with a code.
    pub fn resolver_with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self::Resolver {
            message: message.into(),
            code: Some(code.into()),
            data: None,
        }
    }

    /// Stable wire code for this error.
    pub fn code(&self) -> &str {
        match self {
            Self::Validation(_) => "VALIDATION",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Configuration(_) => "CONFIGURATION",
            Self::Transport(_) => "TRANSPORT",
            Self::Resolver { code, .. } => code.as_deref().unwrap_or("RESOLVER"),
            Self::Serialization(_) => "SERIALIZATION",
        }
    }
}

/// Result type for lens operations
pub type Result<T> = std::result::Result<T, LensError>;

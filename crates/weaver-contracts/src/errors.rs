use thiserror::Error;

/// Failure taxonomy surfaced to callers of the generation endpoints.
///
/// Adapters raise these values inside `anyhow::Error`; the boundary recovers
/// them with [`GenerationError::from_anyhow`]. Anything that is not already
/// classified becomes [`GenerationError::Internal`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    #[error("{provider} rejected the API key: {message}")]
    InvalidCredential { provider: String, message: String },

    #[error("{provider} rate limit exceeded: {message}")]
    RateLimited { provider: String, message: String },

    #[error("{provider} error ({status}): {body}")]
    Provider {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("{provider} returned no candidates")]
    EmptyResponse { provider: String },

    #[error("no image data found in {provider} response")]
    NoImageData { provider: String },

    #[error("unsupported engine type: {0}")]
    UnsupportedEngine(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("generation cancelled: {0}")]
    Cancelled(String),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidCredential,
    RateLimited,
    ProviderError,
    ProviderEmptyResponse,
    ProviderNoImageData,
    UnsupportedEngine,
    InvalidRequest,
    Cancelled,
    InternalError,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            Self::InvalidCredential => "INVALID_API_KEY",
            Self::RateLimited => "RATE_LIMITED",
            Self::ProviderError => "PROVIDER_ERROR",
            Self::ProviderEmptyResponse => "PROVIDER_EMPTY_RESPONSE",
            Self::ProviderNoImageData => "PROVIDER_NO_IMAGE_DATA",
            Self::UnsupportedEngine => "UNSUPPORTED_ENGINE",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::Cancelled => "CANCELLED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    pub fn http_status(self) -> u16 {
        match self {
            Self::InvalidCredential => 401,
            Self::RateLimited => 429,
            Self::UnsupportedEngine | Self::InvalidRequest => 400,
            _ => 500,
        }
    }
}

impl GenerationError {
    /// Classifies a non-success provider status. 401/403 and 429 get their
    /// own kinds; everything else keeps the raw body for diagnosis.
    pub fn from_status(provider: &str, status: u16, body: &str) -> Self {
        let provider = provider.to_string();
        match status {
            401 | 403 => Self::InvalidCredential {
                provider,
                message: format!("HTTP {status}: {body}"),
            },
            429 => Self::RateLimited {
                provider,
                message: body.to_string(),
            },
            _ => Self::Provider {
                provider,
                status,
                body: body.to_string(),
            },
        }
    }

    /// Recovers a taxonomy value from anywhere in the chain, otherwise wraps
    /// the flattened cause chain as an internal error.
    pub fn from_anyhow(err: anyhow::Error) -> Self {
        if let Some(found) = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<GenerationError>())
        {
            return found.clone();
        }
        Self::Internal(error_chain_text(&err))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidCredential { .. } => ErrorKind::InvalidCredential,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Provider { .. } => ErrorKind::ProviderError,
            Self::EmptyResponse { .. } => ErrorKind::ProviderEmptyResponse,
            Self::NoImageData { .. } => ErrorKind::ProviderNoImageData,
            Self::UnsupportedEngine(_) => ErrorKind::UnsupportedEngine,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Internal(_) => ErrorKind::InternalError,
        }
    }
}

fn error_chain_text(err: &anyhow::Error) -> String {
    let mut parts: Vec<String> = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts.last().map(|last| last == trimmed).unwrap_or(false) {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return err.to_string();
    }
    parts.join(" | caused by: ")
}

//! Upstream failure taxonomy.

/// Application error codes returned inside Last.fm JSON error payloads.
pub const CODE_NOT_FOUND: i64 = 6;
pub const CODE_TRANSIENT: i64 = 8;
pub const CODE_UNAUTHORIZED: i64 = 17;
pub const CODE_RATE_LIMITED: i64 = 29;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ApiError {
    #[error("network failure: {message}")]
    NetworkFailure { message: String },

    #[error("upstream returned a non-JSON response (HTTP {status})")]
    NonJsonResponse { status: u16 },

    #[error("transient server error {code}: {message}")]
    TransientServerError { code: i64, message: String },

    #[error("rate limited: {message}")]
    RateLimited { message: String },

    #[error("entity is private or unauthorized: {message}")]
    EntityUnauthorized { message: String },

    #[error("entity not found: {message}")]
    NotFound { message: String },

    #[error("api error {code}: {message}")]
    GenericApiError { code: i64, message: String },

    #[error("malformed payload: {message}")]
    MalformedPayload { message: String },
}

impl ApiError {
    pub fn network(msg: impl std::fmt::Display) -> Self {
        Self::NetworkFailure {
            message: msg.to_string(),
        }
    }

    pub fn malformed(msg: impl std::fmt::Display) -> Self {
        Self::MalformedPayload {
            message: msg.to_string(),
        }
    }

    /// Map an application error code from a decoded error payload.
    pub fn from_code(code: i64, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            CODE_NOT_FOUND => Self::NotFound { message },
            CODE_TRANSIENT => Self::TransientServerError { code, message },
            CODE_UNAUTHORIZED => Self::EntityUnauthorized { message },
            CODE_RATE_LIMITED => Self::RateLimited { message },
            _ => Self::GenericApiError { code, message },
        }
    }

    /// Whether the client may repeat the identical call on its own.
    /// Rate limits are deliberately excluded: the caller must back off.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NetworkFailure { .. }
                | Self::NonJsonResponse { .. }
                | Self::TransientServerError { .. }
        )
    }

    /// Failures after which the entity is not refreshed again until a full resync.
    pub fn is_entity_terminal(&self) -> bool {
        matches!(self, Self::EntityUnauthorized { .. })
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_mapping() {
        assert!(matches!(ApiError::from_code(6, "x"), ApiError::NotFound { .. }));
        assert!(matches!(
            ApiError::from_code(8, "x"),
            ApiError::TransientServerError { code: 8, .. }
        ));
        assert!(ApiError::from_code(17, "private").is_entity_terminal());
        assert!(ApiError::from_code(29, "slow down").is_rate_limited());
        assert!(matches!(
            ApiError::from_code(10, "bad key"),
            ApiError::GenericApiError { code: 10, .. }
        ));
    }

    #[test]
    fn test_retry_classification() {
        assert!(ApiError::from_code(8, "").is_retryable());
        assert!(ApiError::NonJsonResponse { status: 502 }.is_retryable());
        assert!(!ApiError::from_code(29, "").is_retryable());
        assert!(!ApiError::from_code(17, "").is_retryable());
        assert!(!ApiError::from_code(10, "").is_retryable());
    }
}

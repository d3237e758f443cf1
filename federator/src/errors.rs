use http::StatusCode;
use thiserror::Error;

/// Result type alias for federator operations
pub type Result<T, E = FederatorError> = std::result::Result<T, E>;

/// Errors that can occur while processing a federation request
#[derive(Error, Debug)]
pub enum FederatorError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("failed to read request body: {0}")]
    RequestBody(String),

    #[error("stream epoch duration exceeds the configured maximum")]
    DurationCeiling,

    #[error("routing service unavailable: {0}")]
    RoutingUnavailable(String),

    #[error("routing request timed out")]
    RoutingTimeout,

    #[error("malformed routing response: {0}")]
    RoutingMalformed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl FederatorError {
    /// Client-facing status code for this error.
    ///
    /// Only routing failures and internal errors abort a request; the
    /// mapping mirrors that: client mistakes map to 4xx, routing to
    /// 502/504, everything else to 500.
    pub fn status(&self) -> StatusCode {
        match self {
            FederatorError::InvalidQuery(_) | FederatorError::RequestBody(_) => {
                StatusCode::BAD_REQUEST
            }
            FederatorError::BodyTooLarge { .. } | FederatorError::DurationCeiling => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            FederatorError::RoutingUnavailable(_) | FederatorError::RoutingMalformed(_) => {
                StatusCode::BAD_GATEWAY
            }
            FederatorError::RoutingTimeout => StatusCode::GATEWAY_TIMEOUT,
            FederatorError::Io(_) | FederatorError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

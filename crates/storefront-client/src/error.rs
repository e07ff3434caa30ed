use std::time::Duration;

use thiserror::Error;

/// An error that happens while issuing a request through the client.
///
/// This error is shared between all callers that were coalesced onto the same operation, which
/// is why it is [`Clone`] and only carries owned strings instead of the underlying error types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// The request could not be sent or the response could not be read, for instance because of
    /// a refused connection or a failed DNS lookup.
    #[error("network error: {0}")]
    Network(String),
    /// The request did not complete within the configured timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// The server responded with a non-success status code.
    ///
    /// The attached string contains the response body.
    #[error("server responded with {status}: {body}")]
    Status { status: u16, body: String },
    /// There is no token to authenticate the request with.
    #[error("not authenticated")]
    NotAuthenticated,
    /// The token failed validation and could not be refreshed.
    ///
    /// This is terminal for the current session, the user has to log in again.
    #[error("authentication expired")]
    AuthenticationExpired,
    /// The response body could not be decoded into the requested type.
    #[error("failed to decode response: {0}")]
    Decode(String),
    /// The request could not be built, for instance because its path is not a valid URL.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// An unexpected error in the client itself.
    #[error("internal error")]
    InternalError,
}

impl ClientError {
    /// Whether the server rejected the credentials of the request.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Status { status: 401 | 403, .. })
    }

    /// A short tag describing the kind of error, used for metrics.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::Timeout(_) => "timeout",
            Self::Status { .. } => "status",
            Self::NotAuthenticated => "not-authenticated",
            Self::AuthenticationExpired => "auth-expired",
            Self::Decode(_) => "decode",
            Self::InvalidRequest(_) => "invalid-request",
            Self::InternalError => "internal",
        }
    }

    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

impl From<url::ParseError> for ClientError {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidRequest(err.to_string())
    }
}

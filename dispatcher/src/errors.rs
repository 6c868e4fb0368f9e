use http::StatusCode;
use thiserror::Error;

/// Result type alias for dispatcher operations
pub type Result<T, E = DispatchError> = std::result::Result<T, E>;

/// Failure of one relay cycle against one backend
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: u64 },

    #[error("invalid backend address {0}")]
    InvalidTarget(String),

    #[error("connecting to {target} failed: {reason}")]
    Connect { target: String, reason: String },

    #[error("{target} did not accept the request body: {reason}")]
    Expect { target: String, reason: String },

    #[error("{0} has insufficient storage")]
    InsufficientStorage(String),

    #[error("writing to {target} failed: {reason}")]
    Write { target: String, reason: String },

    #[error("{0} did not answer in time")]
    NodeTimeout(String),

    #[error("reading the response of {target} failed: {reason}")]
    ResponseRead { target: String, reason: String },

    #[error("timed out waiting for the client to send the request body")]
    ClientTimeout,

    #[error("reading the request body failed: {0}")]
    ClientBody(String),

    #[error("the request body was already sent to another backend")]
    BodyConsumed,

    #[error("no backend server to relay to")]
    NoCandidates,
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            RelayError::InvalidTarget(_)
            | RelayError::Connect { .. }
            | RelayError::Expect { .. }
            | RelayError::InsufficientStorage(_)
            | RelayError::BodyConsumed
            | RelayError::NoCandidates => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::Write { .. }
            | RelayError::NodeTimeout(_)
            | RelayError::ResponseRead { .. } => StatusCode::GATEWAY_TIMEOUT,
            RelayError::ClientTimeout => StatusCode::REQUEST_TIMEOUT,
            RelayError::ClientBody(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether another replica of the same cluster could succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            RelayError::PayloadTooLarge { .. }
                | RelayError::ClientTimeout
                | RelayError::ClientBody(_)
                | RelayError::BodyConsumed
                | RelayError::NoCandidates
        )
    }

    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::PayloadTooLarge { .. } => "payload_too_large",
            RelayError::InvalidTarget(_) => "invalid_target",
            RelayError::Connect { .. } => "connect",
            RelayError::Expect { .. } => "expect",
            RelayError::InsufficientStorage(_) => "insufficient_storage",
            RelayError::Write { .. } => "write",
            RelayError::NodeTimeout(_) => "node_timeout",
            RelayError::ResponseRead { .. } => "response_read",
            RelayError::ClientTimeout => "client_timeout",
            RelayError::ClientBody(_) => "client_body",
            RelayError::BodyConsumed => "body_consumed",
            RelayError::NoCandidates => "no_candidates",
        }
    }
}

/// Errors surfaced to the client by the dispatcher
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Relay(#[from] RelayError),

    /// Malformed COPY request. The message becomes the response body.
    #[error("{0}")]
    CopyRequest(String),

    #[error("no route for this request")]
    NotFound,

    #[error("a merged token is required")]
    Unauthorized,

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("merging backend responses failed: {0}")]
    Merge(#[from] crate::merger::MergeError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    pub fn status(&self) -> StatusCode {
        match self {
            DispatchError::Relay(e) => e.status(),
            DispatchError::CopyRequest(_) => StatusCode::PRECONDITION_FAILED,
            DispatchError::NotFound => StatusCode::NOT_FOUND,
            DispatchError::Unauthorized => StatusCode::UNAUTHORIZED,
            DispatchError::BadRequest(_) => StatusCode::BAD_REQUEST,
            DispatchError::Merge(_) => StatusCode::BAD_GATEWAY,
            DispatchError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

use serde_xml_rs::Error;
use tonic::Status;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FerrumStreamError {
    #[error("config error: {0}")]
    ConfigError(String),
    #[error("transport error: {0}")]
    TransportError(String),
    #[error("invalid datum: {0}")]
    InvalidDatum(String),
    /// A user `create`, `accumulate`, `finalize` or `map` hook returned an error or panicked.
    #[error("user callback failed: {0}")]
    CallbackFailure(String),
    /// The caller went away or cancelled the stream.
    #[error("stream aborted: {0}")]
    StreamAbort(String),
    #[error("invocation closed: {0}")]
    InvocationClosed(String),
    #[error("internal error: {0}")]
    InternalError(String),
}

impl FerrumStreamError {
    /// Aborts are caller-initiated, there is nobody left to report them to.
    pub fn is_abort(&self) -> bool {
        matches!(self, FerrumStreamError::StreamAbort(_))
    }
}

impl From<Error> for FerrumStreamError {
    fn from(value: Error) -> Self {
        FerrumStreamError::ConfigError(value.to_string())
    }
}

impl From<tonic::transport::Error> for FerrumStreamError {
    fn from(value: tonic::transport::Error) -> Self {
        FerrumStreamError::TransportError(value.to_string())
    }
}

impl From<std::io::Error> for FerrumStreamError {
    fn from(value: std::io::Error) -> Self {
        FerrumStreamError::TransportError(value.to_string())
    }
}

impl From<FerrumStreamError> for Status {
    fn from(error: FerrumStreamError) -> Self {
        match error {
            FerrumStreamError::ConfigError(msg) => Status::internal(msg),
            FerrumStreamError::TransportError(msg) => Status::unavailable(msg),
            FerrumStreamError::InvalidDatum(msg) => Status::invalid_argument(msg),
            FerrumStreamError::CallbackFailure(msg) => {
                Status::internal(format!("user callback failed: {}", msg))
            }
            FerrumStreamError::StreamAbort(msg) => Status::cancelled(msg),
            FerrumStreamError::InvocationClosed(msg) => Status::failed_precondition(msg),
            FerrumStreamError::InternalError(msg) => Status::internal(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, FerrumStreamError>;

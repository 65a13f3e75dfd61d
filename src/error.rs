use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// The protocol layer that failed to open, in the order they are checked
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EndpointLayer {
    Connection,
    Session,
    Link,
}

impl Display for EndpointLayer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointLayer::Connection => write!(f, "connection"),
            EndpointLayer::Session => write!(f, "session"),
            EndpointLayer::Link => write!(f, "link"),
        }
    }
}

/// Errors that are reported to the application, either from a client operation or through a
///  callback.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum IotHubError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("not implemented: {0}")]
    NotImplemented(String),
    #[error("not allowed: {0}")]
    NotAllowed(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("resource limit exceeded: {0}")]
    ResourceLimitExceeded(String),
    #[error("authentication failed with status {status}: {description}")]
    AuthenticationFailed { status: i32, description: String },
    #[error("connection closed: {0}")]
    ConnectionClosed(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("the {0} was never opened by the service")]
    NotOpened(EndpointLayer),
    #[error("{0}")]
    Unknown(String),
}

impl IotHubError {
    pub fn connection_closed() -> IotHubError {
        IotHubError::ConnectionClosed("the link was closed before the message was acknowledged".to_string())
    }
}

/// Passed to the application's error processor when the connection fails while it is in use
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ErrorContext {
    pub error: IotHubError,
}

pub type ErrorProcessor = Arc<dyn Fn(ErrorContext) + Send + Sync>;

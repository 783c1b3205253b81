use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T, E = GatewayError> = std::result::Result<T, E>;

/// Request-scoped gateway failures. Fan-out contributor failures never
/// reach this type; they are logged and excluded at the merge site.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Failed to read request body: {0}")]
    RequestBodyError(String),

    #[error("No route for account: {0}")]
    NoRouteForAccount(String),

    #[error("No healthy backends")]
    NoHealthyBackends,

    #[error("Response serialization error: {0}")]
    ResponseSerializationError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

use hyper::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Invalid proxy path: {0}")]
    ClientInput(String),

    #[error("Forbidden target: {0}")]
    Forbidden(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Rewrite error: {0}")]
    Rewrite(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Tunnel error: {0}")]
    Tunnel(String),
}

impl RelayError {
    /// Status code surfaced to the caller for this failure.
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::ClientInput(_) => StatusCode::BAD_REQUEST,
            RelayError::Forbidden(_) => StatusCode::FORBIDDEN,
            RelayError::Upstream(_) | RelayError::Rewrite(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

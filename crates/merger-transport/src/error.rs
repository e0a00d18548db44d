use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("channel disconnected")]
    Disconnected,

    #[error("schema negotiation failed: {0}")]
    Negotiation(String),

    #[error("downstream rejected frame: {0}")]
    Rejected(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type TransportResult<T> = Result<T, TransportError>;

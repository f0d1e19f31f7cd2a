use thiserror::Error;

#[derive(Debug, Error)]
pub enum PhxLoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Malformed frame: {0}")]
    Decode(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection closed")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, PhxLoadError>;

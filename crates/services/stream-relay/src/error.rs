//! Crate-level error type

use crate::config::ConfigError;
use crate::destination::DestinationError;
use crate::process::ProcessError;
use crate::protocol::ProtocolError;
use crate::queue::QueueError;
use crate::registry::RegistryError;
use crate::session::SessionError;

/// Result alias using [`RelayError`]
pub type Result<T> = std::result::Result<T, RelayError>;

/// Any error the relay can surface
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Destination(#[from] DestinationError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Invalid encoder diagnostic pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

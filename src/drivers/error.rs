use thiserror::Error;

use crate::types::Listener;

#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error("instrument unreachable: {0}")]
    Connectivity(String),
    #[error("device version is {version}, only versions with major == {supported} are supported")]
    VersionMismatch {
        version: String,
        supported: &'static str,
    },
    #[error("{listener} stream error: {detail}")]
    Stream { listener: Listener, detail: String },
    #[error("{0}")]
    Config(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("stream closed by peer")]
    Closed,
    #[error("not connected")]
    NotConnected,
    #[error("invalid CSV: {0}")]
    Csv(String),
    #[error("failed to render plot: {0}")]
    Plot(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ConsoleError {
    /// Re-labels an RPC failure raised while the connection is being established.
    pub fn into_connectivity(self) -> Self {
        match self {
            ConsoleError::Transport(detail) => ConsoleError::Connectivity(detail),
            ConsoleError::Io(err) => ConsoleError::Connectivity(err.to_string()),
            ConsoleError::Closed => ConsoleError::Connectivity("connection closed".into()),
            other => other,
        }
    }
}

impl<E: std::error::Error + Send + Sync + 'static> From<plotters::drawing::DrawingAreaErrorKind<E>>
    for ConsoleError
{
    fn from(value: plotters::drawing::DrawingAreaErrorKind<E>) -> Self {
        ConsoleError::Plot(format!("{value:?}"))
    }
}

impl From<image::ImageError> for ConsoleError {
    fn from(value: image::ImageError) -> Self {
        ConsoleError::Plot(value.to_string())
    }
}

impl From<serde_json::Error> for ConsoleError {
    fn from(value: serde_json::Error) -> Self {
        ConsoleError::Transport(format!("malformed message: {value}"))
    }
}

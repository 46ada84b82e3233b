use std::time::Duration;
use thiserror::Error;

/// Errors from the rendering surface (headless browser over CDP).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BrowserError {
    #[error("Failed to reach the DevTools endpoint: {0}")]
    ConnectFailed(String),
    #[error("WebSocket session failed: {0}")]
    SocketFailed(String),
    #[error("Navigation to {url} failed: {detail}")]
    NavigationFailed { url: String, detail: String },
    #[error("Navigation timed out after {0:?}")]
    NavigationTimeout(Duration),
    #[error("Protocol error from browser: {0}")]
    Protocol(String),
    #[error("Browser session closed unexpectedly")]
    SessionClosed,
}

/// Errors from the external encoder process.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EncoderError {
    #[error("ffmpeg not found. Please install ffmpeg with RTMPS support.")]
    FfmpegNotFound,
    #[error("Failed to spawn encoder: {0}")]
    SpawnFailed(String),
    #[error("Encoder exited with code {code}: {detail}")]
    Exit { code: i32, detail: String },
    #[error(
        "Encoder crashed (segmentation fault). The ffmpeg build is likely \
         missing a required capability such as TLS/RTMPS support. {detail}"
    )]
    Crashed { detail: String },
    #[error("Encoder input pipe closed")]
    PipeBroken,
    #[error("Failed to write to encoder: {0}")]
    WriteFailed(String),
}

/// Top-level error type for stream operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StreamError {
    #[error(transparent)]
    Browser(#[from] BrowserError),
    #[error(transparent)]
    Encoder(#[from] EncoderError),
    #[error("A stream is already running")]
    AlreadyStreaming,
    #[error("No stream is running")]
    NotStreaming,
    #[error("Start was cancelled by a stop request")]
    StartCancelled,
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Session is shutting down")]
    ShuttingDown,
}

impl StreamError {
    /// True for errors the caller caused (conflict/bad input) rather than
    /// pipeline failures.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            StreamError::AlreadyStreaming
                | StreamError::NotStreaming
                | StreamError::StartCancelled
                | StreamError::InvalidRequest(_)
        )
    }
}

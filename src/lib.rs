//! pagecast: streams a rendered web page or direct media URL to an
//! RTMP/RTMPS ingest endpoint.
//!
//! The pipeline drives a headless browser over CDP for screencast frames,
//! paces them through a FIFO queue into an ffmpeg child's stdin with proper
//! backpressure, and supervises that child including crash classification.
//! A thin axum shell exposes start/stop/status.

pub mod activate;
pub mod api;
pub mod browser;
pub mod config;
pub mod encoder;
pub mod errors;
pub mod logging;
pub mod pipeline;
pub mod session;

pub use config::Config;
pub use errors::{BrowserError, EncoderError, StreamError};
pub use session::{SessionHandle, SourceRef, StreamCoordinator, StreamStatus};

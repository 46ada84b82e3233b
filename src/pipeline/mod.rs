//! Capture-to-publish pipeline: frame buffers, the FIFO capture queue and
//! the rate-limited emitter feeding the encoder's input pipe.

pub mod emitter;
pub mod frame;
pub mod queue;

pub use emitter::{run_emitter, EmitterEvent};
pub use frame::Frame;
pub use queue::FrameQueue;

use bytes::Bytes;
use std::time::Instant;

/// One rendered frame from the screencast feed.
///
/// Immutable byte buffer plus a monotonically increasing sequence number and
/// arrival timestamp. Consumed exactly once by the emitter, never retried.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Bytes,
    pub seq: u64,
    pub arrived_at: Instant,
}

impl Frame {
    pub fn new(data: Bytes, seq: u64) -> Self {
        Self {
            data,
            seq,
            arrived_at: Instant::now(),
        }
    }
}

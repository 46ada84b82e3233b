use std::collections::VecDeque;
use std::sync::Mutex;

use crate::config::QueuePolicy;
use crate::pipeline::frame::Frame;

/// FIFO queue decoupling frame arrival (browser cadence) from frame emission
/// (configured rate).
///
/// Pushed by the capture task, popped by the emitter task; the mutex only
/// serializes those two short operations. Order is preserved end-to-end and
/// nothing is ever dropped except by the `DropOldest` overflow policy.
pub struct FrameQueue {
    inner: Mutex<VecDeque<Frame>>,
    policy: QueuePolicy,
    dropped: Mutex<u64>,
}

impl FrameQueue {
    pub fn new(policy: QueuePolicy) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            policy,
            dropped: Mutex::new(0),
        }
    }

    /// Appends a frame. Under `DropOldest`, discards the oldest frame when
    /// the cap is reached and returns its sequence number.
    pub fn push(&self, frame: Frame) -> Option<u64> {
        let mut q = self.inner.lock().unwrap();
        let evicted = match self.policy {
            QueuePolicy::Unbounded => None,
            QueuePolicy::DropOldest(cap) if q.len() >= cap => q.pop_front().map(|f| f.seq),
            QueuePolicy::DropOldest(_) => None,
        };
        q.push_back(frame);
        if evicted.is_some() {
            *self.dropped.lock().unwrap() += 1;
        }
        evicted
    }

    /// Removes and returns the oldest frame, if any.
    pub fn pop(&self) -> Option<Frame> {
        self.inner.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total frames discarded by the overflow policy.
    pub fn dropped(&self) -> u64 {
        *self.dropped.lock().unwrap()
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }
}

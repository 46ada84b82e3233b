use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::errors::EncoderError;
use crate::pipeline::queue::FrameQueue;

/// Events reported by the emitter task to its owner.
#[derive(Debug)]
pub enum EmitterEvent {
    /// First frame was accepted by the encoder pipe.
    FirstFrameSent,
    /// Emitter terminated cleanly (stop flag observed or queue producer gone).
    Stopped,
    /// Write failed while the session still believed itself capturing.
    Failed { error: EncoderError },
}

/// Rate-limited frame emitter.
///
/// Ticks at `1000 / frame_rate` ms and forwards at most one frame per tick
/// from the queue into the encoder's input pipe. `write_all` suspends this
/// task while the pipe is full and resumes when it drains, so a stalled
/// encoder pauses emission instead of dropping data or spinning; missed
/// ticks are absorbed and normal cadence resumes after the stall.
///
/// The shared `capturing` flag is the only cancellation primitive and is
/// checked at every tick boundary. A broken pipe after the flag has been
/// cleared is an expected teardown signal and is swallowed.
pub async fn run_emitter<W>(
    mut sink: W,
    queue: Arc<FrameQueue>,
    frame_rate: u32,
    capturing: Arc<AtomicBool>,
    frames_sent: Arc<AtomicU64>,
    events: mpsc::UnboundedSender<EmitterEvent>,
) where
    W: AsyncWrite + Unpin,
{
    let period = Duration::from_millis(1000 / u64::from(frame_rate.max(1)));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut first_sent = false;

    loop {
        ticker.tick().await;

        if !capturing.load(Ordering::SeqCst) {
            tracing::debug!(target: "emitter", "stop flag observed, shutting down");
            break;
        }

        let Some(frame) = queue.pop() else {
            continue;
        };

        match sink.write_all(&frame.data).await {
            Ok(()) => {
                frames_sent.fetch_add(1, Ordering::SeqCst);
                if !first_sent {
                    first_sent = true;
                    tracing::info!(target: "emitter", seq = frame.seq, "first frame accepted by encoder");
                    let _ = events.send(EmitterEvent::FirstFrameSent);
                }
            }
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                if capturing.load(Ordering::SeqCst) {
                    tracing::error!(target: "emitter", seq = frame.seq, "encoder pipe closed while capturing");
                    let _ = events.send(EmitterEvent::Failed {
                        error: EncoderError::PipeBroken,
                    });
                } else {
                    tracing::debug!(target: "emitter", "pipe closed during teardown (expected)");
                }
                return;
            }
            Err(e) => {
                tracing::error!(target: "emitter", seq = frame.seq, "write failed: {e}");
                let _ = events.send(EmitterEvent::Failed {
                    error: EncoderError::WriteFailed(e.to_string()),
                });
                return;
            }
        }
    }

    // Closing the pipe lets the encoder flush its trailing data.
    let _ = sink.shutdown().await;
    let _ = events.send(EmitterEvent::Stopped);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueuePolicy;
    use crate::pipeline::frame::Frame;
    use bytes::Bytes;
    use tokio::io::AsyncReadExt;

    const FPS: u32 = 5; // 200ms period

    fn setup(
        policy: QueuePolicy,
    ) -> (
        Arc<FrameQueue>,
        Arc<AtomicBool>,
        Arc<AtomicU64>,
        mpsc::UnboundedReceiver<EmitterEvent>,
        mpsc::UnboundedSender<EmitterEvent>,
    ) {
        let queue = Arc::new(FrameQueue::new(policy));
        let capturing = Arc::new(AtomicBool::new(true));
        let sent = Arc::new(AtomicU64::new(0));
        let (tx, rx) = mpsc::unbounded_channel();
        (queue, capturing, sent, rx, tx)
    }

    fn frame(seq: u64, len: usize) -> Frame {
        Frame::new(Bytes::from(vec![seq as u8; len]), seq)
    }

    #[tokio::test(start_paused = true)]
    async fn emits_frames_in_fifo_order() {
        let (queue, capturing, sent, _rx, tx) = setup(QueuePolicy::Unbounded);
        let (sink, mut source) = tokio::io::duplex(1 << 20);

        for seq in 0..50 {
            queue.push(frame(seq, 1));
        }

        let handle = tokio::spawn(run_emitter(
            sink,
            queue.clone(),
            FPS,
            capturing.clone(),
            sent.clone(),
            tx,
        ));

        while sent.load(Ordering::SeqCst) < 50 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        capturing.store(false, Ordering::SeqCst);
        handle.await.unwrap();

        let mut buf = vec![0u8; 50];
        source.read_exact(&mut buf).await.unwrap();
        let expected: Vec<u8> = (0..50).collect();
        assert_eq!(buf, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn cadence_matches_configured_rate() {
        let (queue, capturing, sent, _rx, tx) = setup(QueuePolicy::Unbounded);
        let (sink, mut source) = tokio::io::duplex(1 << 20);

        for seq in 0..500 {
            queue.push(frame(seq, 1));
        }

        tokio::spawn(run_emitter(
            sink,
            queue.clone(),
            FPS,
            capturing.clone(),
            sent.clone(),
            tx,
        ));

        // First tick fires immediately, then one frame per 200ms.
        tokio::time::sleep(Duration::from_millis(200 * 100 + 10)).await;
        let n = sent.load(Ordering::SeqCst);
        assert!((100..=102).contains(&n), "sent {n} frames in 100 periods");

        capturing.store(false, Ordering::SeqCst);
        let mut sink_drain = vec![0u8; n as usize];
        source.read_exact(&mut sink_drain).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn backpressure_suspends_pops_until_drain() {
        let (queue, capturing, sent, _rx, tx) = setup(QueuePolicy::Unbounded);
        // Pipe holds exactly one 16-byte frame.
        let (sink, mut source) = tokio::io::duplex(16);

        for seq in 0..5 {
            queue.push(frame(seq, 16));
        }

        tokio::spawn(run_emitter(
            sink,
            queue.clone(),
            FPS,
            capturing.clone(),
            sent.clone(),
            tx,
        ));

        // Frame 0 fills the pipe; frame 1 is popped but its write is
        // suspended. No further pops happen while the pipe is full.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(sent.load(Ordering::SeqCst), 1);
        assert_eq!(queue.len(), 3);

        // Drain one frame; the suspended write completes and ticking resumes.
        let mut buf = [0u8; 16];
        source.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0u8; 16]);

        while sent.load(Ordering::SeqCst) < 3 {
            source.read_exact(&mut buf).await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        capturing.store(false, Ordering::SeqCst);
    }

    #[tokio::test(start_paused = true)]
    async fn broken_pipe_while_capturing_reports_failure() {
        let (queue, capturing, sent, mut rx, tx) = setup(QueuePolicy::Unbounded);
        let (sink, source) = tokio::io::duplex(64);
        drop(source);

        queue.push(frame(0, 8));

        let handle = tokio::spawn(run_emitter(
            sink,
            queue.clone(),
            FPS,
            capturing.clone(),
            sent.clone(),
            tx,
        ));
        handle.await.unwrap();

        match rx.recv().await {
            Some(EmitterEvent::Failed { error }) => {
                assert_eq!(error, EncoderError::PipeBroken)
            }
            other => panic!("expected Failed event, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn broken_pipe_during_teardown_is_silent() {
        let (queue, capturing, sent, mut rx, tx) = setup(QueuePolicy::Unbounded);
        let (sink, source) = tokio::io::duplex(64);
        drop(source);

        // Flag cleared first, but a frame is still queued: the tick boundary
        // check wins and the emitter stops without touching the pipe.
        capturing.store(false, Ordering::SeqCst);
        queue.push(frame(0, 8));

        tokio::spawn(run_emitter(sink, queue, FPS, capturing, sent, tx))
            .await
            .unwrap();

        assert!(matches!(rx.recv().await, Some(EmitterEvent::Stopped)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn first_frame_is_signalled_once() {
        let (queue, capturing, sent, mut rx, tx) = setup(QueuePolicy::Unbounded);
        let (sink, _source) = tokio::io::duplex(1 << 16);

        for seq in 0..3 {
            queue.push(frame(seq, 1));
        }

        let handle = tokio::spawn(run_emitter(
            sink,
            queue.clone(),
            FPS,
            capturing.clone(),
            sent.clone(),
            tx,
        ));

        while sent.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        capturing.store(false, Ordering::SeqCst);
        handle.await.unwrap();

        assert!(matches!(rx.recv().await, Some(EmitterEvent::FirstFrameSent)));
        assert!(matches!(rx.recv().await, Some(EmitterEvent::Stopped)));
        assert!(rx.try_recv().is_err());
    }
}

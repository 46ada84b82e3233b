//! Encoder process supervision.
//!
//! One ffmpeg child per session. The supervisor task owns the child, reports
//! its exit (classified) to the session coordinator and performs the
//! mandatory two-phase stop: SIGTERM, bounded grace, then SIGKILL. Skipping
//! the grace period risks corrupting the trailing data of the remote stream.

use std::collections::VecDeque;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};

use crate::config::ScaleTarget;
use crate::errors::EncoderError;

/// Grace period between SIGTERM and SIGKILL.
pub const STOP_GRACE: Duration = Duration::from_secs(1);

/// Lines of stderr kept for the failure report.
const STDERR_TAIL_LINES: usize = 40;

const VIDEO_BITRATE: &str = "2500k";
const VIDEO_BUFSIZE: &str = "5000k";
const AUDIO_BITRATE: &str = "128k";
const AUDIO_SAMPLE_RATE: &str = "44100";
const X264_PRESET: &str = "veryfast";

/// Argument profile for the rendered-page mode: JPEG frames on stdin at the
/// session frame rate, silent placeholder audio, constant x264/aac profile,
/// FLV out to the ingest endpoint.
pub fn page_stream_args(frame_rate: u32, scale: ScaleTarget, rtmp_url: &str) -> Vec<String> {
    let fps = frame_rate.to_string();
    [
        "-hide_banner",
        "-loglevel",
        "error",
        "-f",
        "image2pipe",
        "-framerate",
        &fps,
        "-i",
        "pipe:0",
        "-f",
        "lavfi",
        "-i",
        &format!("anullsrc=channel_layout=stereo:sample_rate={AUDIO_SAMPLE_RATE}"),
        "-c:v",
        "libx264",
        "-preset",
        X264_PRESET,
        "-tune",
        "zerolatency",
        "-pix_fmt",
        "yuv420p",
        "-vf",
        &scale.filter(),
        "-r",
        &fps,
        "-g",
        &(frame_rate * 2).to_string(),
        "-b:v",
        VIDEO_BITRATE,
        "-maxrate",
        VIDEO_BITRATE,
        "-bufsize",
        VIDEO_BUFSIZE,
        "-c:a",
        "aac",
        "-b:a",
        AUDIO_BITRATE,
        "-ar",
        AUDIO_SAMPLE_RATE,
        "-f",
        "flv",
        rtmp_url,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Argument profile for the direct-URL mode: ffmpeg pulls the source itself,
/// no stdin pipeline.
pub fn direct_url_args(source_url: &str, scale: ScaleTarget, rtmp_url: &str) -> Vec<String> {
    [
        "-hide_banner",
        "-loglevel",
        "error",
        "-re",
        "-i",
        source_url,
        "-c:v",
        "libx264",
        "-preset",
        X264_PRESET,
        "-tune",
        "zerolatency",
        "-pix_fmt",
        "yuv420p",
        "-vf",
        &scale.filter(),
        "-c:a",
        "aac",
        "-b:a",
        AUDIO_BITRATE,
        "-ar",
        AUDIO_SAMPLE_RATE,
        "-f",
        "flv",
        rtmp_url,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Checks that the encoder binary exists and answers `-version` cleanly.
pub async fn check_ffmpeg(bin: &str) -> Result<(), EncoderError> {
    let status = Command::new(bin)
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map_err(|_| EncoderError::FfmpegNotFound)?;
    if !status.success() {
        return Err(EncoderError::FfmpegNotFound);
    }
    Ok(())
}

/// A spawned encoder child plus its captured diagnostics.
pub struct EncoderProcess {
    child: Child,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    stdin: Option<ChildStdin>,
}

impl EncoderProcess {
    /// Spawns the encoder. `kill_on_drop` is the last line of defense; normal
    /// shutdown goes through [`supervise`]'s two-phase stop.
    pub fn spawn(bin: &str, args: &[String]) -> Result<Self, EncoderError> {
        tracing::info!(target: "encoder", "spawning {bin} {}", args.join(" "));

        let mut child = Command::new(bin)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EncoderError::SpawnFailed(e.to_string()))?;

        let stdin = child.stdin.take();

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        if let Some(stderr) = child.stderr.take() {
            let tail = stderr_tail.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    // Incidental log lines are not faults; keep them only
                    // for the failure report.
                    tracing::debug!(target: "encoder", "stderr: {line}");
                    let mut tail = tail.lock().unwrap();
                    if tail.len() >= STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            });
        }

        Ok(Self {
            child,
            stderr_tail,
            stdin,
        })
    }

    /// Hands the input pipe to the emitter. Rendered-page mode only.
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    /// Last captured stderr lines, newest last.
    pub fn stderr_tail(&self) -> String {
        let tail = self.stderr_tail.lock().unwrap();
        tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    fn pid(&self) -> Option<i32> {
        self.child.id().map(|pid| pid as i32)
    }

    /// Waits for the child to exit on its own and classifies the outcome.
    pub async fn wait_classified(&mut self) -> Result<(), EncoderError> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| EncoderError::SpawnFailed(e.to_string()))?;
        classify_exit(status, &self.stderr_tail())
    }

    /// Two-phase stop: graceful SIGTERM, bounded grace, then SIGKILL.
    pub async fn stop(&mut self) {
        // Drop our stdin half first so the encoder sees EOF and can flush.
        self.stdin.take();

        let Some(pid) = self.pid() else {
            return; // already exited
        };

        tracing::info!(target: "encoder", pid, "sending SIGTERM");
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }

        match tokio::time::timeout(STOP_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(target: "encoder", pid, "exited within grace period: {status}");
            }
            Ok(Err(e)) => {
                tracing::warn!(target: "encoder", pid, "wait failed after SIGTERM: {e}");
            }
            Err(_) => {
                tracing::warn!(target: "encoder", pid, "grace period elapsed, sending SIGKILL");
                let _ = self.child.kill().await;
            }
        }
    }
}

/// Maps a child exit status to the error taxonomy. A SIGSEGV death is a
/// distinct, more severe classification than a non-zero exit: it usually
/// means the ffmpeg build lacks a runtime capability (TLS/RTMPS support)
/// rather than a parameter or protocol error.
fn classify_exit(status: ExitStatus, stderr_tail: &str) -> Result<(), EncoderError> {
    if status.success() {
        return Ok(());
    }
    if let Some(signal) = status.signal() {
        if signal == libc::SIGSEGV {
            return Err(EncoderError::Crashed {
                detail: stderr_tail.to_string(),
            });
        }
        return Err(EncoderError::Exit {
            code: 128 + signal,
            detail: format!("terminated by signal {signal}; {stderr_tail}"),
        });
    }
    Err(EncoderError::Exit {
        code: status.code().unwrap_or(-1),
        detail: stderr_tail.to_string(),
    })
}

/// Commands accepted by the supervisor task.
#[derive(Debug)]
pub enum EncoderCommand {
    /// Perform the two-phase stop; reply when the process is gone.
    Stop { done: oneshot::Sender<()> },
}

/// Events reported by the supervisor task.
#[derive(Debug)]
pub enum EncoderEvent {
    /// The child exited on its own; Ok for a clean exit.
    Exited { result: Result<(), EncoderError> },
}

/// Owns the encoder child for its lifetime. Reports a self-initiated exit;
/// on a stop command runs the two-phase termination and replies once the
/// process is guaranteed gone, so `stop` never returns with the encoder
/// still running.
pub async fn supervise(
    mut process: EncoderProcess,
    mut commands: mpsc::Receiver<EncoderCommand>,
    events: mpsc::UnboundedSender<EncoderEvent>,
) {
    tokio::select! {
        result = process.wait_classified() => {
            match &result {
                Ok(()) => tracing::info!(target: "encoder", "exited cleanly"),
                Err(e) => tracing::error!(target: "encoder", "exited abnormally: {e}"),
            }
            let _ = events.send(EncoderEvent::Exited { result });
            // Keep answering stop commands after a self-exit so teardown
            // never hangs on a dead encoder.
            while let Some(EncoderCommand::Stop { done }) = commands.recv().await {
                let _ = done.send(());
            }
        }
        Some(EncoderCommand::Stop { done }) = commands.recv() => {
            process.stop().await;
            let _ = done.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str) -> EncoderProcess {
        let args = vec!["-c".to_string(), script.to_string()];
        EncoderProcess::spawn("sh", &args).expect("spawn sh")
    }

    #[tokio::test]
    async fn preflight_rejects_missing_and_failing_binaries() {
        assert!(check_ffmpeg("true").await.is_ok());
        // Spawns fine but exits non-zero on -version.
        assert!(matches!(
            check_ffmpeg("false").await,
            Err(EncoderError::FfmpegNotFound)
        ));
        assert!(matches!(
            check_ffmpeg("/nonexistent/ffmpeg").await,
            Err(EncoderError::FfmpegNotFound)
        ));
    }

    #[tokio::test]
    async fn clean_exit_classifies_ok() {
        let mut p = sh("exit 0");
        assert!(p.wait_classified().await.is_ok());
    }

    #[tokio::test]
    async fn nonzero_exit_classifies_as_exit_code() {
        let mut p = sh("echo oops >&2; exit 3");
        match p.wait_classified().await {
            Err(EncoderError::Exit { code, detail }) => {
                assert_eq!(code, 3);
                // stderr reader may still be draining; the code is the
                // contract, the detail is best-effort.
                let _ = detail;
            }
            other => panic!("expected Exit(3), got {other:?}"),
        }
    }

    #[tokio::test]
    async fn segfault_classifies_as_crash() {
        let mut p = sh("kill -SEGV $$");
        match p.wait_classified().await {
            Err(EncoderError::Crashed { .. }) => {}
            other => panic!("expected Crashed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sigterm_stops_cooperative_process_within_grace() {
        let mut p = sh("sleep 30");
        let start = Instant::now();
        p.stop().await;
        assert!(start.elapsed() < STOP_GRACE, "SIGTERM should not need the grace period");
    }

    #[tokio::test]
    async fn sigkill_follows_grace_for_stubborn_process() {
        let mut p = sh("trap '' TERM; sleep 30; true");
        // Give the shell a moment to install the trap.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let start = Instant::now();
        p.stop().await;
        let elapsed = start.elapsed();
        assert!(elapsed >= STOP_GRACE, "grace period must elapse before SIGKILL");
        assert!(elapsed < STOP_GRACE + Duration::from_secs(2));
    }

    #[tokio::test]
    async fn supervisor_reports_self_exit() {
        let p = sh("exit 7");
        let (_cmd_tx, cmd_rx) = mpsc::channel(1);
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        tokio::spawn(supervise(p, cmd_rx, event_tx));

        match event_rx.recv().await {
            Some(EncoderEvent::Exited {
                result: Err(EncoderError::Exit { code: 7, .. }),
            }) => {}
            other => panic!("expected Exited(7), got {other:?}"),
        }
    }

    #[tokio::test]
    async fn supervisor_stop_returns_with_process_gone() {
        let p = sh("sleep 30");
        let (cmd_tx, cmd_rx) = mpsc::channel(1);
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(supervise(p, cmd_rx, event_tx));

        let (done_tx, done_rx) = oneshot::channel();
        cmd_tx
            .send(EncoderCommand::Stop { done: done_tx })
            .await
            .unwrap();
        done_rx.await.unwrap();
        handle.await.unwrap();
    }

    #[test]
    fn page_args_carry_session_specifics_and_fixed_profile() {
        let args = page_stream_args(
            4,
            ScaleTarget {
                width: 1280,
                height: 720,
            },
            "rtmps://ingest.example/live/key",
        );
        let joined = args.join(" ");
        assert!(joined.contains("-f image2pipe"));
        assert!(joined.contains("-framerate 4"));
        assert!(joined.contains("scale=1280:720"));
        assert!(joined.contains("anullsrc"));
        assert!(joined.contains("-c:v libx264"));
        assert!(joined.ends_with("-f flv rtmps://ingest.example/live/key"));
    }

    #[test]
    fn direct_args_pull_source_without_stdin() {
        let args = direct_url_args(
            "https://cdn.example/clip.mp4",
            ScaleTarget {
                width: 854,
                height: 480,
            },
            "rtmp://ingest/live",
        );
        let joined = args.join(" ");
        assert!(joined.contains("-re -i https://cdn.example/clip.mp4"));
        assert!(!joined.contains("pipe:0"));
        assert!(joined.ends_with("-f flv rtmp://ingest/live"));
    }
}

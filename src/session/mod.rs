//! StreamCoordinator - single owner actor for the stream lifecycle.
//!
//! The coordinator owns every session resource (browser page, capture
//! queue, encoder handle) and processes commands and worker events through
//! the pure state machine in [`state`]. Workers (setup task, emitter,
//! screencast pump, encoder supervisor, timers) communicate with it only
//! over channels, so all pipeline state is mutated from one task and the
//! FIFO/backpressure invariants need no locks.
//!
//! Resources are created in the order surface -> activator -> queue ->
//! encoder and released in strict reverse order; the encoder handle is
//! always closed before the surface session, regardless of what triggered
//! the teardown.

pub mod state;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::activate::activate_playback;
use crate::browser::{Page, PageOps};
use crate::config::Config;
use crate::encoder::{
    check_ffmpeg, direct_url_args, page_stream_args, supervise, EncoderCommand, EncoderEvent,
    EncoderProcess,
};
use crate::errors::{EncoderError, StreamError};
use crate::pipeline::{run_emitter, EmitterEvent, FrameQueue};
use state::{transition, SideEffect, StreamEvent, StreamState};

pub const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(30);
/// Bounded wait for the first frame before capture proceeds anyway.
pub const FIRST_FRAME_WAIT: Duration = Duration::from_secs(10);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// What to stream: a media URL handed straight to the encoder, or a page
/// rendered and captured frame by frame.
#[derive(Debug, Clone)]
pub enum SourceRef {
    DirectUrl(String),
    RenderedPage { url: String, selectors: String },
}

/// Status projection served by the control surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatus {
    pub active: bool,
    pub state: String,
    pub error: Option<String>,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub uptime_seconds: f64,
    pub activation: Option<String>,
}

/// Commands sent from the control surface to the coordinator.
#[derive(Debug)]
pub enum Command {
    Start {
        source: SourceRef,
        reply: oneshot::Sender<Result<(), StreamError>>,
    },
    Stop {
        reply: oneshot::Sender<Result<(), StreamError>>,
    },
    Status {
        reply: oneshot::Sender<StreamStatus>,
    },
}

/// Live handles for the current session, owned exclusively by the
/// coordinator. `page`/`queue` are absent in direct-URL mode.
struct SessionResources {
    page: Option<Page>,
    queue: Option<Arc<FrameQueue>>,
    encoder_cmds: mpsc::Sender<EncoderCommand>,
    activation: Option<String>,
}

/// Events sent from worker tasks to the coordinator. Tagged with the session
/// generation so events from a superseded session are discarded.
enum WorkerEvent {
    SetupComplete {
        generation: u64,
        resources: SessionResources,
    },
    SetupFailed {
        generation: u64,
        error: StreamError,
    },
    Emitter {
        generation: u64,
        event: EmitterEvent,
    },
    Encoder {
        generation: u64,
        event: EncoderEvent,
    },
    FirstFrameTimeout {
        generation: u64,
    },
}

impl WorkerEvent {
    fn generation(&self) -> u64 {
        match self {
            WorkerEvent::SetupComplete { generation, .. }
            | WorkerEvent::SetupFailed { generation, .. }
            | WorkerEvent::Emitter { generation, .. }
            | WorkerEvent::Encoder { generation, .. }
            | WorkerEvent::FirstFrameTimeout { generation } => *generation,
        }
    }
}

pub struct StreamCoordinator {
    config: Config,
    state: StreamState,
    /// Bumped on every start and every teardown; stale worker events carry
    /// an older value and are dropped (stale resources get disposed).
    generation: u64,
    capturing: Arc<AtomicBool>,
    frames_sent: Arc<AtomicU64>,
    resources: Option<SessionResources>,
    pending_start: Option<oneshot::Sender<Result<(), StreamError>>>,
    pending_source: Option<SourceRef>,
    command_rx: mpsc::Receiver<Command>,
    event_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl StreamCoordinator {
    pub fn new(config: Config) -> (Self, SessionHandle) {
        let (command_tx, command_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let coordinator = Self {
            config,
            state: StreamState::Idle,
            generation: 0,
            capturing: Arc::new(AtomicBool::new(false)),
            frames_sent: Arc::new(AtomicU64::new(0)),
            resources: None,
            pending_start: None,
            pending_source: None,
            command_rx,
            event_rx,
            event_tx,
        };

        (coordinator, SessionHandle { command_tx })
    }

    /// Main event loop. Run as a tokio task.
    pub async fn run(mut self) {
        tracing::info!(target: "session", "coordinator event loop started");

        loop {
            tokio::select! {
                maybe_cmd = self.command_rx.recv() => {
                    let Some(cmd) = maybe_cmd else { break };
                    self.handle_command(cmd).await;
                }
                Some(event) = self.event_rx.recv() => {
                    self.handle_worker_event(event).await;
                }
            }
        }

        // Control surface gone: wind down whatever is still running.
        if self.state.is_busy() {
            self.teardown().await;
        }
        tracing::info!(target: "session", "coordinator event loop finished");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start { source, reply } => self.handle_start(source, reply).await,
            Command::Stop { reply } => self.handle_stop(reply).await,
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    async fn handle_start(
        &mut self,
        source: SourceRef,
        reply: oneshot::Sender<Result<(), StreamError>>,
    ) {
        if self.state.is_busy() {
            let _ = reply.send(Err(StreamError::AlreadyStreaming));
            return;
        }
        if let Err(e) = validate_source(&source) {
            let _ = reply.send(Err(e));
            return;
        }

        tracing::info!(target: "session", ?source, "start accepted");
        self.pending_start = Some(reply);
        self.pending_source = Some(source);
        self.apply(StreamEvent::StartRequested).await;
    }

    async fn handle_stop(&mut self, reply: oneshot::Sender<Result<(), StreamError>>) {
        if !self.state.is_stoppable() {
            let _ = reply.send(Err(StreamError::NotStreaming));
            return;
        }

        tracing::info!(target: "session", "stop accepted");
        self.apply(StreamEvent::StopRequested).await;
        // Teardown has fully completed by here; no encoder process survives
        // a returned stop.
        let _ = reply.send(Ok(()));
    }

    async fn handle_worker_event(&mut self, event: WorkerEvent) {
        if event.generation() != self.generation {
            if let WorkerEvent::SetupComplete { resources, .. } = event {
                // A cancelled start finished setting up after its session was
                // superseded; release what it built.
                tracing::warn!(target: "session", "disposing resources from superseded setup");
                tokio::spawn(dispose(resources));
            }
            return;
        }

        match event {
            WorkerEvent::SetupComplete { resources, .. } => {
                let direct = resources.page.is_none();
                if let Some(outcome) = &resources.activation {
                    tracing::info!(target: "session", activation = %outcome, "playback activation outcome");
                }
                self.resources = Some(resources);
                if let Some(reply) = self.pending_start.take() {
                    let _ = reply.send(Ok(()));
                }
                if direct {
                    self.apply(StreamEvent::PipelineReady).await;
                } else {
                    self.spawn_first_frame_timer();
                }
            }
            WorkerEvent::SetupFailed { error, .. } => {
                tracing::error!(target: "session", "setup failed: {error}");
                if let Some(reply) = self.pending_start.take() {
                    let _ = reply.send(Err(error.clone()));
                }
                self.apply(StreamEvent::SetupFailed {
                    error: error.to_string(),
                })
                .await;
            }
            WorkerEvent::Emitter { event, .. } => match event {
                EmitterEvent::FirstFrameSent => {
                    self.apply(StreamEvent::FirstFrameSent).await;
                }
                EmitterEvent::Stopped => {}
                EmitterEvent::Failed { error } => {
                    self.apply(StreamEvent::RuntimeFailed {
                        error: StreamError::from(error).to_string(),
                    })
                    .await;
                }
            },
            WorkerEvent::Encoder { event, .. } => match event {
                EncoderEvent::Exited { result: Ok(()) } => {
                    tracing::info!(target: "session", "encoder finished cleanly");
                    self.apply(StreamEvent::EncoderFinished).await;
                }
                EncoderEvent::Exited { result: Err(error) } => {
                    self.apply(StreamEvent::RuntimeFailed {
                        error: StreamError::from(error).to_string(),
                    })
                    .await;
                }
            },
            WorkerEvent::FirstFrameTimeout { .. } => {
                if matches!(self.state, StreamState::Starting { .. }) {
                    tracing::warn!(
                        target: "session",
                        "no frame within {FIRST_FRAME_WAIT:?}, proceeding to capture anyway"
                    );
                }
                self.apply(StreamEvent::FirstFrameWaitElapsed).await;
            }
        }
    }

    /// Runs the transition function and executes its effects. Teardown
    /// completion feeds the follow-up event without async recursion.
    async fn apply(&mut self, event: StreamEvent) {
        let mut next = Some(event);
        while let Some(event) = next.take() {
            let (new_state, effects) = transition(self.state.clone(), event);
            if new_state != self.state {
                tracing::debug!(target: "session", from = self.state.name(), to = new_state.name(), "state transition");
            }
            self.state = new_state;

            for effect in effects {
                match effect {
                    SideEffect::BeginStartup => self.begin_startup(),
                    SideEffect::SignalStop => self.capturing.store(false, Ordering::SeqCst),
                    SideEffect::Teardown => {
                        self.teardown().await;
                        if matches!(self.state, StreamState::Stopping { .. }) {
                            next = Some(StreamEvent::TeardownComplete);
                        }
                    }
                }
            }
        }
    }

    fn begin_startup(&mut self) {
        let Some(source) = self.pending_source.take() else {
            tracing::error!(target: "session", "no pending source for startup");
            return;
        };

        self.generation += 1;
        self.capturing = Arc::new(AtomicBool::new(true));
        self.frames_sent = Arc::new(AtomicU64::new(0));

        tokio::spawn(run_setup(
            self.config.clone(),
            source,
            self.generation,
            self.capturing.clone(),
            self.frames_sent.clone(),
            self.event_tx.clone(),
        ));
    }

    fn spawn_first_frame_timer(&self) {
        let generation = self.generation;
        let capturing = self.capturing.clone();
        let events = self.event_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(FIRST_FRAME_WAIT).await;
            if capturing.load(Ordering::SeqCst) {
                let _ = events.send(WorkerEvent::FirstFrameTimeout { generation });
            }
        });
    }

    /// Releases session resources in reverse-creation order. Always closes
    /// the encoder before the surface session.
    async fn teardown(&mut self) {
        self.capturing.store(false, Ordering::SeqCst);
        // Anything still in flight for this session is now stale.
        self.generation += 1;

        // A stop that lands while setup is still in flight cancels the
        // start; the caller gets an answer, never a hang.
        if let Some(reply) = self.pending_start.take() {
            let _ = reply.send(Err(StreamError::StartCancelled));
        }

        let Some(resources) = self.resources.take() else {
            return;
        };
        dispose(resources).await;
    }

    fn status(&self) -> StreamStatus {
        let error = match &self.state {
            StreamState::Failed { error } => Some(error.clone()),
            _ => None,
        };
        StreamStatus {
            active: matches!(self.state, StreamState::Active { .. }),
            state: self.state.name().to_string(),
            error,
            frames_sent: self.frames_sent.load(Ordering::SeqCst),
            frames_dropped: self
                .resources
                .as_ref()
                .and_then(|r| r.queue.as_ref())
                .map(|q| q.dropped())
                .unwrap_or(0),
            uptime_seconds: self
                .state
                .started_at()
                .map(|t| t.elapsed().as_secs_f64())
                .unwrap_or(0.0),
            activation: self
                .resources
                .as_ref()
                .and_then(|r| r.activation.clone()),
        }
    }
}

/// Surface-side half of the teardown. A seam so the release ordering is
/// testable without a browser.
trait SurfaceTeardown {
    async fn stop_screencast(&self);
    async fn close(&self);
}

impl SurfaceTeardown for Page {
    async fn stop_screencast(&self) {
        Page::stop_screencast(self).await;
    }

    async fn close(&self) {
        Page::close(self).await;
    }
}

async fn dispose(resources: SessionResources) {
    release(resources.encoder_cmds, resources.queue, resources.page).await;
}

/// Encoder first (two-phase stop, awaited to completion), then the queue,
/// then the surface session.
async fn release<S: SurfaceTeardown>(
    encoder_cmds: mpsc::Sender<EncoderCommand>,
    queue: Option<Arc<FrameQueue>>,
    page: Option<S>,
) {
    let (done_tx, done_rx) = oneshot::channel();
    if encoder_cmds
        .send(EncoderCommand::Stop { done: done_tx })
        .await
        .is_ok()
    {
        let _ = done_rx.await;
    }

    if let Some(queue) = queue {
        queue.clear();
    }

    if let Some(page) = page {
        page.stop_screencast().await;
        page.close().await;
    }
}

fn validate_source(source: &SourceRef) -> Result<(), StreamError> {
    let url = match source {
        SourceRef::DirectUrl(url) => url,
        SourceRef::RenderedPage { url, .. } => url,
    };
    if url.trim().is_empty() {
        return Err(StreamError::InvalidRequest("source URL is empty".into()));
    }
    Ok(())
}

/// Builds the whole pipeline for one session. On failure it releases
/// everything it already created and reports `SetupFailed`; the coordinator
/// has nothing to clean up for a failed setup.
async fn run_setup(
    config: Config,
    source: SourceRef,
    generation: u64,
    capturing: Arc<AtomicBool>,
    frames_sent: Arc<AtomicU64>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    let fail = |error: StreamError| WorkerEvent::SetupFailed { generation, error };

    if let Err(e) = check_ffmpeg(&config.ffmpeg_bin).await {
        let _ = events.send(fail(e.into()));
        return;
    }

    match source {
        SourceRef::DirectUrl(url) => {
            let args = direct_url_args(&url, config.scale, &config.rtmp_url);
            let process = match EncoderProcess::spawn(&config.ffmpeg_bin, &args) {
                Ok(process) => process,
                Err(e) => {
                    let _ = events.send(fail(e.into()));
                    return;
                }
            };
            let encoder_cmds = spawn_supervisor(process, generation, events.clone());
            let _ = events.send(WorkerEvent::SetupComplete {
                generation,
                resources: SessionResources {
                    page: None,
                    queue: None,
                    encoder_cmds,
                    activation: None,
                },
            });
        }
        SourceRef::RenderedPage { url, selectors } => {
            let page = match Page::open(&config.chrome_host).await {
                Ok(page) => page,
                Err(e) => {
                    let _ = events.send(fail(e.into()));
                    return;
                }
            };

            if let Err(e) = page.navigate(&url, NAVIGATION_TIMEOUT).await {
                page.close().await;
                let _ = events.send(fail(e.into()));
                return;
            }

            let outcome = activate_playback(&page, &selectors).await;

            let queue = Arc::new(FrameQueue::new(config.queue_policy));

            let args = page_stream_args(config.frame_rate, config.scale, &config.rtmp_url);
            let mut process = match EncoderProcess::spawn(&config.ffmpeg_bin, &args) {
                Ok(process) => process,
                Err(e) => {
                    page.close().await;
                    let _ = events.send(fail(e.into()));
                    return;
                }
            };
            let Some(stdin) = process.take_stdin() else {
                process.stop().await;
                page.close().await;
                let _ = events.send(fail(
                    EncoderError::SpawnFailed("no stdin handle".into()).into(),
                ));
                return;
            };

            let encoder_cmds = spawn_supervisor(process, generation, events.clone());

            let (emitter_tx, mut emitter_rx) = mpsc::unbounded_channel();
            tokio::spawn(run_emitter(
                stdin,
                queue.clone(),
                config.frame_rate,
                capturing.clone(),
                frames_sent,
                emitter_tx,
            ));
            {
                let events = events.clone();
                tokio::spawn(async move {
                    while let Some(event) = emitter_rx.recv().await {
                        if events
                            .send(WorkerEvent::Emitter { generation, event })
                            .is_err()
                        {
                            break;
                        }
                    }
                });
            }

            if let Err(e) = page
                .start_screencast(
                    config.scale.width,
                    config.scale.height,
                    queue.clone(),
                    capturing.clone(),
                )
                .await
            {
                let (done_tx, done_rx) = oneshot::channel();
                if encoder_cmds
                    .send(EncoderCommand::Stop { done: done_tx })
                    .await
                    .is_ok()
                {
                    let _ = done_rx.await;
                }
                page.close().await;
                let _ = events.send(fail(e.into()));
                return;
            }

            tokio::spawn(run_keepalive(page.clone(), capturing.clone()));

            let _ = events.send(WorkerEvent::SetupComplete {
                generation,
                resources: SessionResources {
                    page: Some(page),
                    queue: Some(queue),
                    encoder_cmds,
                    activation: Some(outcome.describe()),
                },
            });
        }
    }
}

fn spawn_supervisor(
    process: EncoderProcess,
    generation: u64,
    events: mpsc::UnboundedSender<WorkerEvent>,
) -> mpsc::Sender<EncoderCommand> {
    let (cmd_tx, cmd_rx) = mpsc::channel(4);
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    tokio::spawn(supervise(process, cmd_rx, event_tx));
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if events
                .send(WorkerEvent::Encoder { generation, event })
                .is_err()
            {
                break;
            }
        }
    });
    cmd_tx
}

/// Periodically pokes the page so the surface keeps rendering. Independent
/// of capture ticks; mutates no pipeline state.
async fn run_keepalive(page: Page, capturing: Arc<AtomicBool>) {
    loop {
        tokio::time::sleep(KEEPALIVE_INTERVAL).await;
        if !capturing.load(Ordering::SeqCst) {
            break;
        }
        let _ = page.evaluate("void 0").await;
    }
    tracing::debug!(target: "session", "keep-alive probe finished");
}

/// Handle to send commands to the coordinator.
#[derive(Clone)]
pub struct SessionHandle {
    command_tx: mpsc::Sender<Command>,
}

impl SessionHandle {
    pub async fn start(&self, source: SourceRef) -> Result<(), StreamError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(Command::Start {
                source,
                reply: reply_tx,
            })
            .await
            .map_err(|_| StreamError::ShuttingDown)?;
        reply_rx.await.map_err(|_| StreamError::ShuttingDown)?
    }

    pub async fn stop(&self) -> Result<(), StreamError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(Command::Stop { reply: reply_tx })
            .await
            .map_err(|_| StreamError::ShuttingDown)?;
        reply_rx.await.map_err(|_| StreamError::ShuttingDown)?
    }

    pub async fn status(&self) -> StreamStatus {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .command_tx
            .send(Command::Status { reply: reply_tx })
            .await
            .is_err()
        {
            return StreamStatus {
                active: false,
                state: "unavailable".into(),
                error: Some("coordinator not running".into()),
                frames_sent: 0,
                frames_dropped: 0,
                uptime_seconds: 0.0,
                activation: None,
            };
        }
        reply_rx.await.unwrap_or(StreamStatus {
            active: false,
            state: "unavailable".into(),
            error: Some("coordinator not responding".into()),
            frames_sent: 0,
            frames_dropped: 0,
            uptime_seconds: 0.0,
            activation: None,
        })
    }
}

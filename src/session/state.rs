//! Pure state machine for the stream lifecycle.
//!
//! `(State, Event) -> (NewState, Vec<SideEffect>)`; the machine performs no
//! I/O and invalid transitions return the current state with empty effects.

use std::time::Instant;

/// Stream lifecycle. At most one session is live per process.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamState {
    /// Nothing running, ready to start.
    Idle,

    /// Start accepted; surface navigation, activation and encoder spawn are
    /// in flight.
    Starting { started_at: Instant },

    /// Frames are flowing (or the first-frame wait elapsed and capture
    /// proceeds anyway).
    Active { started_at: Instant },

    /// Stop accepted; ordered teardown in progress.
    Stopping { started_at: Instant },

    /// The last session failed. Carries the classified error until the next
    /// start clears it.
    Failed { error: String },
}

impl Default for StreamState {
    fn default() -> Self {
        Self::Idle
    }
}

impl StreamState {
    /// True while a session occupies the process (start requests conflict).
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            StreamState::Starting { .. } | StreamState::Active { .. } | StreamState::Stopping { .. }
        )
    }

    /// True when a stop request is meaningful.
    pub fn is_stoppable(&self) -> bool {
        matches!(self, StreamState::Starting { .. } | StreamState::Active { .. })
    }

    pub fn started_at(&self) -> Option<Instant> {
        match self {
            StreamState::Starting { started_at }
            | StreamState::Active { started_at }
            | StreamState::Stopping { started_at } => Some(*started_at),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StreamState::Idle => "idle",
            StreamState::Starting { .. } => "starting",
            StreamState::Active { .. } => "active",
            StreamState::Stopping { .. } => "stopping",
            StreamState::Failed { .. } => "failed",
        }
    }
}

/// Events that drive transitions.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Start accepted by the coordinator (conflicts already rejected).
    StartRequested,

    /// Navigation, activation or encoder spawn failed. Fatal to Starting.
    SetupFailed { error: String },

    /// Direct-URL mode: the encoder is up and pulling the source itself.
    PipelineReady,

    /// First frame was accepted into the encoder pipe.
    FirstFrameSent,

    /// The bounded wait for the first frame elapsed; capture proceeds
    /// rather than stalling indefinitely.
    FirstFrameWaitElapsed,

    /// Explicit stop request (or external termination signal).
    StopRequested,

    /// The encoder exited cleanly on its own; the stream is over.
    EncoderFinished,

    /// Encoder crash/abnormal exit or unexpected pipe termination while the
    /// session believed itself capturing.
    RuntimeFailed { error: String },

    /// Ordered teardown finished.
    TeardownComplete,
}

/// Side effects executed by the coordinator; the machine never does I/O.
#[derive(Debug, Clone, PartialEq)]
pub enum SideEffect {
    /// Launch the setup task (surface, activator, queue, encoder).
    BeginStartup,
    /// Clear the shared capturing flag so every loop winds down.
    SignalStop,
    /// Release resources in reverse-creation order: encoder first, then
    /// queue, then the surface session.
    Teardown,
}

/// Pure transition function. Invalid combinations are no-ops.
pub fn transition(state: StreamState, event: StreamEvent) -> (StreamState, Vec<SideEffect>) {
    match (&state, event) {
        (StreamState::Idle | StreamState::Failed { .. }, StreamEvent::StartRequested) => (
            StreamState::Starting {
                started_at: Instant::now(),
            },
            vec![SideEffect::BeginStartup],
        ),

        // The setup task cleans up after its own failure; only the flag
        // needs clearing.
        (StreamState::Starting { .. }, StreamEvent::SetupFailed { error }) => {
            (StreamState::Failed { error }, vec![SideEffect::SignalStop])
        }

        (
            StreamState::Starting { started_at },
            StreamEvent::PipelineReady
            | StreamEvent::FirstFrameSent
            | StreamEvent::FirstFrameWaitElapsed,
        ) => (
            StreamState::Active {
                started_at: *started_at,
            },
            vec![],
        ),

        (
            StreamState::Starting { started_at } | StreamState::Active { started_at },
            StreamEvent::StopRequested | StreamEvent::EncoderFinished,
        ) => (
            StreamState::Stopping {
                started_at: *started_at,
            },
            vec![SideEffect::SignalStop, SideEffect::Teardown],
        ),

        (
            StreamState::Starting { .. } | StreamState::Active { .. },
            StreamEvent::RuntimeFailed { error },
        ) => (
            StreamState::Failed { error },
            vec![SideEffect::SignalStop, SideEffect::Teardown],
        ),

        (StreamState::Stopping { .. }, StreamEvent::TeardownComplete) => {
            (StreamState::Idle, vec![])
        }

        _ => (state, vec![]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn starting() -> StreamState {
        StreamState::Starting {
            started_at: Instant::now(),
        }
    }

    fn active() -> StreamState {
        StreamState::Active {
            started_at: Instant::now(),
        }
    }

    #[test]
    fn idle_start_begins_startup() {
        let (state, effects) = transition(StreamState::Idle, StreamEvent::StartRequested);
        assert!(matches!(state, StreamState::Starting { .. }));
        assert_eq!(effects, vec![SideEffect::BeginStartup]);
    }

    #[test]
    fn failed_accepts_start_and_clears_error() {
        let failed = StreamState::Failed {
            error: "encoder crashed".into(),
        };
        let (state, effects) = transition(failed, StreamEvent::StartRequested);
        assert!(matches!(state, StreamState::Starting { .. }));
        assert_eq!(effects, vec![SideEffect::BeginStartup]);
    }

    #[test]
    fn first_frame_activates() {
        let (state, effects) = transition(starting(), StreamEvent::FirstFrameSent);
        assert!(matches!(state, StreamState::Active { .. }));
        assert!(effects.is_empty());
    }

    #[test]
    fn first_frame_timeout_activates_anyway() {
        let (state, _) = transition(starting(), StreamEvent::FirstFrameWaitElapsed);
        assert!(matches!(state, StreamState::Active { .. }));
    }

    #[test]
    fn first_frame_after_active_is_noop() {
        let before = active();
        let (state, effects) = transition(before.clone(), StreamEvent::FirstFrameSent);
        assert_eq!(state, before);
        assert!(effects.is_empty());
    }

    #[test]
    fn setup_failure_fails_without_teardown() {
        let (state, effects) = transition(
            starting(),
            StreamEvent::SetupFailed {
                error: "navigation timed out".into(),
            },
        );
        assert!(matches!(state, StreamState::Failed { .. }));
        assert_eq!(effects, vec![SideEffect::SignalStop]);
    }

    #[test]
    fn stop_from_active_signals_then_tears_down() {
        let (state, effects) = transition(active(), StreamEvent::StopRequested);
        assert!(matches!(state, StreamState::Stopping { .. }));
        assert_eq!(effects, vec![SideEffect::SignalStop, SideEffect::Teardown]);
    }

    #[test]
    fn stop_can_cancel_starting() {
        let (state, effects) = transition(starting(), StreamEvent::StopRequested);
        assert!(matches!(state, StreamState::Stopping { .. }));
        assert_eq!(effects, vec![SideEffect::SignalStop, SideEffect::Teardown]);
    }

    #[test]
    fn clean_encoder_self_exit_stops_the_stream() {
        let (state, effects) = transition(active(), StreamEvent::EncoderFinished);
        assert!(matches!(state, StreamState::Stopping { .. }));
        assert_eq!(effects, vec![SideEffect::SignalStop, SideEffect::Teardown]);
    }

    #[test]
    fn runtime_failure_fails_with_teardown() {
        let (state, effects) = transition(
            active(),
            StreamEvent::RuntimeFailed {
                error: "encoder crashed".into(),
            },
        );
        match state {
            StreamState::Failed { error } => assert_eq!(error, "encoder crashed"),
            other => panic!("expected Failed, got {other:?}"),
        }
        assert_eq!(effects, vec![SideEffect::SignalStop, SideEffect::Teardown]);
    }

    #[test]
    fn teardown_complete_returns_to_idle() {
        let stopping = StreamState::Stopping {
            started_at: Instant::now(),
        };
        let (state, effects) = transition(stopping, StreamEvent::TeardownComplete);
        assert_eq!(state, StreamState::Idle);
        assert!(effects.is_empty());
    }

    #[test]
    fn invalid_transitions_are_noops() {
        let (state, effects) = transition(StreamState::Idle, StreamEvent::StopRequested);
        assert_eq!(state, StreamState::Idle);
        assert!(effects.is_empty());

        let failed = StreamState::Failed { error: "x".into() };
        let (state, effects) = transition(failed.clone(), StreamEvent::TeardownComplete);
        assert_eq!(state, failed);
        assert!(effects.is_empty());

        // Late runtime failures during teardown don't clobber Stopping.
        let stopping = StreamState::Stopping {
            started_at: Instant::now(),
        };
        let (state, _) = transition(
            stopping.clone(),
            StreamEvent::RuntimeFailed { error: "x".into() },
        );
        assert_eq!(state, stopping);
    }
}

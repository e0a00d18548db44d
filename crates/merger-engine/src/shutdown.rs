use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::emitter::Emitter;
use crate::error::EngineResult;

/// Lifecycle phase of a merge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Running,
    /// No new fetches; records already fetched are still forwarded.
    Draining,
    Stopped,
}

/// Why the merge left [`Phase::Running`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopCause {
    SourcesEnded,
    StopRequested,
    DownstreamFailed,
}

impl fmt::Display for StopCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SourcesEnded => f.write_str("all sources ended"),
            Self::StopRequested => f.write_str("stop requested"),
            Self::DownstreamFailed => f.write_str("downstream failed"),
        }
    }
}

struct ShutdownState {
    phase: Phase,
    cause: Option<StopCause>,
    terminal_sent: bool,
}

/// RUNNING -> DRAINING -> STOPPED.
///
/// Guarantees the terminal marker is sent at most once, and only from
/// [`finish`](Self::finish), which the engine calls after every reader
/// has exited.
pub struct ShutdownCoordinator {
    /// Fast-path flag checked by readers before every fetch.
    stopping: AtomicBool,
    state: Mutex<ShutdownState>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            stopping: AtomicBool::new(false),
            state: Mutex::new(ShutdownState {
                phase: Phase::Running,
                cause: None,
                terminal_sent: false,
            }),
        }
    }

    /// `true` once a stop was requested or downstream failed: readers must
    /// not begin new fetches.
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// External stop signal. Returns `true` the first time it takes effect.
    pub fn request_stop(&self) -> bool {
        self.stopping.store(true, Ordering::SeqCst);
        self.drain(StopCause::StopRequested)
    }

    /// Every source has ENDED.
    pub fn sources_ended(&self) -> bool {
        self.drain(StopCause::SourcesEnded)
    }

    /// Downstream rejected a send. Overrides any earlier cause, since nothing
    /// more can be sent.
    pub fn downstream_failed(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        let mut state = self.state.lock().expect("shutdown lock poisoned");
        if state.phase == Phase::Stopped {
            return;
        }
        state.phase = Phase::Draining;
        state.cause = Some(StopCause::DownstreamFailed);
        warn!("downstream failed, merge aborting");
    }

    fn drain(&self, cause: StopCause) -> bool {
        let mut state = self.state.lock().expect("shutdown lock poisoned");
        if state.phase != Phase::Running {
            return false;
        }
        state.phase = Phase::Draining;
        state.cause = Some(cause);
        info!(cause = %cause, "draining");
        true
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().expect("shutdown lock poisoned").phase
    }

    pub fn cause(&self) -> Option<StopCause> {
        self.state.lock().expect("shutdown lock poisoned").cause
    }

    pub fn terminal_sent(&self) -> bool {
        self.state.lock().expect("shutdown lock poisoned").terminal_sent
    }

    /// Enter STOPPED and send the terminal marker unless suppressed or
    /// downstream failed. Later calls do nothing. Returns whether the marker
    /// was sent by this call.
    pub fn finish(&self, emitter: &Emitter, suppress_terminal: bool) -> EngineResult<bool> {
        let mut state = self.state.lock().expect("shutdown lock poisoned");
        if state.phase == Phase::Stopped {
            return Ok(false);
        }
        if state.cause.is_none() {
            state.cause = Some(StopCause::SourcesEnded);
        }
        state.phase = Phase::Stopped;

        let send = !suppress_terminal
            && !state.terminal_sent
            && state.cause != Some(StopCause::DownstreamFailed);
        if send {
            emitter.send_terminal()?;
            state.terminal_sent = true;
        }
        info!(terminal_sent = state.terminal_sent, "stopped");
        Ok(send)
    }
}

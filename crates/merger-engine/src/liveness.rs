use std::fmt;

use merger_types::SourceId;
use serde::{Deserialize, Serialize};

/// Liveness of one source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceState {
    /// Producing; takes part in rendezvous rounds.
    Active,
    /// Silent past its timeout; excluded from rounds until it produces again.
    Stalled,
    /// End-of-stream, fatal error, or stop. Terminal.
    Ended,
}

impl fmt::Display for SourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => f.write_str("active"),
            Self::Stalled => f.write_str("stalled"),
            Self::Ended => f.write_str("ended"),
        }
    }
}

/// A state change that was applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    pub source: SourceId,
    pub from: SourceState,
    pub to: SourceState,
}

/// Per-source liveness state machine.
///
/// ```text
/// ACTIVE <-> STALLED
///    \        /
///     v      v
///      ENDED
/// ```
///
/// All sources start ACTIVE. ENDED never changes again. The tracker has no
/// lock of its own: it lives inside the rendezvous coordinator's critical
/// section so that liveness and round bookkeeping change together.
#[derive(Clone, Debug)]
pub struct LivenessTracker {
    states: Vec<SourceState>,
}

impl LivenessTracker {
    pub fn new(sources: usize) -> Self {
        Self {
            states: vec![SourceState::Active; sources],
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn state(&self, source: SourceId) -> SourceState {
        self.states
            .get(source.index())
            .copied()
            .unwrap_or(SourceState::Ended)
    }

    pub fn is_active(&self, source: SourceId) -> bool {
        self.state(source) == SourceState::Active
    }

    /// Apply a transition.
    ///
    /// Returns `None` when nothing changed: the source is already in `to`,
    /// the source has ENDED, or the id is unknown.
    pub fn transition(&mut self, source: SourceId, to: SourceState) -> Option<Transition> {
        let slot = self.states.get_mut(source.index())?;
        let from = *slot;
        if from == to || from == SourceState::Ended {
            return None;
        }
        *slot = to;
        Some(Transition { source, from, to })
    }

    /// Number of sources currently ACTIVE.
    pub fn active_count(&self) -> usize {
        self.count(SourceState::Active)
    }

    /// Number of sources not yet ENDED.
    pub fn live_count(&self) -> usize {
        self.states.len() - self.count(SourceState::Ended)
    }

    pub fn all_ended(&self) -> bool {
        self.live_count() == 0
    }

    pub fn snapshot(&self) -> Vec<SourceState> {
        self.states.clone()
    }

    fn count(&self, state: SourceState) -> usize {
        self.states.iter().filter(|s| **s == state).count()
    }
}

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use merger_types::{Schema, SourceId, TimestampSelector};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::MergeMode;
use crate::liveness::SourceState;
use crate::shutdown::StopCause;

/// Counters of one source (thread-safe).
#[derive(Debug, Default)]
struct SourceCounters {
    received: AtomicU64,
    forwarded: AtomicU64,
    timeouts: AtomicU64,
    malformed: AtomicU64,
    schema_changes: AtomicU64,
}

/// Live per-source counters, updated by the reader threads.
#[derive(Debug)]
pub struct MergeStats {
    sources: Vec<SourceCounters>,
}

impl MergeStats {
    pub fn new(sources: usize) -> Self {
        Self {
            sources: (0..sources).map(|_| SourceCounters::default()).collect(),
        }
    }

    fn bump(&self, source: SourceId, pick: impl Fn(&SourceCounters) -> &AtomicU64) {
        if let Some(counters) = self.sources.get(source.index()) {
            pick(counters).fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_received(&self, source: SourceId) {
        self.bump(source, |c| &c.received);
    }

    pub fn record_forwarded(&self, source: SourceId) {
        self.bump(source, |c| &c.forwarded);
    }

    pub fn record_timeout(&self, source: SourceId) {
        self.bump(source, |c| &c.timeouts);
    }

    pub fn record_malformed(&self, source: SourceId) {
        self.bump(source, |c| &c.malformed);
    }

    pub fn record_schema_change(&self, source: SourceId) {
        self.bump(source, |c| &c.schema_changes);
    }

    /// Copy the counters, pairing each source with its liveness state.
    pub fn snapshot(&self, states: &[SourceState]) -> Vec<SourceReport> {
        self.sources
            .iter()
            .zip(SourceId::range(self.sources.len()))
            .map(|(c, id)| SourceReport {
                source: id,
                state: states.get(id.index()).copied().unwrap_or(SourceState::Ended),
                received: c.received.load(Ordering::Relaxed),
                forwarded: c.forwarded.load(Ordering::Relaxed),
                timeouts: c.timeouts.load(Ordering::Relaxed),
                malformed: c.malformed.load(Ordering::Relaxed),
                schema_changes: c.schema_changes.load(Ordering::Relaxed),
            })
            .collect()
    }
}

/// Final counters of one source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceReport {
    pub source: SourceId,
    pub state: SourceState,
    /// Records decoded from this source.
    pub received: u64,
    /// Records this source forwarded downstream.
    pub forwarded: u64,
    /// Times this source went STALLED.
    pub timeouts: u64,
    /// Frames skipped because they could not be decoded.
    pub malformed: u64,
    pub schema_changes: u64,
}

/// Summary of a finished merge.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MergeReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub mode: MergeMode,
    pub timestamp: TimestampSelector,
    /// Rendezvous rounds closed; zero in interleave mode.
    pub rounds: u64,
    pub cause: StopCause,
    pub terminal_sent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Schema>,
    pub sources: Vec<SourceReport>,
}

impl MergeReport {
    pub fn total_received(&self) -> u64 {
        self.sources.iter().map(|s| s.received).sum()
    }

    pub fn total_forwarded(&self) -> u64 {
        self.sources.iter().map(|s| s.forwarded).sum()
    }

    pub fn total_malformed(&self) -> u64 {
        self.sources.iter().map(|s| s.malformed).sum()
    }

    /// Records fetched but never forwarded.
    pub fn dropped(&self) -> u64 {
        self.total_received().saturating_sub(self.total_forwarded())
    }

    pub fn elapsed_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }

    pub fn log_summary(&self) {
        info!(
            cause = %self.cause,
            rounds = self.rounds,
            received = self.total_received(),
            forwarded = self.total_forwarded(),
            malformed = self.total_malformed(),
            dropped = self.dropped(),
            terminal_sent = self.terminal_sent,
            elapsed_ms = self.elapsed_ms(),
            "merge finished"
        );
        for s in &self.sources {
            info!(
                source = %s.source,
                state = %s.state,
                received = s.received,
                forwarded = s.forwarded,
                timeouts = s.timeouts,
                malformed = s.malformed,
                "source summary"
            );
        }
    }
}

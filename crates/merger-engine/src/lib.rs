//! Time-ordered merge engine.
//!
//! Merges records arriving independently on up to [`MAX_SOURCES`] inputs
//! into one output stream ordered by a per-record timestamp, while sources
//! stall, end, or come back at arbitrary times.
//!
//! One reader thread runs per source. Readers meet at a
//! [`RendezvousCoordinator`]: every ACTIVE source deposits the timestamp of
//! the record it holds, the smallest timestamp wins, and only the winner
//! forwards through the [`Emitter`]. A source whose timed fetch comes back
//! empty is marked STALLED by the [`LivenessTracker`] and stops holding up
//! rounds until it produces again. The [`ShutdownCoordinator`] sends the
//! terminal marker exactly once after every record has been forwarded.
//!
//! [`MAX_SOURCES`]: merger_types::MAX_SOURCES

pub mod config;
pub mod emitter;
pub mod engine;
pub mod error;
pub mod liveness;
pub mod reader;
pub mod rendezvous;
pub mod shutdown;
pub mod stats;

pub use config::{MergeConfig, MergeMode};
pub use emitter::Emitter;
pub use engine::{MergeEngine, StopHandle};
pub use error::{EngineError, EngineResult};
pub use liveness::{LivenessTracker, SourceState, Transition};
pub use reader::{ExitReason, ReaderContext, SourceReader};
pub use rendezvous::{
    LivenessUpdate, RendezvousCoordinator, RendezvousRound, RoundStatus, Verdict,
};
pub use shutdown::{Phase, ShutdownCoordinator, StopCause};
pub use stats::{MergeReport, MergeStats, SourceReport};

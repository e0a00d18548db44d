use std::fmt;
use std::time::{Duration, Instant};

use merger_transport::{Delivery, Fetched, InputChannel, TransportResult};
use merger_types::{Frame, Record, RecordCodec, SourceId, Timestamp};
use tracing::{debug, info, warn};

use crate::config::{MergeConfig, MergeMode};
use crate::emitter::Emitter;
use crate::liveness::SourceState;
use crate::rendezvous::{RendezvousCoordinator, Verdict};
use crate::shutdown::ShutdownCoordinator;
use crate::stats::MergeStats;

/// Everything a reader shares with the other readers of one merge.
pub struct ReaderContext<'a> {
    pub config: &'a MergeConfig,
    pub coordinator: &'a RendezvousCoordinator,
    pub shutdown: &'a ShutdownCoordinator,
    pub emitter: &'a Emitter,
    pub stats: &'a MergeStats,
}

/// Why a reader stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitReason {
    /// The source sent the terminal marker.
    EndOfStream,
    /// The transport shut down.
    Terminated,
    /// The fetch failed.
    TransportError,
    /// The source negotiated a schema that conflicts with the output.
    SchemaConflict,
    /// A schema change was signaled but no schema could be obtained.
    NegotiationFailed,
    /// A stop was requested and nothing was left to forward.
    Stopped,
    /// This reader's send failed.
    DownstreamFailed,
    /// Another reader's send failed.
    Aborted,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::EndOfStream => "end of stream",
            Self::Terminated => "transport terminated",
            Self::TransportError => "transport error",
            Self::SchemaConflict => "schema conflict",
            Self::NegotiationFailed => "schema negotiation failed",
            Self::Stopped => "stopped",
            Self::DownstreamFailed => "downstream failed",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// A fetched record waiting to win a round.
struct Pending {
    record: Record,
    timestamp: Timestamp,
}

enum Step {
    Record(Record),
    /// Nothing to hand over; fetch again.
    Idle,
    Exit(ExitReason),
}

/// Marks the source ENDED however the reader leaves, and starts the drain
/// once it was the last one.
struct ExitGuard<'a> {
    source: SourceId,
    coordinator: &'a RendezvousCoordinator,
    shutdown: &'a ShutdownCoordinator,
}

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        let update = self.coordinator.report(self.source, SourceState::Ended);
        if update.all_ended {
            self.shutdown.sources_ended();
        }
    }
}

/// Pulls records from one input and competes for the right to forward them.
pub struct SourceReader {
    id: SourceId,
    input: Box<dyn InputChannel>,
    /// Current fetch timeout; zero while the source is stalled.
    timeout: Duration,
    pending: Option<Pending>,
}

impl SourceReader {
    pub fn new(id: SourceId, input: Box<dyn InputChannel>, initial_timeout: Duration) -> Self {
        Self {
            id,
            input,
            timeout: initial_timeout,
            pending: None,
        }
    }

    pub fn id(&self) -> SourceId {
        self.id
    }

    /// Run until the source ends, the merge stops, or downstream fails.
    pub fn run(mut self, ctx: &ReaderContext<'_>) -> ExitReason {
        let _guard = ExitGuard {
            source: self.id,
            coordinator: ctx.coordinator,
            shutdown: ctx.shutdown,
        };
        info!(source = %self.id, mode = %ctx.config.mode, "reader started");
        let reason = match ctx.config.mode {
            MergeMode::TimeAware => self.run_time_aware(ctx),
            MergeMode::Interleave => self.run_interleave(ctx),
        };
        if let Some(pending) = &self.pending {
            warn!(source = %self.id, timestamp = %pending.timestamp, "record dropped on exit");
        }
        info!(source = %self.id, reason = %reason, "reader exiting");
        reason
    }

    fn run_time_aware(&mut self, ctx: &ReaderContext<'_>) -> ExitReason {
        loop {
            if self.pending.is_none() {
                if ctx.shutdown.is_stopping() {
                    return ExitReason::Stopped;
                }
                match self.next_record(ctx) {
                    Step::Record(record) => {
                        let timestamp = ctx.config.timestamp.select(&record);
                        self.pending = Some(Pending { record, timestamp });
                    }
                    Step::Idle => continue,
                    Step::Exit(reason) => return reason,
                }
            }
            let Some(timestamp) = self.pending.as_ref().map(|p| p.timestamp) else {
                continue;
            };
            match ctx.coordinator.deposit(self.id, timestamp) {
                Verdict::Won => {
                    if let Some(pending) = self.pending.take() {
                        if let Err(reason) = self.forward(ctx, &pending.record) {
                            return reason;
                        }
                    }
                }
                // Keep the record and compete again.
                Verdict::Lost | Verdict::NoWinner => {}
                Verdict::Aborted => return ExitReason::Aborted,
            }
        }
    }

    fn run_interleave(&mut self, ctx: &ReaderContext<'_>) -> ExitReason {
        loop {
            if ctx.shutdown.is_stopping() {
                return ExitReason::Stopped;
            }
            match self.next_record(ctx) {
                Step::Record(record) => {
                    if let Err(reason) = self.forward(ctx, &record) {
                        return reason;
                    }
                }
                Step::Idle => {}
                Step::Exit(reason) => return reason,
            }
        }
    }

    fn forward(&self, ctx: &ReaderContext<'_>, record: &Record) -> Result<(), ExitReason> {
        match ctx.emitter.send(self.id, record) {
            Ok(()) => {
                ctx.stats.record_forwarded(self.id);
                Ok(())
            }
            Err(err) => {
                warn!(source = %self.id, error = %err, "forward failed, aborting merge");
                ctx.shutdown.downstream_failed();
                ctx.coordinator.abort();
                Err(ExitReason::DownstreamFailed)
            }
        }
    }

    fn next_record(&mut self, ctx: &ReaderContext<'_>) -> Step {
        let fetched = if self.timeout.is_zero() {
            self.input.fetch_nonblocking()
        } else {
            self.fetch_sliced(ctx)
        };
        match fetched {
            Ok(Fetched::Data(delivery)) => self.accept(ctx, delivery),
            Ok(Fetched::Empty) => {
                if ctx.shutdown.is_stopping() {
                    return Step::Exit(ExitReason::Stopped);
                }
                if self.timeout.is_zero() {
                    ctx.coordinator
                        .pause(ctx.config.stall_poll_interval, || ctx.shutdown.is_stopping());
                } else {
                    self.stall(ctx);
                }
                Step::Idle
            }
            Ok(Fetched::Terminated) => Step::Exit(ExitReason::Terminated),
            Err(err) => {
                warn!(source = %self.id, error = %err, "fetch failed");
                Step::Exit(ExitReason::TransportError)
            }
        }
    }

    /// Timed fetch split into slices so a stop request is noticed promptly.
    fn fetch_sliced(&mut self, ctx: &ReaderContext<'_>) -> TransportResult<Fetched> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let fetched = self
                .input
                .fetch(remaining.min(ctx.config.stop_check_interval))?;
            let done = !matches!(fetched, Fetched::Empty)
                || Instant::now() >= deadline
                || ctx.shutdown.is_stopping();
            if done {
                return Ok(fetched);
            }
        }
    }

    fn accept(&mut self, ctx: &ReaderContext<'_>, delivery: Delivery) -> Step {
        if delivery.schema_changed {
            let Some(schema) = self.input.current_schema() else {
                warn!(source = %self.id, "schema change signaled without a schema");
                return Step::Exit(ExitReason::NegotiationFailed);
            };
            ctx.stats.record_schema_change(self.id);
            if let Err(err) = ctx.emitter.update_schema(self.id, &schema) {
                warn!(source = %self.id, error = %err, "incompatible schema");
                return Step::Exit(ExitReason::SchemaConflict);
            }
        }

        match RecordCodec::decode(&delivery.frame) {
            Ok(Frame::Terminal) => Step::Exit(ExitReason::EndOfStream),
            Ok(Frame::Record(record)) => {
                ctx.stats.record_received(self.id);
                if self.timeout.is_zero() {
                    self.timeout = ctx.config.initial_timeout;
                    info!(source = %self.id, "source reactivated");
                }
                ctx.coordinator.report(self.id, SourceState::Active);
                debug!(source = %self.id, time_last = %record.time_last, "record fetched");
                Step::Record(record)
            }
            Err(err) => {
                ctx.stats.record_malformed(self.id);
                warn!(source = %self.id, error = %err, len = delivery.frame.len(), "malformed frame skipped");
                Step::Idle
            }
        }
    }

    fn stall(&mut self, ctx: &ReaderContext<'_>) {
        self.timeout = Duration::ZERO;
        ctx.stats.record_timeout(self.id);
        let update = ctx.coordinator.report(self.id, SourceState::Stalled);
        info!(source = %self.id, active = update.active, "source stalled");
    }
}

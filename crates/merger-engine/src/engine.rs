use std::sync::Arc;
use std::thread;

use chrono::Utc;
use merger_transport::{InputChannel, OutputChannel};
use merger_types::SourceId;
use tracing::{error, info, warn};

use crate::config::MergeConfig;
use crate::emitter::Emitter;
use crate::error::{EngineError, EngineResult};
use crate::liveness::SourceState;
use crate::reader::{ReaderContext, SourceReader};
use crate::rendezvous::RendezvousCoordinator;
use crate::shutdown::{ShutdownCoordinator, StopCause};
use crate::stats::{MergeReport, MergeStats};

/// Requests a graceful stop of a running [`MergeEngine`] from any thread.
///
/// Readers stop fetching; records they already hold are still forwarded
/// in order before the terminal marker goes out.
#[derive(Clone)]
pub struct StopHandle {
    coordinator: Arc<RendezvousCoordinator>,
    shutdown: Arc<ShutdownCoordinator>,
}

impl StopHandle {
    pub fn stop(&self) {
        if self.shutdown.request_stop() {
            info!("stop requested");
        }
        self.coordinator.wake_all();
    }

    pub fn is_stopping(&self) -> bool {
        self.shutdown.is_stopping()
    }
}

/// Merges N inputs into one output.
///
/// ```no_run
/// use merger_engine::{MergeConfig, MergeEngine};
/// use merger_transport::{channel, InputChannel, MemoryOutput};
///
/// let (tx, rx) = channel();
/// let (output, _log) = MemoryOutput::new();
/// let inputs: Vec<Box<dyn InputChannel>> = vec![Box::new(rx)];
/// let engine = MergeEngine::new(MergeConfig::new(1), inputs, Box::new(output)).unwrap();
/// tx.send_terminal().unwrap();
/// let report = engine.run().unwrap();
/// assert!(report.terminal_sent);
/// ```
pub struct MergeEngine {
    config: MergeConfig,
    inputs: Vec<Box<dyn InputChannel>>,
    emitter: Emitter,
    coordinator: Arc<RendezvousCoordinator>,
    shutdown: Arc<ShutdownCoordinator>,
    stats: MergeStats,
}

impl MergeEngine {
    /// Validate `config` and bind one input per configured source.
    pub fn new(
        config: MergeConfig,
        inputs: Vec<Box<dyn InputChannel>>,
        output: Box<dyn OutputChannel>,
    ) -> EngineResult<Self> {
        config.validate()?;
        if inputs.len() != config.sources {
            return Err(EngineError::SourceCount {
                expected: config.sources,
                actual: inputs.len(),
            });
        }
        let emitter = Emitter::new(output, config.output_schema.clone());
        Ok(Self {
            coordinator: Arc::new(RendezvousCoordinator::new(config.sources)),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            stats: MergeStats::new(config.sources),
            config,
            inputs,
            emitter,
        })
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            coordinator: Arc::clone(&self.coordinator),
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    /// Run the merge to completion on the calling thread.
    ///
    /// Spawns one reader thread per source and returns once all of them
    /// have exited and the terminal marker was sent. Fails if downstream
    /// rejected a send, in which case no terminal marker is sent.
    pub fn run(self) -> EngineResult<MergeReport> {
        let Self {
            config,
            inputs,
            emitter,
            coordinator,
            shutdown,
            stats,
        } = self;
        let started_at = Utc::now();
        info!(
            sources = config.sources,
            mode = %config.mode,
            timestamp = %config.timestamp,
            initial_timeout_ms = config.initial_timeout.as_millis() as u64,
            "merge started"
        );

        let ctx = ReaderContext {
            config: &config,
            coordinator: &coordinator,
            shutdown: &shutdown,
            emitter: &emitter,
            stats: &stats,
        };

        let mut spawn_error = None;
        thread::scope(|scope| {
            let mut handles = Vec::with_capacity(inputs.len());
            for (id, input) in SourceId::range(config.sources).zip(inputs) {
                let reader = SourceReader::new(id, input, config.initial_timeout);
                let ctx = &ctx;
                let spawned = thread::Builder::new()
                    .name(format!("merger-{}", id.index()))
                    .spawn_scoped(scope, move || reader.run(ctx));
                match spawned {
                    Ok(handle) => handles.push((id, handle)),
                    Err(err) => {
                        error!(source = %id, error = %err, "failed to spawn reader");
                        if coordinator.report(id, SourceState::Ended).all_ended {
                            shutdown.sources_ended();
                        }
                        shutdown.request_stop();
                        coordinator.wake_all();
                        if spawn_error.is_none() {
                            spawn_error = Some(err);
                        }
                    }
                }
            }
            for (id, handle) in handles {
                if handle.join().is_err() {
                    error!(source = %id, "reader panicked");
                }
            }
        });

        shutdown.sources_ended();
        if let Err(err) = shutdown.finish(&emitter, config.suppress_terminal) {
            warn!(error = %err, "terminal marker not sent");
        }

        let report = MergeReport {
            started_at,
            finished_at: Utc::now(),
            mode: config.mode,
            timestamp: config.timestamp,
            rounds: coordinator.rounds_closed(),
            cause: shutdown.cause().unwrap_or(StopCause::SourcesEnded),
            terminal_sent: shutdown.terminal_sent(),
            output_schema: emitter.output_schema(),
            sources: stats.snapshot(&coordinator.states()),
        };
        report.log_summary();

        if let Some(reason) = emitter.failure() {
            return Err(EngineError::Aborted(reason));
        }
        if let Some(err) = spawn_error {
            return Err(err.into());
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use merger_transport::{
        channel, Fetched, MemoryInput, MemoryOutput, MemorySender, OutputEvent, OutputLog,
        TransportError, TransportResult,
    };
    use merger_types::{Frame, Record, RecordCodec, Schema, Timestamp};
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn rec(source: usize, raw: u64) -> Record {
        Record::instant(Timestamp::from_raw(raw), format!("s{source}-{raw}"))
    }

    fn setup(config: MergeConfig) -> (MergeEngine, Vec<MemorySender>, OutputLog) {
        let (senders, inputs): (Vec<_>, Vec<_>) = (0..config.sources)
            .map(|_| {
                let (tx, rx) = channel();
                (tx, Box::new(rx) as Box<dyn InputChannel>)
            })
            .unzip();
        let (output, log) = MemoryOutput::new();
        let engine = MergeEngine::new(config, inputs, Box::new(output)).unwrap();
        (engine, senders, log)
    }

    fn feed(sender: &MemorySender, source: usize, stamps: &[u64]) {
        for raw in stamps {
            sender.send_record(&rec(source, *raw)).unwrap();
        }
        sender.send_terminal().unwrap();
    }

    fn bodies(log: &OutputLog) -> Vec<String> {
        log.records()
            .iter()
            .map(|r| String::from_utf8_lossy(&r.body).into_owned())
            .collect()
    }

    fn patient(sources: usize) -> MergeConfig {
        MergeConfig::new(sources).with_initial_timeout(Duration::from_secs(2))
    }

    fn quick(sources: usize) -> MergeConfig {
        MergeConfig::new(sources)
            .with_initial_timeout(Duration::from_millis(100))
            .with_stall_poll_interval(Duration::from_millis(10))
    }

    struct BrokenInput;

    impl InputChannel for BrokenInput {
        fn fetch(&mut self, _timeout: Duration) -> TransportResult<Fetched> {
            Err(TransportError::Negotiation("peer rejected handshake".into()))
        }

        fn fetch_nonblocking(&mut self) -> TransportResult<Fetched> {
            self.fetch(Duration::ZERO)
        }

        fn current_schema(&self) -> Option<Schema> {
            None
        }
    }

    #[test]
    fn three_sources_merge_in_time_order() {
        let (engine, senders, log) = setup(patient(3));
        feed(&senders[0], 0, &[10, 30, 50]);
        feed(&senders[1], 1, &[20, 40]);
        feed(&senders[2], 2, &[15, 25, 60]);

        let report = engine.run().unwrap();

        assert_eq!(
            bodies(&log),
            vec!["s0-10", "s2-15", "s1-20", "s2-25", "s0-30", "s1-40", "s0-50", "s2-60"]
        );
        let events = log.events();
        assert_eq!(events.last(), Some(&OutputEvent::Terminal));
        assert_eq!(log.terminal_count(), 1);
        assert_eq!(report.cause, StopCause::SourcesEnded);
        assert_eq!(report.total_forwarded(), 8);
        assert_eq!(report.dropped(), 0);
        assert!(report.rounds >= 8);
        assert!(report.sources.iter().all(|s| s.state == SourceState::Ended));
    }

    #[test]
    fn stalled_source_does_not_block_and_rejoins_later() {
        let (engine, senders, log) = setup(quick(2));
        let stop = engine.stop_handle();
        senders[0].send_record(&rec(0, 5)).unwrap();
        senders[1].send_record(&rec(1, 7)).unwrap();

        let report = thread::scope(|s| {
            let handle = s.spawn(move || engine.run());
            assert!(log.wait_for_records(2, Duration::from_secs(5)));

            // S0 was stalled when 7 went out; its late record follows.
            senders[0].send_record(&rec(0, 6)).unwrap();
            senders[0].send_terminal().unwrap();
            assert!(log.wait_for_records(3, Duration::from_secs(5)));

            stop.stop();
            handle.join().unwrap().unwrap()
        });

        assert_eq!(bodies(&log), vec!["s0-5", "s1-7", "s0-6"]);
        assert_eq!(log.terminal_count(), 1);
        assert_eq!(report.cause, StopCause::StopRequested);
        assert!(report.sources[0].timeouts >= 1);
    }

    #[test]
    fn stop_with_silent_sources_returns_promptly() {
        let (engine, _senders, log) = setup(patient(2));
        let stop = engine.stop_handle();
        let start = Instant::now();

        let report = thread::scope(|s| {
            let handle = s.spawn(move || engine.run());
            thread::sleep(Duration::from_millis(50));
            stop.stop();
            handle.join().unwrap().unwrap()
        });

        assert!(stop.is_stopping());
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(report.cause, StopCause::StopRequested);
        assert_eq!(log.events(), vec![OutputEvent::Terminal]);
    }

    #[test]
    fn stop_forwards_the_open_round_before_terminal() {
        let config = MergeConfig::new(2).with_initial_timeout(Duration::from_secs(30));
        let (engine, senders, log) = setup(config);
        let coordinator = Arc::clone(&engine.coordinator);
        let stop = engine.stop_handle();
        senders[0].send_record(&rec(0, 5)).unwrap();

        let report = thread::scope(|s| {
            let handle = s.spawn(move || engine.run());
            // S0 holds 5 in the open round; S1 is still inside its long fetch.
            let deadline = Instant::now() + Duration::from_secs(5);
            while coordinator.round_status().arrived_count < 1 {
                assert!(Instant::now() < deadline, "S0 never deposited");
                thread::sleep(Duration::from_millis(5));
            }
            stop.stop();
            handle.join().unwrap().unwrap()
        });

        let events = log.events();
        assert_eq!(events.len(), 2);
        assert_eq!(bodies(&log), vec!["s0-5"]);
        assert_eq!(events[1], OutputEvent::Terminal);
        assert_eq!(report.cause, StopCause::StopRequested);
        assert_eq!(report.sources[0].forwarded, 1);
        assert_eq!(report.dropped(), 0);
        drop(senders);
    }

    /// Input that records, on every fetched record, how far this source's
    /// reads ran ahead of what downstream has already accepted from it.
    struct LeadWatch {
        input: MemoryInput,
        prefix: String,
        received: usize,
        log: OutputLog,
        max_lead: Arc<AtomicUsize>,
    }

    impl LeadWatch {
        fn observe(&mut self, fetched: &Fetched) {
            let Fetched::Data(delivery) = fetched else {
                return;
            };
            if !matches!(RecordCodec::decode(&delivery.frame), Ok(Frame::Record(_))) {
                return;
            }
            self.received += 1;
            let forwarded = self
                .log
                .records()
                .iter()
                .filter(|r| r.body.starts_with(self.prefix.as_bytes()))
                .count();
            self.max_lead
                .fetch_max(self.received - forwarded, Ordering::SeqCst);
        }
    }

    impl InputChannel for LeadWatch {
        fn fetch(&mut self, timeout: Duration) -> TransportResult<Fetched> {
            let fetched = self.input.fetch(timeout)?;
            self.observe(&fetched);
            Ok(fetched)
        }

        fn fetch_nonblocking(&mut self) -> TransportResult<Fetched> {
            let fetched = self.input.fetch_nonblocking()?;
            self.observe(&fetched);
            Ok(fetched)
        }

        fn current_schema(&self) -> Option<Schema> {
            self.input.current_schema()
        }
    }

    #[test]
    fn slow_downstream_throttles_every_source() {
        let delay = Duration::from_millis(20);
        let (output, log) = MemoryOutput::new();
        let max_lead = Arc::new(AtomicUsize::new(0));
        let mut senders = Vec::new();
        let mut inputs: Vec<Box<dyn InputChannel>> = Vec::new();
        for source in 0..2 {
            let (tx, rx) = channel();
            inputs.push(Box::new(LeadWatch {
                input: rx,
                prefix: format!("s{source}-"),
                received: 0,
                log: log.clone(),
                max_lead: Arc::clone(&max_lead),
            }));
            senders.push(tx);
        }
        feed(&senders[0], 0, &[1, 3, 5, 7]);
        feed(&senders[1], 1, &[2, 4, 6, 8]);
        let engine =
            MergeEngine::new(patient(2), inputs, Box::new(output.with_delay(delay))).unwrap();
        let start = Instant::now();

        let report = engine.run().unwrap();

        assert_eq!(report.total_forwarded(), 8);
        assert_eq!(max_lead.load(Ordering::SeqCst), 1);
        // Sends are serialized, so the merge takes at least one delay per record.
        assert!(start.elapsed() >= delay * 8);
        assert_eq!(
            bodies(&log),
            vec!["s0-1", "s1-2", "s0-3", "s1-4", "s0-5", "s1-6", "s0-7", "s1-8"]
        );
    }

    #[test]
    fn suppressed_terminal_is_never_sent() {
        let (engine, senders, log) = setup(patient(1).with_suppress_terminal(true));
        feed(&senders[0], 0, &[1, 2]);
        let report = engine.run().unwrap();
        assert_eq!(log.records().len(), 2);
        assert_eq!(log.terminal_count(), 0);
        assert!(!report.terminal_sent);
    }

    #[test]
    fn downstream_failure_aborts_without_terminal() {
        let (tx0, rx0) = channel();
        let (tx1, rx1) = channel();
        feed(&tx0, 0, &[1, 3, 5]);
        feed(&tx1, 1, &[2, 4, 6]);
        let (output, log) = MemoryOutput::new();
        let inputs: Vec<Box<dyn InputChannel>> = vec![Box::new(rx0), Box::new(rx1)];
        let engine =
            MergeEngine::new(patient(2), inputs, Box::new(output.failing_after(2))).unwrap();

        let err = engine.run().unwrap_err();

        assert!(matches!(err, EngineError::Aborted(_)));
        assert_eq!(bodies(&log), vec!["s0-1", "s1-2"]);
        assert_eq!(log.terminal_count(), 0);
    }

    #[test]
    fn schema_union_precedes_first_record() {
        let (engine, senders, log) = setup(patient(2));
        senders[0].set_schema(Schema::parse("time TIME_FIRST").unwrap());
        feed(&senders[0], 0, &[1]);
        senders[1].set_schema(Schema::parse("time TIME_FIRST,uint32 PACKETS").unwrap());
        feed(&senders[1], 1, &[2]);

        let report = engine.run().unwrap();

        let events = log.events();
        let union = Schema::parse("time TIME_FIRST,uint32 PACKETS").unwrap();
        assert_eq!(events[0], OutputEvent::Schema(union.clone()));
        let schema_events = events
            .iter()
            .filter(|e| matches!(e, OutputEvent::Schema(_)))
            .count();
        assert_eq!(schema_events, 1);
        assert_eq!(bodies(&log), vec!["s0-1", "s1-2"]);
        assert_eq!(report.output_schema, Some(union));
    }

    #[test]
    fn conflicting_schema_ends_only_that_source() {
        let config = patient(2).with_output_schema(Schema::parse("uint32 PACKETS").unwrap());
        let (engine, senders, log) = setup(config);
        feed(&senders[0], 0, &[1, 2]);
        senders[1].set_schema(Schema::parse("uint64 PACKETS").unwrap());
        feed(&senders[1], 1, &[3]);

        let report = engine.run().unwrap();

        assert_eq!(bodies(&log), vec!["s0-1", "s0-2"]);
        assert_eq!(report.sources[1].forwarded, 0);
        assert_eq!(log.terminal_count(), 1);
    }

    #[test]
    fn malformed_frames_are_counted_and_skipped() {
        let (engine, senders, log) = setup(patient(1));
        senders[0].send_frame(vec![9u8; 7]).unwrap();
        feed(&senders[0], 0, &[4]);
        let report = engine.run().unwrap();
        assert_eq!(bodies(&log), vec!["s0-4"]);
        assert_eq!(report.total_malformed(), 1);
    }

    #[test]
    fn transport_error_ends_one_source() {
        let (tx, rx) = channel();
        feed(&tx, 0, &[1, 2, 3]);
        let (output, log) = MemoryOutput::new();
        let inputs: Vec<Box<dyn InputChannel>> = vec![Box::new(rx), Box::new(BrokenInput)];
        let engine = MergeEngine::new(patient(2), inputs, Box::new(output)).unwrap();

        let report = engine.run().unwrap();

        assert_eq!(bodies(&log), vec!["s0-1", "s0-2", "s0-3"]);
        assert_eq!(report.sources[1].received, 0);
        assert_eq!(report.sources[1].state, SourceState::Ended);
        assert_eq!(log.terminal_count(), 1);
    }

    #[test]
    fn interleave_forwards_without_rendezvous() {
        let (engine, senders, log) =
            setup(patient(2).with_mode(crate::MergeMode::Interleave));
        feed(&senders[0], 0, &[30, 40]);
        feed(&senders[1], 1, &[10, 20]);

        let report = engine.run().unwrap();

        let out = bodies(&log);
        assert_eq!(out.len(), 4);
        let from = |prefix: &str| -> Vec<String> {
            out.iter().filter(|b| b.starts_with(prefix)).cloned().collect()
        };
        assert_eq!(from("s0-"), vec!["s0-30", "s0-40"]);
        assert_eq!(from("s1-"), vec!["s1-10", "s1-20"]);
        assert_eq!(report.rounds, 0);
        assert_eq!(log.terminal_count(), 1);
    }

    #[test]
    fn source_count_must_match_inputs() {
        let (_tx, rx) = channel();
        let (output, _log) = MemoryOutput::new();
        let inputs: Vec<Box<dyn InputChannel>> = vec![Box::new(rx)];
        let err = MergeEngine::new(MergeConfig::new(2), inputs, Box::new(output))
            .err()
            .unwrap();
        assert!(matches!(
            err,
            EngineError::SourceCount {
                expected: 2,
                actual: 1
            }
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn output_is_sorted_and_keeps_source_order(
            streams in prop::collection::vec(prop::collection::vec(0u64..1_000, 0..12), 1..4)
        ) {
            let streams: Vec<Vec<u64>> = streams
                .into_iter()
                .map(|mut s| { s.sort_unstable(); s })
                .collect();
            let (engine, senders, log) = setup(patient(streams.len()));
            for (i, stamps) in streams.iter().enumerate() {
                feed(&senders[i], i, stamps);
            }

            engine.run().unwrap();

            let out = log.records();
            let stamps: Vec<u64> = out.iter().map(|r| r.time_last.raw()).collect();
            prop_assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
            prop_assert_eq!(out.len(), streams.iter().map(Vec::len).sum::<usize>());
            for (i, expected) in streams.iter().enumerate() {
                let prefix = format!("s{i}-");
                let got: Vec<u64> = out
                    .iter()
                    .filter(|r| r.body.starts_with(prefix.as_bytes()))
                    .map(|r| r.time_last.raw())
                    .collect();
                prop_assert_eq!(&got, expected);
            }
            prop_assert_eq!(log.terminal_count(), 1);
        }
    }
}

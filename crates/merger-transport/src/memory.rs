use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use merger_types::{Frame, Record, RecordCodec, Schema};
use tracing::debug;

use crate::error::{TransportError, TransportResult};
use crate::traits::{Delivery, Fetched, InputChannel, OutputChannel};

struct QueueState {
    frames: VecDeque<Delivery>,
    schema: Option<Schema>,
    /// A schema was set and no frame has carried the change flag yet.
    schema_pending: bool,
    closed: bool,
}

struct Queue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

/// Create a connected in-memory sender/input pair.
pub fn channel() -> (MemorySender, MemoryInput) {
    let queue = Arc::new(Queue {
        state: Mutex::new(QueueState {
            frames: VecDeque::new(),
            schema: None,
            schema_pending: false,
            closed: false,
        }),
        ready: Condvar::new(),
    });
    (
        MemorySender {
            queue: Arc::clone(&queue),
        },
        MemoryInput { queue },
    )
}

/// Producing side of an in-memory input.
///
/// Dropping the sender closes the channel: the input drains what is queued
/// and then reports [`Fetched::Terminated`].
pub struct MemorySender {
    queue: Arc<Queue>,
}

impl MemorySender {
    /// Queue a raw frame.
    pub fn send_frame(&self, frame: impl Into<Bytes>) -> TransportResult<()> {
        let mut state = self.queue.state.lock().expect("queue lock poisoned");
        if state.closed {
            return Err(TransportError::Disconnected);
        }
        let schema_changed = std::mem::take(&mut state.schema_pending);
        state.frames.push_back(Delivery {
            frame: frame.into(),
            schema_changed,
        });
        self.queue.ready.notify_one();
        Ok(())
    }

    /// Encode and queue a record.
    pub fn send_record(&self, record: &Record) -> TransportResult<()> {
        self.send_frame(RecordCodec::encode(record))
    }

    /// Queue the end-of-stream marker.
    pub fn send_terminal(&self) -> TransportResult<()> {
        self.send_frame(RecordCodec::terminal())
    }

    /// Negotiate a new schema. The next queued frame carries the change flag.
    pub fn set_schema(&self, schema: Schema) {
        let mut state = self.queue.state.lock().expect("queue lock poisoned");
        state.schema = Some(schema);
        state.schema_pending = true;
    }

    /// Close the channel without sending a terminal marker.
    pub fn close(&self) {
        let mut state = self.queue.state.lock().expect("queue lock poisoned");
        state.closed = true;
        self.queue.ready.notify_all();
    }
}

impl Drop for MemorySender {
    fn drop(&mut self) {
        self.close();
    }
}

/// Receiving side of an in-memory input.
pub struct MemoryInput {
    queue: Arc<Queue>,
}

impl MemoryInput {
    fn take(state: &mut QueueState) -> Option<Fetched> {
        if let Some(delivery) = state.frames.pop_front() {
            return Some(Fetched::Data(delivery));
        }
        if state.closed {
            return Some(Fetched::Terminated);
        }
        None
    }
}

impl InputChannel for MemoryInput {
    fn fetch(&mut self, timeout: Duration) -> TransportResult<Fetched> {
        let deadline = Instant::now() + timeout;
        let mut state = self.queue.state.lock().expect("queue lock poisoned");
        loop {
            if let Some(fetched) = Self::take(&mut state) {
                return Ok(fetched);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Fetched::Empty);
            }
            let (guard, _) = self
                .queue
                .ready
                .wait_timeout(state, deadline - now)
                .expect("queue lock poisoned");
            state = guard;
        }
    }

    fn fetch_nonblocking(&mut self) -> TransportResult<Fetched> {
        let mut state = self.queue.state.lock().expect("queue lock poisoned");
        Ok(Self::take(&mut state).unwrap_or(Fetched::Empty))
    }

    fn current_schema(&self) -> Option<Schema> {
        self.queue
            .state
            .lock()
            .expect("queue lock poisoned")
            .schema
            .clone()
    }
}

/// Everything a [`MemoryOutput`] was asked to emit, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutputEvent {
    Frame(Bytes),
    Schema(Schema),
    Terminal,
}

#[derive(Default)]
struct LogInner {
    events: Mutex<Vec<OutputEvent>>,
    changed: Condvar,
}

/// Shared, inspectable view of a [`MemoryOutput`]'s emissions.
#[derive(Clone, Default)]
pub struct OutputLog {
    inner: Arc<LogInner>,
}

impl OutputLog {
    fn push(&self, event: OutputEvent) {
        self.inner
            .events
            .lock()
            .expect("output log lock poisoned")
            .push(event);
        self.inner.changed.notify_all();
    }

    /// Snapshot of all events so far.
    pub fn events(&self) -> Vec<OutputEvent> {
        self.inner
            .events
            .lock()
            .expect("output log lock poisoned")
            .clone()
    }

    /// Decoded records, skipping schema and terminal events.
    pub fn records(&self) -> Vec<Record> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                OutputEvent::Frame(frame) => match RecordCodec::decode(&frame) {
                    Ok(Frame::Record(record)) => Some(record),
                    _ => None,
                },
                _ => None,
            })
            .collect()
    }

    /// Number of terminal markers emitted.
    pub fn terminal_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, OutputEvent::Terminal))
            .count()
    }

    /// Block until `predicate` holds for the event list or `timeout` elapses.
    /// Returns whether the predicate held.
    pub fn wait_until<F>(&self, timeout: Duration, mut predicate: F) -> bool
    where
        F: FnMut(&[OutputEvent]) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut events = self.inner.events.lock().expect("output log lock poisoned");
        loop {
            if predicate(events.as_slice()) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .inner
                .changed
                .wait_timeout(events, deadline - now)
                .expect("output log lock poisoned");
            events = guard;
        }
    }

    /// Block until at least `count` record frames were emitted.
    pub fn wait_for_records(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |events| {
            events
                .iter()
                .filter(|e| matches!(e, OutputEvent::Frame(_)))
                .count()
                >= count
        })
    }
}

/// In-memory downstream recording every emission into an [`OutputLog`].
pub struct MemoryOutput {
    log: OutputLog,
    /// Fail every send once this many frames were accepted.
    fail_after: Option<usize>,
    /// Artificial per-send latency, to exercise backpressure.
    delay: Duration,
    accepted: usize,
}

impl MemoryOutput {
    pub fn new() -> (Self, OutputLog) {
        let log = OutputLog::default();
        (
            Self {
                log: log.clone(),
                fail_after: None,
                delay: Duration::ZERO,
                accepted: 0,
            },
            log,
        )
    }

    /// Reject every frame after the first `frames` frames.
    pub fn failing_after(mut self, frames: usize) -> Self {
        self.fail_after = Some(frames);
        self
    }

    /// Sleep for `delay` inside every send.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl OutputChannel for MemoryOutput {
    fn send(&mut self, frame: &Bytes) -> TransportResult<()> {
        if matches!(self.fail_after, Some(limit) if self.accepted >= limit) {
            return Err(TransportError::Rejected(format!(
                "output closed after {} frames",
                self.accepted
            )));
        }
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.accepted += 1;
        debug!(len = frame.len(), accepted = self.accepted, "frame emitted");
        self.log.push(OutputEvent::Frame(frame.clone()));
        Ok(())
    }

    fn propagate_schema(&mut self, schema: &Schema) -> TransportResult<()> {
        self.log.push(OutputEvent::Schema(schema.clone()));
        Ok(())
    }

    fn send_terminal(&mut self) -> TransportResult<()> {
        self.log.push(OutputEvent::Terminal);
        Ok(())
    }
}

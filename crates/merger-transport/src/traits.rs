use std::time::Duration;

use bytes::Bytes;
use merger_types::{RecordCodec, Schema};

use crate::error::TransportResult;

/// One frame received from an input, with the schema-change flag the
/// transport attached to it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub frame: Bytes,
    /// Set when the sender negotiated a new schema before this frame. The
    /// new schema is available from [`InputChannel::current_schema`].
    pub schema_changed: bool,
}

impl Delivery {
    pub fn new(frame: impl Into<Bytes>) -> Self {
        Self {
            frame: frame.into(),
            schema_changed: false,
        }
    }
}

/// Outcome of a fetch attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fetched {
    /// A frame arrived. It may still be the end-of-stream marker.
    Data(Delivery),
    /// Nothing arrived: the timeout elapsed, or a non-blocking poll found
    /// the channel empty.
    Empty,
    /// The transport was shut down and will never deliver again.
    Terminated,
}

/// Receiving side of one input source.
///
/// Implementations must satisfy:
/// - Frames are delivered in the order the sender produced them.
/// - `fetch` returns no later than roughly `timeout` after it was called.
/// - Once `Terminated` is returned, every later call returns `Terminated`.
pub trait InputChannel: Send {
    /// Wait up to `timeout` for the next frame.
    fn fetch(&mut self, timeout: Duration) -> TransportResult<Fetched>;

    /// Take the next frame if one is immediately available.
    fn fetch_nonblocking(&mut self) -> TransportResult<Fetched>;

    /// The schema most recently negotiated on this input, if any.
    fn current_schema(&self) -> Option<Schema>;
}

/// The single downstream of a merger.
pub trait OutputChannel: Send {
    /// Send one frame, blocking while downstream cannot accept it.
    fn send(&mut self, frame: &Bytes) -> TransportResult<()>;

    /// Announce the schema of the frames that follow.
    fn propagate_schema(&mut self, schema: &Schema) -> TransportResult<()>;

    /// Send the end-of-stream marker.
    ///
    /// Default implementation sends [`RecordCodec::terminal`] as a frame.
    fn send_terminal(&mut self) -> TransportResult<()> {
        self.send(&RecordCodec::terminal())
    }
}

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{TypeError, TypeResult};
use crate::record::Record;
use crate::temporal::Timestamp;

/// Size of the fixed record header: `[8 bytes time_first LE][8 bytes time_last LE]`.
pub const HEADER_LEN: usize = 16;

/// The end-of-stream marker. Any frame of at most this length is terminal;
/// zero-length frames are not deliverable on every transport, so a single
/// zero byte is what gets sent.
pub const TERMINAL_FRAME: [u8; 1] = [0];

/// A decoded frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Record(Record),
    Terminal,
}

/// Codec between [`Record`]s and transport frames.
///
/// Layout: `[time_first: u64 LE][time_last: u64 LE][body...]`.
pub struct RecordCodec;

impl RecordCodec {
    /// Encode a record into a frame.
    pub fn encode(record: &Record) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + record.body.len());
        buf.put_u64_le(record.time_first.raw());
        buf.put_u64_le(record.time_last.raw());
        buf.extend_from_slice(&record.body);
        buf.freeze()
    }

    /// Decode a frame. The record body shares the frame's buffer.
    ///
    /// Frames of length 0 or 1 decode to [`Frame::Terminal`]. Anything else
    /// shorter than [`HEADER_LEN`] is malformed.
    pub fn decode(frame: &Bytes) -> TypeResult<Frame> {
        if Self::is_terminal(frame) {
            return Ok(Frame::Terminal);
        }
        if frame.len() < HEADER_LEN {
            return Err(TypeError::Truncated {
                expected: HEADER_LEN,
                actual: frame.len(),
            });
        }
        let time_first = read_u64_le(&frame[0..8]);
        let time_last = read_u64_le(&frame[8..16]);
        Ok(Frame::Record(Record {
            time_first: Timestamp::from_raw(time_first),
            time_last: Timestamp::from_raw(time_last),
            body: frame.slice(HEADER_LEN..),
        }))
    }

    /// Returns `true` if the frame is the end-of-stream marker.
    pub fn is_terminal(frame: &[u8]) -> bool {
        frame.len() <= TERMINAL_FRAME.len()
    }

    /// The terminal marker as a frame.
    pub fn terminal() -> Bytes {
        Bytes::from_static(&TERMINAL_FRAME)
    }
}

fn read_u64_le(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    u64::from_le_bytes(raw)
}

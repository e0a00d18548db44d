//! JSON-lines adapters between files and the in-memory transport.
//!
//! ```text
//! {"schema":"time TIME_FIRST,time TIME_LAST"}
//! {"time_first":4294967296,"time_last":4294967296,"body":"cafe"}
//! {"end_of_stream":true}
//! ```

use std::io::{self, BufRead, BufReader, Read, Write};
use std::thread::{self, JoinHandle};

use anyhow::Context;
use bytes::Bytes;
use merger_transport::{MemorySender, OutputChannel, TransportError, TransportResult};
use merger_types::{Frame, Record, RecordCodec, Schema, Timestamp};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// A record as written on one line. Timestamps are raw 32.32 fixed point.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordLine {
    pub time_first: u64,
    pub time_last: u64,
    /// Hex-encoded payload.
    #[serde(default)]
    pub body: String,
}

impl RecordLine {
    pub fn into_record(self) -> anyhow::Result<Record> {
        let body = hex::decode(&self.body).context("record body is not valid hex")?;
        Ok(Record::new(
            Timestamp::from_raw(self.time_first),
            Timestamp::from_raw(self.time_last),
            body,
        ))
    }
}

impl From<&Record> for RecordLine {
    fn from(record: &Record) -> Self {
        Self {
            time_first: record.time_first.raw(),
            time_last: record.time_last.raw(),
            body: hex::encode(&record.body),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Line {
    Schema { schema: String },
    EndOfStream { end_of_stream: bool },
    Record(RecordLine),
}

impl Line {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        serde_json::from_str(text).context("unrecognized line")
    }
}

/// What one feeder pushed into its source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FeedSummary {
    pub records: u64,
    pub skipped: u64,
}

/// Push every line of `reader` into `sender`, then the terminal marker.
///
/// Lines that do not parse are logged and skipped. An explicit
/// `{"end_of_stream":true}` line ends the feed early.
pub fn feed_lines<R: BufRead>(reader: R, sender: &MemorySender) -> anyhow::Result<FeedSummary> {
    let mut summary = FeedSummary::default();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        match Line::parse(text) {
            Ok(Line::Schema { schema }) => match Schema::parse(&schema) {
                Ok(schema) => sender.set_schema(schema),
                Err(err) => {
                    warn!(line = index + 1, error = %err, "invalid schema line skipped");
                    summary.skipped += 1;
                }
            },
            Ok(Line::Record(line)) => match line.into_record() {
                Ok(record) => {
                    sender.send_record(&record)?;
                    summary.records += 1;
                }
                Err(err) => {
                    warn!(line = index + 1, error = %err, "invalid record line skipped");
                    summary.skipped += 1;
                }
            },
            Ok(Line::EndOfStream { end_of_stream: true }) => {
                sender.send_terminal()?;
                return Ok(summary);
            }
            Ok(Line::EndOfStream { end_of_stream: false }) => {}
            Err(err) => {
                warn!(line = index + 1, error = %err, "line skipped");
                summary.skipped += 1;
            }
        }
    }
    sender.send_terminal()?;
    Ok(summary)
}

/// Feed `reader` into `sender` on a dedicated thread. The sender is dropped,
/// closing the source, when the thread finishes.
pub fn spawn_feeder<R>(source: usize, reader: R, sender: MemorySender) -> io::Result<JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    thread::Builder::new()
        .name(format!("feeder-{source}"))
        .spawn(move || match feed_lines(BufReader::new(reader), &sender) {
            Ok(summary) => debug!(
                source,
                records = summary.records,
                skipped = summary.skipped,
                "input fed"
            ),
            Err(err) => warn!(source, error = %err, "input feed failed"),
        })
}

/// Downstream writing one JSON object per line, flushed line by line.
pub struct JsonLinesOutput<W> {
    writer: W,
    lines: u64,
}

impl<W: Write + Send> JsonLinesOutput<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, lines: 0 }
    }

    pub fn lines(&self) -> u64 {
        self.lines
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write_line(&mut self, line: &Line) -> TransportResult<()> {
        serde_json::to_writer(&mut self.writer, line).map_err(io::Error::from)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        self.lines += 1;
        Ok(())
    }
}

impl<W: Write + Send> OutputChannel for JsonLinesOutput<W> {
    fn send(&mut self, frame: &Bytes) -> TransportResult<()> {
        match RecordCodec::decode(frame) {
            Ok(Frame::Record(record)) => self.write_line(&Line::Record(RecordLine::from(&record))),
            Ok(Frame::Terminal) => self.send_terminal(),
            Err(err) => Err(TransportError::Rejected(err.to_string())),
        }
    }

    fn propagate_schema(&mut self, schema: &Schema) -> TransportResult<()> {
        self.write_line(&Line::Schema {
            schema: schema.to_spec_string(),
        })
    }

    fn send_terminal(&mut self) -> TransportResult<()> {
        self.write_line(&Line::EndOfStream {
            end_of_stream: true,
        })
    }
}

//! Foundation types for the merger.
//!
//! Every other merger crate depends on `merger-types`. The engine itself is
//! schema-agnostic: the only thing it needs from a record is an orderable
//! timestamp, which this crate models together with the frame encoding used
//! to move records across transports.
//!
//! # Key Types
//!
//! - [`Timestamp`]: 32.32 fixed-point seconds, totally ordered
//! - [`SourceId`]: Stable index of one input source
//! - [`Record`]: A timestamped record with an opaque body
//! - [`TimestampSelector`]: Which of a record's timestamps drives ordering
//! - [`Schema`]: Field-list description of a source's records
//! - [`RecordCodec`]: Frame encoding, including the end-of-stream marker

pub mod codec;
pub mod error;
pub mod record;
pub mod schema;
pub mod source;
pub mod temporal;

pub use codec::{Frame, RecordCodec, HEADER_LEN, TERMINAL_FRAME};
pub use error::{TypeError, TypeResult};
pub use record::{Record, TimestampSelector};
pub use schema::{FieldSpec, FieldType, Schema};
pub use source::{SourceId, MAX_SOURCES};
pub use temporal::Timestamp;

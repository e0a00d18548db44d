use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::temporal::Timestamp;

/// A timestamped record travelling through the merger.
///
/// The body is opaque to the engine. Records are cheap to clone: the body is
/// reference-counted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Start of the interval the record describes.
    pub time_first: Timestamp,
    /// End of the interval the record describes.
    pub time_last: Timestamp,
    /// Opaque payload.
    pub body: Bytes,
}

impl Record {
    pub fn new(time_first: Timestamp, time_last: Timestamp, body: impl Into<Bytes>) -> Self {
        Self {
            time_first,
            time_last,
            body: body.into(),
        }
    }

    /// A record whose first and last timestamps coincide.
    pub fn instant(at: Timestamp, body: impl Into<Bytes>) -> Self {
        Self::new(at, at, body)
    }
}

/// Which of a record's timestamps drives the merge order.
///
/// Fixed for the lifetime of a merger.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampSelector {
    First,
    #[default]
    Last,
}

impl TimestampSelector {
    /// Extract the ordering timestamp from a record.
    pub fn select(&self, record: &Record) -> Timestamp {
        match self {
            Self::First => record.time_first,
            Self::Last => record.time_last,
        }
    }
}

impl fmt::Display for TimestampSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::First => f.write_str("first"),
            Self::Last => f.write_str("last"),
        }
    }
}

impl FromStr for TimestampSelector {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first" => Ok(Self::First),
            "last" => Ok(Self::Last),
            other => Err(TypeError::InvalidSelector(other.to_string())),
        }
    }
}

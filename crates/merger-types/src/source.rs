use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{TypeError, TypeResult};

/// Upper bound on the number of input sources a merger accepts.
pub const MAX_SOURCES: usize = 32;

/// Stable identifier of one input source, `0..N-1`.
///
/// Source ids double as the deterministic tie-breaker when two sources
/// deposit equal timestamps: the lower id wins.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(u16);

impl SourceId {
    /// Create a source id from an input index, checking it against [`MAX_SOURCES`].
    pub fn new(index: usize) -> TypeResult<Self> {
        if index >= MAX_SOURCES {
            return Err(TypeError::SourceOutOfRange {
                index,
                max: MAX_SOURCES,
            });
        }
        Ok(Self(index as u16))
    }

    /// The index of this source, usable for slot lookups.
    pub const fn index(&self) -> usize {
        self.0 as usize
    }

    /// All ids for a merger with `count` sources.
    pub fn range(count: usize) -> impl Iterator<Item = SourceId> {
        (0..count.min(MAX_SOURCES)).map(|i| SourceId(i as u16))
    }
}

impl fmt::Debug for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SourceId({})", self.0)
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}", self.0)
    }
}

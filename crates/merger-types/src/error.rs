use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    #[error("unknown field type: {0}")]
    UnknownFieldType(String),

    #[error("conflicting types for field {name}: {existing} vs {incoming}")]
    FieldConflict {
        name: String,
        existing: String,
        incoming: String,
    },

    #[error("timestamp {secs}s + {millis}ms exceeds the 32-bit seconds range")]
    TimestampOutOfRange { secs: u32, millis: u32 },

    #[error("invalid timestamp selector: {0} (expected \"first\" or \"last\")")]
    InvalidSelector(String),

    #[error("source index {index} out of range (max {max})")]
    SourceOutOfRange { index: usize, max: usize },
}

/// Convenience alias used throughout the types crate.
pub type TypeResult<T> = std::result::Result<T, TypeError>;

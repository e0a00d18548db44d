use thiserror::Error;

/// Errors produced by the merge engine.
///
/// Source-local failures never surface here: they end the affected source
/// and are visible only through its liveness state and counters.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The number of inputs does not match the configured source count.
    #[error("expected {expected} inputs, got {actual}")]
    SourceCount { expected: usize, actual: usize },

    /// Sending downstream failed; the merge was aborted.
    #[error("downstream failure: {0}")]
    Downstream(#[from] merger_transport::TransportError),

    /// A send was attempted after the downstream already failed.
    #[error("downstream is closed")]
    DownstreamClosed,

    /// The merge stopped early because downstream failed.
    #[error("merge aborted: {0}")]
    Aborted(String),

    #[error("type error: {0}")]
    Types(#[from] merger_types::TypeError),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config serialization error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    /// A reader thread could not be started.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the engine crate.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

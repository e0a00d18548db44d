use std::fmt;
use std::time::Duration;

use merger_types::{Schema, TimestampSelector, MAX_SOURCES};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// How records from different sources are combined.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeMode {
    /// Rendezvous per record; output ordered by timestamp.
    #[default]
    TimeAware,
    /// Forward each record as soon as it arrives; only per-source order holds.
    Interleave,
}

impl fmt::Display for MergeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimeAware => f.write_str("time-aware"),
            Self::Interleave => f.write_str("interleave"),
        }
    }
}

/// Configuration for a [`MergeEngine`](crate::MergeEngine).
///
/// Durations are written as integer milliseconds in TOML:
///
/// ```toml
/// sources = 3
/// timestamp = "first"
/// initial_timeout_ms = 1000
/// output_schema = "time TIME_FIRST,time TIME_LAST"
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MergeConfig {
    /// Number of input sources.
    pub sources: usize,
    pub mode: MergeMode,
    /// Which record timestamp drives ordering.
    pub timestamp: TimestampSelector,
    /// How long a source may stay silent before it is considered stalled.
    #[serde(rename = "initial_timeout_ms", with = "millis")]
    pub initial_timeout: Duration,
    /// Pause between non-blocking polls of a stalled source.
    ///
    /// This only paces the polling loop. A stalled source still polls
    /// without blocking, stays out of every round, and rejoins on the first
    /// poll that returns data; the pause is cut short by a stop request.
    #[serde(rename = "stall_poll_interval_ms", with = "millis")]
    pub stall_poll_interval: Duration,
    /// Granularity at which timed fetches notice a stop request.
    #[serde(rename = "stop_check_interval_ms", with = "millis")]
    pub stop_check_interval: Duration,
    /// Do not send the terminal marker on shutdown.
    pub suppress_terminal: bool,
    /// Starting output schema; input schemas are merged into it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Schema>,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            sources: 1,
            mode: MergeMode::TimeAware,
            timestamp: TimestampSelector::Last,
            initial_timeout: Duration::from_secs(1),
            stall_poll_interval: Duration::from_millis(100),
            stop_check_interval: Duration::from_millis(50),
            suppress_terminal: false,
            output_schema: None,
        }
    }
}

impl MergeConfig {
    /// Default configuration for `sources` inputs.
    pub fn new(sources: usize) -> Self {
        Self {
            sources,
            ..Default::default()
        }
    }

    pub fn with_mode(mut self, mode: MergeMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_timestamp(mut self, selector: TimestampSelector) -> Self {
        self.timestamp = selector;
        self
    }

    pub fn with_initial_timeout(mut self, timeout: Duration) -> Self {
        self.initial_timeout = timeout;
        self
    }

    pub fn with_stall_poll_interval(mut self, interval: Duration) -> Self {
        self.stall_poll_interval = interval;
        self
    }

    pub fn with_suppress_terminal(mut self, suppress: bool) -> Self {
        self.suppress_terminal = suppress;
        self
    }

    pub fn with_output_schema(mut self, schema: Schema) -> Self {
        self.output_schema = Some(schema);
        self
    }

    /// Check the configuration for values the engine cannot run with.
    pub fn validate(&self) -> EngineResult<()> {
        if self.sources == 0 || self.sources > MAX_SOURCES {
            return Err(EngineError::InvalidConfig(format!(
                "sources must be between 1 and {MAX_SOURCES}, got {}",
                self.sources
            )));
        }
        for (name, value) in [
            ("initial_timeout_ms", self.initial_timeout),
            ("stall_poll_interval_ms", self.stall_poll_interval),
            ("stop_check_interval_ms", self.stop_check_interval),
        ] {
            if value.is_zero() {
                return Err(EngineError::InvalidConfig(format!("{name} must be positive")));
            }
        }
        Ok(())
    }

    pub fn from_toml_str(s: &str) -> EngineResult<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn to_toml_string(&self) -> EngineResult<String> {
        Ok(toml::to_string(self)?)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

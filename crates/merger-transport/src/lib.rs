//! Transport seams for the merger.
//!
//! The engine never talks to a concrete transport. Each input source is an
//! [`InputChannel`] offering timed and non-blocking fetches plus schema
//! negotiation; the single downstream is an [`OutputChannel`]. The
//! [`memory`] module provides in-process implementations used by tests and by
//! adapters that feed the engine from other threads.

pub mod error;
pub mod memory;
pub mod traits;

pub use error::{TransportError, TransportResult};
pub use memory::{channel, MemoryInput, MemoryOutput, MemorySender, OutputEvent, OutputLog};
pub use traits::{Delivery, Fetched, InputChannel, OutputChannel};

use std::sync::{Mutex, MutexGuard};

use merger_transport::{OutputChannel, TransportError};
use merger_types::{Record, RecordCodec, Schema, SourceId};
use tracing::{debug, error, info};

use crate::error::{EngineError, EngineResult};

struct EmitterState {
    output: Box<dyn OutputChannel>,
    /// Union of every schema negotiated so far.
    schema: Option<Schema>,
    /// `schema` changed since it was last propagated.
    schema_dirty: bool,
    /// Reason of the first failed send; set once, never cleared.
    failure: Option<String>,
}

impl EmitterState {
    fn fail(&mut self, err: TransportError) -> EngineError {
        error!(error = %err, "downstream send failed");
        self.failure = Some(err.to_string());
        EngineError::Downstream(err)
    }
}

/// Single gate to the downstream.
///
/// Serializes all sends, so the output sees whole frames only, and keeps
/// the output schema: input schemas are merged into it and the result is
/// propagated ahead of the next record. After the first failed send every
/// further send is refused.
pub struct Emitter {
    state: Mutex<EmitterState>,
}

impl Emitter {
    pub fn new(output: Box<dyn OutputChannel>, schema: Option<Schema>) -> Self {
        let schema_dirty = schema.is_some();
        Self {
            state: Mutex::new(EmitterState {
                output,
                schema,
                schema_dirty,
                failure: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EmitterState> {
        self.state.lock().expect("emitter lock poisoned")
    }

    /// Merge a source's newly negotiated schema into the output schema.
    ///
    /// Returns `true` if the output schema grew. A field whose type
    /// conflicts with the output schema is an error and changes nothing.
    pub fn update_schema(&self, source: SourceId, schema: &Schema) -> EngineResult<bool> {
        let mut state = self.lock();
        let changed = match state.schema.as_mut() {
            Some(current) => current.expand(schema)?,
            None => {
                state.schema = Some(schema.clone());
                true
            }
        };
        if changed {
            state.schema_dirty = true;
            info!(
                source = %source,
                schema = %state.schema.as_ref().map(Schema::to_spec_string).unwrap_or_default(),
                "output schema expanded"
            );
        }
        Ok(changed)
    }

    /// Forward one record, propagating a pending schema change first.
    ///
    /// Blocks for as long as the output blocks.
    pub fn send(&self, source: SourceId, record: &Record) -> EngineResult<()> {
        let mut state = self.lock();
        if state.failure.is_some() {
            return Err(EngineError::DownstreamClosed);
        }
        if state.schema_dirty {
            if let Some(schema) = state.schema.clone() {
                if let Err(err) = state.output.propagate_schema(&schema) {
                    return Err(state.fail(err));
                }
            }
            state.schema_dirty = false;
        }
        let frame = RecordCodec::encode(record);
        if let Err(err) = state.output.send(&frame) {
            return Err(state.fail(err));
        }
        debug!(source = %source, time_first = %record.time_first, time_last = %record.time_last, "record forwarded");
        Ok(())
    }

    /// Send the end-of-stream marker.
    pub fn send_terminal(&self) -> EngineResult<()> {
        let mut state = self.lock();
        if state.failure.is_some() {
            return Err(EngineError::DownstreamClosed);
        }
        if let Err(err) = state.output.send_terminal() {
            return Err(state.fail(err));
        }
        Ok(())
    }

    pub fn output_schema(&self) -> Option<Schema> {
        self.lock().schema.clone()
    }

    /// Reason of the first failed send, if any.
    pub fn failure(&self) -> Option<String> {
        self.lock().failure.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use merger_transport::{MemoryOutput, OutputEvent};
    use merger_types::Timestamp;

    fn id(i: usize) -> SourceId {
        SourceId::new(i).unwrap()
    }

    fn record(raw: u64) -> Record {
        Record::instant(Timestamp::from_raw(raw), format!("r{raw}"))
    }

    fn schema(spec: &str) -> Schema {
        Schema::parse(spec).unwrap()
    }

    #[test]
    fn forwards_encoded_records() {
        let (out, log) = MemoryOutput::new();
        let emitter = Emitter::new(Box::new(out), None);
        emitter.send(id(0), &record(1)).unwrap();
        emitter.send(id(1), &record(2)).unwrap();
        assert_eq!(log.records(), vec![record(1), record(2)]);
    }

    #[test]
    fn initial_schema_precedes_first_record() {
        let (out, log) = MemoryOutput::new();
        let emitter = Emitter::new(Box::new(out), Some(schema("time TIME_LAST")));
        emitter.send(id(0), &record(1)).unwrap();
        let events = log.events();
        assert_eq!(events[0], OutputEvent::Schema(schema("time TIME_LAST")));
        assert!(matches!(events[1], OutputEvent::Frame(_)));
    }

    #[test]
    fn schema_change_propagated_once_before_next_record() {
        let (out, log) = MemoryOutput::new();
        let emitter = Emitter::new(Box::new(out), Some(schema("time TIME_FIRST")));
        emitter.send(id(0), &record(1)).unwrap();

        assert!(emitter.update_schema(id(1), &schema("time TIME_FIRST,uint32 PACKETS")).unwrap());
        assert!(!emitter.update_schema(id(0), &schema("uint32 PACKETS")).unwrap());
        emitter.send(id(1), &record(2)).unwrap();
        emitter.send(id(0), &record(3)).unwrap();

        let schemas: Vec<_> = log
            .events()
            .into_iter()
            .filter_map(|e| match e {
                OutputEvent::Schema(s) => Some(s.to_spec_string()),
                _ => None,
            })
            .collect();
        assert_eq!(schemas, vec!["time TIME_FIRST", "time TIME_FIRST,uint32 PACKETS"]);
        assert!(matches!(log.events()[2], OutputEvent::Schema(_)));
    }

    #[test]
    fn conflicting_schema_rejected() {
        let (out, _log) = MemoryOutput::new();
        let emitter = Emitter::new(Box::new(out), Some(schema("uint32 PACKETS")));
        assert!(matches!(
            emitter.update_schema(id(0), &schema("uint64 PACKETS")),
            Err(EngineError::Types(_))
        ));
        assert_eq!(emitter.output_schema(), Some(schema("uint32 PACKETS")));
    }

    #[test]
    fn failure_closes_emitter() {
        let (out, log) = MemoryOutput::new();
        let emitter = Emitter::new(Box::new(out.failing_after(1)), None);
        emitter.send(id(0), &record(1)).unwrap();
        assert!(matches!(emitter.send(id(0), &record(2)), Err(EngineError::Downstream(_))));
        assert!(matches!(emitter.send(id(0), &record(3)), Err(EngineError::DownstreamClosed)));
        assert!(matches!(emitter.send_terminal(), Err(EngineError::DownstreamClosed)));
        assert!(emitter.failure().is_some());
        assert_eq!(log.records().len(), 1);
        assert_eq!(log.terminal_count(), 0);
    }
}

//! Bulk ingest of newline-delimited JSON event records.
//!
//! Records have the shape `{"id": ..., "timestamp": ..., "data": {...}}`
//! (an optional `"table"` must match the loader's table). Records buffer
//! until the flush threshold is reached, then land in a single multi-shard
//! write; `finish` flushes the remainder and reports the total written.
//! In-flight buffers are not visible to queries until they flush.

use std::collections::BTreeMap;
use std::io::Read;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value as Json;

use ethogram_core::error::{EthogramError, Result};
use ethogram_core::event::Event;
use ethogram_core::value::Value;
use ethogram_db::Db;

pub const DEFAULT_FLUSH_THRESHOLD: usize = 1000;

#[derive(Deserialize)]
struct StreamRecord {
    id: String,
    #[serde(default)]
    table: Option<String>,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    data: serde_json::Map<String, Json>,
}

pub struct StreamLoader<'a> {
    db: &'a Db,
    table: String,
    flush_threshold: usize,
    buffer: BTreeMap<String, Vec<Event>>,
    buffered: usize,
    events_written: usize,
}

impl<'a> StreamLoader<'a> {
    pub fn new(db: &'a Db, table: &str, flush_threshold: usize) -> StreamLoader<'a> {
        StreamLoader {
            db,
            table: table.to_string(),
            flush_threshold: flush_threshold.max(1),
            buffer: BTreeMap::new(),
            buffered: 0,
            events_written: 0,
        }
    }

    /// Events committed so far (buffered records are not yet counted).
    pub fn events_written(&self) -> usize {
        self.events_written
    }

    /// Buffer one event, flushing when the threshold is reached.
    pub fn push(&mut self, id: &str, event: Event) -> Result<()> {
        self.buffer.entry(id.to_string()).or_default().push(event);
        self.buffered += 1;
        if self.buffered >= self.flush_threshold {
            self.flush()?;
        }
        Ok(())
    }

    /// Write out everything buffered as one multi-shard insert.
    pub fn flush(&mut self) -> Result<()> {
        if self.buffered == 0 {
            return Ok(());
        }
        let objects = std::mem::take(&mut self.buffer);
        self.buffered = 0;

        let result = self.db.insert_objects(&self.table, objects);
        self.events_written += result.events_written;
        match result.error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Consume a newline-delimited JSON stream, buffering and flushing as
    /// records arrive.
    pub fn load<R: Read>(&mut self, reader: R) -> Result<()> {
        let stream = serde_json::Deserializer::from_reader(reader).into_iter::<StreamRecord>();
        for record in stream {
            let record = record
                .map_err(|e| EthogramError::Codec(format!("malformed stream record: {e}")))?;
            if let Some(table) = &record.table {
                if table != &self.table {
                    return Err(EthogramError::Query(format!(
                        "stream record addresses table {table:?}, loader is bound to {:?}",
                        self.table
                    )));
                }
            }
            let mut event = Event::new(record.timestamp);
            for (name, value) in &record.data {
                if let Some(value) = Value::from_json(value) {
                    event.data.insert(name.clone(), value);
                }
            }
            self.push(&record.id, event)?;
        }
        Ok(())
    }

    /// Flush the remainder and report the total number of events written.
    pub fn finish(mut self) -> Result<usize> {
        self.flush()?;
        tracing::debug!(table = %self.table, events = self.events_written, "stream load finished");
        Ok(self.events_written)
    }
}

/// One-shot convenience: stream a whole reader into a table.
pub fn load_stream<R: Read>(
    db: &Db,
    table: &str,
    reader: R,
    flush_threshold: usize,
) -> Result<usize> {
    let mut loader = StreamLoader::new(db, table, flush_threshold);
    loader.load(reader)?;
    loader.finish()
}

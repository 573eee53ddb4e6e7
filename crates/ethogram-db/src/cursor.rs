use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use lmdb::{Cursor as _, Database, RoTransaction, Transaction};

use ethogram_core::error::Result;
use ethogram_core::event::{PropertyId, RawEvent};
use ethogram_core::value::Value;

use crate::codec;
use crate::schema::Schema;
use crate::shard::Shard;
use crate::store_err;

/// Borrowed view of the event under a cursor.
#[derive(Debug, Clone, Copy)]
pub struct EventView<'a> {
    pub timestamp: DateTime<Utc>,
    pub data: &'a BTreeMap<PropertyId, Value>,
}

/// Forward iterator over every object of one table in one shard, yielding
/// each object's events in ascending timestamp order.
///
/// Opening a cursor acquires a read-only snapshot of the shard (one LMDB
/// read transaction) that is released when the cursor drops. The object key
/// list is fixed at open; event decoding is lazy, one event per
/// `next_event` call. Single-threaded; `reset` restarts the iteration over
/// the same snapshot.
pub struct ShardCursor<'env> {
    txn: RoTransaction<'env>,
    db: Option<Database>,
    schema: Schema,
    keys: Vec<Vec<u8>>,
    pos: usize,
    blob: Vec<u8>,
    offset: usize,
    current: Option<RawEvent>,
}

impl Shard {
    /// Open a cursor over one table, optionally restricted to object ids
    /// beginning with `prefix`.
    pub fn cursor(
        &self,
        table: &str,
        schema: Schema,
        prefix: Option<&[u8]>,
    ) -> Result<ShardCursor<'_>> {
        let db = self.table_db(table)?;
        let txn = self.env().begin_ro_txn().map_err(store_err)?;

        let mut keys = Vec::new();
        if let Some(db) = db {
            let mut cursor = txn.open_ro_cursor(db).map_err(store_err)?;
            let iter = match prefix {
                Some(p) if !p.is_empty() => cursor.iter_from(p),
                _ => cursor.iter(),
            };
            for item in iter {
                let (key, _) = item;
                if let Some(p) = prefix {
                    if !key.starts_with(p) {
                        break;
                    }
                }
                keys.push(key.to_vec());
            }
        }

        Ok(ShardCursor {
            txn,
            db,
            schema,
            keys,
            pos: 0,
            blob: Vec::new(),
            offset: 0,
            current: None,
        })
    }
}

impl<'env> ShardCursor<'env> {
    /// Advance to the next object. Returns false at the end of the shard's
    /// table keyspace.
    pub fn next_object(&mut self) -> Result<bool> {
        self.current = None;
        self.offset = 0;
        self.blob.clear();

        let Some(db) = self.db else {
            return Ok(false);
        };
        while self.pos < self.keys.len() {
            let key = &self.keys[self.pos];
            self.pos += 1;
            match self.txn.get(db, key) {
                Ok(blob) => {
                    self.blob.extend_from_slice(blob);
                    return Ok(true);
                }
                Err(lmdb::Error::NotFound) => continue,
                Err(e) => return Err(store_err(e)),
            }
        }
        Ok(false)
    }

    /// Id of the object the cursor is positioned on. Only meaningful after
    /// `next_object` returned true.
    pub fn current_object_id(&self) -> Option<&[u8]> {
        if self.pos == 0 {
            None
        } else {
            Some(&self.keys[self.pos - 1])
        }
    }

    /// Decode the next event of the current object. Returns false at the
    /// end of the object's event list.
    pub fn next_event(&mut self) -> Result<bool> {
        if self.offset >= self.blob.len() {
            self.current = None;
            return Ok(false);
        }
        self.current = Some(codec::decode_event(&self.blob, &mut self.offset, &self.schema)?);
        Ok(true)
    }

    pub fn event_view(&self) -> Option<EventView<'_>> {
        self.current.as_ref().map(|e| EventView {
            timestamp: e.timestamp,
            data: &e.data,
        })
    }

    /// Restart iteration from the first object of the snapshot.
    pub fn reset(&mut self) {
        self.pos = 0;
        self.blob.clear();
        self.offset = 0;
        self.current = None;
    }

    /// Number of objects in the snapshot (after prefix filtering).
    pub fn object_count(&self) -> usize {
        self.keys.len()
    }
}

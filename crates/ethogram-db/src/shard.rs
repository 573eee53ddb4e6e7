use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use lmdb::{
    Cursor as _, Database, DatabaseFlags, Environment, EnvironmentFlags, Transaction, WriteFlags,
};

use ethogram_core::error::{EthogramError, Result};
use ethogram_core::event::{truncate_micros, RawEvent};

use crate::codec;
use crate::options::StoreOptions;
use crate::schema::Schema;
use crate::store_err;

/// Opaque per-shard storage metrics.
#[derive(Debug, Clone, Default)]
pub struct ShardStats {
    pub entries: usize,
    pub depth: u32,
    pub page_size: u32,
    pub branch_pages: usize,
    pub leaf_pages: usize,
    pub overflow_pages: usize,
}

/// One persistent store holding the event blobs for a subset of objects,
/// rooted at `<root>/data/<index>`. Inside the environment each table is a
/// named database; keys are object ids, values are the encoded event lists.
///
/// Writers rewrite the whole object blob; that amplification is accepted,
/// objects are bounded in size for this workload.
pub struct Shard {
    index: usize,
    path: PathBuf,
    env: Environment,
    tables: Mutex<HashMap<String, Database>>,
    lock: RwLock<()>,
}

impl Shard {
    pub fn open(index: usize, data_dir: &Path, options: &StoreOptions) -> Result<Shard> {
        let path = data_dir.join(index.to_string());
        fs::create_dir_all(&path)?;

        let mut builder = Environment::new();
        builder.set_max_dbs(options.max_dbs);
        builder.set_map_size(options.map_size);
        builder.set_max_readers(options.max_readers);
        if options.nosync {
            builder.set_flags(EnvironmentFlags::NO_SYNC);
        }
        let env = builder
            .open(&path)
            .map_err(|e| EthogramError::Store(format!("shard {index} open: {e}")))?;

        tracing::debug!(shard = index, path = %path.display(), "shard opened");
        Ok(Shard {
            index,
            path,
            env,
            tables: Mutex::new(HashMap::new()),
            lock: RwLock::new(()),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn env(&self) -> &Environment {
        &self.env
    }

    /// Database handle for a table, `None` when the table has never been
    /// written to in this shard.
    pub(crate) fn table_db(&self, table: &str) -> Result<Option<Database>> {
        if let Some(db) = self.tables.lock().unwrap().get(table) {
            return Ok(Some(*db));
        }
        match self.env.open_db(Some(table)) {
            Ok(db) => {
                self.tables.lock().unwrap().insert(table.to_string(), db);
                Ok(Some(db))
            }
            Err(lmdb::Error::NotFound) => Ok(None),
            Err(e) => Err(store_err(e)),
        }
    }

    fn table_db_create(&self, table: &str) -> Result<Database> {
        if let Some(db) = self.tables.lock().unwrap().get(table) {
            return Ok(*db);
        }
        let db = self
            .env
            .create_db(Some(table), DatabaseFlags::empty())
            .map_err(store_err)?;
        self.tables.lock().unwrap().insert(table.to_string(), db);
        Ok(db)
    }

    pub fn get_event(
        &self,
        table: &str,
        id: &str,
        timestamp: DateTime<Utc>,
        schema: &Schema,
    ) -> Result<Option<RawEvent>> {
        let timestamp = truncate_micros(timestamp);
        let events = self.get_events(table, id, schema)?;
        Ok(events
            .binary_search_by_key(&timestamp, |e| e.timestamp)
            .ok()
            .map(|i| events[i].clone()))
    }

    pub fn get_events(&self, table: &str, id: &str, schema: &Schema) -> Result<Vec<RawEvent>> {
        let _guard = self.lock.read().unwrap();
        let Some(db) = self.table_db(table)? else {
            return Ok(Vec::new());
        };
        let txn = self.env.begin_ro_txn().map_err(store_err)?;
        match txn.get(db, &id.as_bytes()) {
            Ok(blob) => codec::decode_events(blob, schema),
            Err(lmdb::Error::NotFound) => Ok(Vec::new()),
            Err(e) => Err(store_err(e)),
        }
    }

    pub fn insert_event(
        &self,
        table: &str,
        id: &str,
        event: RawEvent,
        schema: &Schema,
    ) -> Result<()> {
        self.insert_events(table, id, std::slice::from_ref(&event), schema)
    }

    /// Read-modify-write of the object blob: decode, splice every event in
    /// timestamp order (merging equal timestamps), re-encode, write back,
    /// all inside one transaction.
    pub fn insert_events(
        &self,
        table: &str,
        id: &str,
        events: &[RawEvent],
        schema: &Schema,
    ) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let _guard = self.lock.write().unwrap();
        let db = self.table_db_create(table)?;
        let mut txn = self.env.begin_rw_txn().map_err(store_err)?;

        let mut list = match txn.get(db, &id.as_bytes()) {
            Ok(blob) => codec::decode_events(blob, schema)?,
            Err(lmdb::Error::NotFound) => Vec::new(),
            Err(e) => return Err(store_err(e)),
        };
        for event in events {
            codec::splice(&mut list, event.clone());
        }
        let blob = codec::encode_events(&list);
        txn.put(db, &id.as_bytes(), &blob, WriteFlags::empty())
            .map_err(store_err)?;
        txn.commit().map_err(store_err)
    }

    /// Remove the event at an exact timestamp. Deleting a missing event (or
    /// from a missing object) succeeds.
    pub fn delete_event(
        &self,
        table: &str,
        id: &str,
        timestamp: DateTime<Utc>,
        schema: &Schema,
    ) -> Result<()> {
        let timestamp = truncate_micros(timestamp);
        let _guard = self.lock.write().unwrap();
        let Some(db) = self.table_db(table)? else {
            return Ok(());
        };
        let mut txn = self.env.begin_rw_txn().map_err(store_err)?;

        let mut list = match txn.get(db, &id.as_bytes()) {
            Ok(blob) => codec::decode_events(blob, schema)?,
            Err(lmdb::Error::NotFound) => return Ok(()),
            Err(e) => return Err(store_err(e)),
        };
        let Ok(i) = list.binary_search_by_key(&timestamp, |e| e.timestamp) else {
            return Ok(());
        };
        list.remove(i);

        if list.is_empty() {
            txn.del(db, &id.as_bytes(), None).map_err(store_err)?;
        } else {
            let blob = codec::encode_events(&list);
            txn.put(db, &id.as_bytes(), &blob, WriteFlags::empty())
                .map_err(store_err)?;
        }
        txn.commit().map_err(store_err)
    }

    pub fn delete_object(&self, table: &str, id: &str) -> Result<()> {
        let _guard = self.lock.write().unwrap();
        let Some(db) = self.table_db(table)? else {
            return Ok(());
        };
        let mut txn = self.env.begin_rw_txn().map_err(store_err)?;
        match txn.del(db, &id.as_bytes(), None) {
            Ok(()) | Err(lmdb::Error::NotFound) => {}
            Err(e) => return Err(store_err(e)),
        }
        txn.commit().map_err(store_err)
    }

    /// Remove every key in the table's keyspace. Idempotent: dropping a
    /// table this shard never saw is a no-op.
    pub fn drop_table(&self, table: &str) -> Result<()> {
        let _guard = self.lock.write().unwrap();
        let Some(db) = self.table_db(table)? else {
            return Ok(());
        };

        let keys: Vec<Vec<u8>> = {
            let txn = self.env.begin_ro_txn().map_err(store_err)?;
            let mut cursor = txn.open_ro_cursor(db).map_err(store_err)?;
            let mut keys = Vec::new();
            for item in cursor.iter() {
                let (key, _) = item;
                keys.push(key.to_vec());
            }
            keys
        };
        if keys.is_empty() {
            return Ok(());
        }

        let mut txn = self.env.begin_rw_txn().map_err(store_err)?;
        for key in &keys {
            match txn.del(db, key, None) {
                Ok(()) | Err(lmdb::Error::NotFound) => {}
                Err(e) => return Err(store_err(e)),
            }
        }
        txn.commit().map_err(store_err)
    }

    pub fn stats(&self) -> Result<ShardStats> {
        let stat = self.env.stat().map_err(store_err)?;
        Ok(ShardStats {
            entries: stat.entries(),
            depth: stat.depth(),
            page_size: stat.page_size(),
            branch_pages: stat.branch_pages(),
            leaf_pages: stat.leaf_pages(),
            overflow_pages: stat.overflow_pages(),
        })
    }
}

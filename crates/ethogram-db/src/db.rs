use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use chrono::{DateTime, Utc};

use ethogram_core::error::{EthogramError, Result};
use ethogram_core::event::Event;
use ethogram_core::hash::object_hash;
use ethogram_core::observe;

use crate::factorizer::Factorizer;
use crate::options::StoreOptions;
use crate::schema::valid_name;
use crate::shard::{Shard, ShardStats};
use crate::table::Table;

/// Outcome of a bulk multi-object insert. `events_written` counts the events
/// committed before the first shard error (if any), so a caller can resume.
#[derive(Debug)]
pub struct BulkInsert {
    pub events_written: usize,
    pub error: Option<EthogramError>,
}

/// Router owning the shard set and the per-table factorizers and catalogs.
///
/// Objects are bound to shards by a stable hash of their id; the shard count
/// is discovered from the data directory on open and never changes once the
/// directory is populated.
pub struct Db {
    path: PathBuf,
    options: StoreOptions,
    shards: Vec<Arc<Shard>>,
    state: RwLock<DbState>,
}

struct DbState {
    open: bool,
    tables: HashMap<String, Arc<Table>>,
    factorizers: HashMap<String, Arc<Factorizer>>,
}

impl Db {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Db> {
        Self::open_with_options(path, StoreOptions::default())
    }

    pub fn open_with_options<P: AsRef<Path>>(path: P, options: StoreOptions) -> Result<Db> {
        let path = path.as_ref().to_path_buf();
        let data_dir = path.join("data");
        fs::create_dir_all(&data_dir)?;
        fs::create_dir_all(path.join("factors"))?;
        fs::create_dir_all(path.join("tables"))?;

        let count = discover_shard_count(&data_dir, options.default_shard_count)?;
        let mut shards = Vec::with_capacity(count);
        for index in 0..count {
            shards.push(Arc::new(Shard::open(index, &data_dir, &options)?));
        }

        tracing::info!(path = %path.display(), shards = count, "database opened");
        Ok(Db {
            path,
            options,
            shards,
            state: RwLock::new(DbState {
                open: true,
                tables: HashMap::new(),
                factorizers: HashMap::new(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn shards(&self) -> &[Arc<Shard>] {
        &self.shards
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// The shard an object id routes to. Stable for a fixed shard count.
    pub fn shard_for(&self, id: &str) -> &Arc<Shard> {
        let index = object_hash(id.as_bytes()) as usize % self.shards.len();
        &self.shards[index]
    }

    fn tables_dir(&self) -> PathBuf {
        self.path.join("tables")
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state.read().unwrap().open {
            Ok(())
        } else {
            Err(EthogramError::TableNotOpen)
        }
    }

    pub fn create_table(&self, name: &str) -> Result<Arc<Table>> {
        self.ensure_open()?;
        if !valid_name(name) {
            return Err(EthogramError::InvalidTableName(name.to_string()));
        }
        let mut state = self.state.write().unwrap();
        if state.tables.contains_key(name) || self.tables_dir().join(name).exists() {
            return Err(EthogramError::TableExists(name.to_string()));
        }
        let table = Arc::new(Table::create(&self.tables_dir(), name)?);
        state.tables.insert(name.to_string(), table.clone());
        Ok(table)
    }

    pub fn open_table(&self, name: &str) -> Result<Arc<Table>> {
        self.ensure_open()?;
        if let Some(table) = self.state.read().unwrap().tables.get(name) {
            return Ok(table.clone());
        }
        if !self.tables_dir().join(name).exists() {
            return Err(EthogramError::TableNotFound(name.to_string()));
        }
        let table = Arc::new(Table::open(&self.tables_dir(), name)?);
        self.state
            .write()
            .unwrap()
            .tables
            .entry(name.to_string())
            .or_insert_with(|| table.clone());
        Ok(table)
    }

    /// Drop a table: every shard's keyspace (in shard order), the factor
    /// store, and the catalog. Idempotent.
    pub fn drop_table(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        {
            let mut state = self.state.write().unwrap();
            if let Some(table) = state.tables.remove(name) {
                table.mark_closed();
            }
            state.factorizers.remove(name);
        }
        for shard in &self.shards {
            shard.drop_table(name)?;
        }
        let factors = self.path.join("factors").join(name);
        if factors.exists() {
            fs::remove_dir_all(factors)?;
        }
        let tables = self.tables_dir().join(name);
        if tables.exists() {
            fs::remove_dir_all(tables)?;
        }
        tracing::info!(table = name, "table dropped");
        Ok(())
    }

    /// The table's factorizer, opened on first use.
    pub fn factorizer(&self, table: &str) -> Result<Arc<Factorizer>> {
        self.ensure_open()?;
        if let Some(f) = self.state.read().unwrap().factorizers.get(table) {
            return Ok(f.clone());
        }
        let f = Arc::new(Factorizer::open(
            &self.path.join("factors"),
            table,
            &self.options,
        )?);
        Ok(self
            .state
            .write()
            .unwrap()
            .factorizers
            .entry(table.to_string())
            .or_insert(f)
            .clone())
    }

    pub fn insert_event(&self, table: &str, id: &str, event: Event) -> Result<()> {
        self.insert_events(table, id, vec![event])
    }

    pub fn insert_events(&self, table: &str, id: &str, events: Vec<Event>) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let handle = self.open_table(table)?;
        let schema = handle.snapshot()?;
        let factorizer = self.factorizer(table)?;

        let start = Instant::now();
        let mut raws = Vec::with_capacity(events.len());
        for mut event in events {
            factorizer.factorize_event(&mut event, &schema, true)?;
            raws.push(schema.raw_event(&event));
        }
        let count = raws.len();
        self.shard_for(id).insert_events(table, id, &raws, &schema)?;
        observe::record_ingest(count, start.elapsed());
        Ok(())
    }

    /// Bulk insert for many objects, fanned out shard by shard. Stops at the
    /// first shard error and reports how many events made it in.
    pub fn insert_objects(&self, table: &str, objects: BTreeMap<String, Vec<Event>>) -> BulkInsert {
        let prep = (|| {
            let handle = self.open_table(table)?;
            let schema = handle.snapshot()?;
            let factorizer = self.factorizer(table)?;
            Ok::<_, EthogramError>((schema, factorizer))
        })();
        let (schema, factorizer) = match prep {
            Ok(v) => v,
            Err(e) => {
                return BulkInsert {
                    events_written: 0,
                    error: Some(e),
                }
            }
        };

        let start = Instant::now();
        let mut events_written = 0;
        for (id, events) in objects {
            let count = events.len();
            let result = (|| {
                let mut raws = Vec::with_capacity(count);
                for mut event in events {
                    factorizer.factorize_event(&mut event, &schema, true)?;
                    raws.push(schema.raw_event(&event));
                }
                self.shard_for(&id).insert_events(table, &id, &raws, &schema)
            })();
            if let Err(e) = result {
                observe::record_ingest(events_written, start.elapsed());
                return BulkInsert {
                    events_written,
                    error: Some(e),
                };
            }
            events_written += count;
        }
        observe::record_ingest(events_written, start.elapsed());
        BulkInsert {
            events_written,
            error: None,
        }
    }

    pub fn get_event(
        &self,
        table: &str,
        id: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<Event>> {
        let schema = self.open_table(table)?.snapshot()?;
        let factorizer = self.factorizer(table)?;
        match self.shard_for(id).get_event(table, id, timestamp, &schema)? {
            Some(raw) => {
                let mut event = schema.event_from_raw(&raw);
                factorizer.defactorize_event(&mut event, &schema)?;
                Ok(Some(event))
            }
            None => Ok(None),
        }
    }

    pub fn get_events(&self, table: &str, id: &str) -> Result<Vec<Event>> {
        let schema = self.open_table(table)?.snapshot()?;
        let factorizer = self.factorizer(table)?;
        let raws = self.shard_for(id).get_events(table, id, &schema)?;
        let mut events = Vec::with_capacity(raws.len());
        for raw in &raws {
            let mut event = schema.event_from_raw(raw);
            factorizer.defactorize_event(&mut event, &schema)?;
            events.push(event);
        }
        Ok(events)
    }

    pub fn delete_event(&self, table: &str, id: &str, timestamp: DateTime<Utc>) -> Result<()> {
        let schema = self.open_table(table)?.snapshot()?;
        self.shard_for(id).delete_event(table, id, timestamp, &schema)
    }

    pub fn delete_object(&self, table: &str, id: &str) -> Result<()> {
        self.open_table(table)?.snapshot()?;
        self.shard_for(id).delete_object(table, id)
    }

    /// Move every event of `src_id` into `dest_id` (merging by timestamp),
    /// then delete the source object. Not atomic across shards: a failed
    /// source delete after a successful destination insert surfaces the
    /// error and leaves the events duplicated.
    pub fn merge(&self, table: &str, dest_id: &str, src_id: &str) -> Result<()> {
        let schema = self.open_table(table)?.snapshot()?;
        let src_events = self.shard_for(src_id).get_events(table, src_id, &schema)?;
        if src_events.is_empty() {
            return Ok(());
        }
        self.shard_for(dest_id)
            .insert_events(table, dest_id, &src_events, &schema)?;
        self.shard_for(src_id).delete_object(table, src_id)
    }

    pub fn stats(&self) -> Result<Vec<ShardStats>> {
        self.shards.iter().map(|s| s.stats()).collect()
    }

    /// Mark the database and every outstanding table handle closed. Shard
    /// environments are released when the `Db` itself drops; reopening the
    /// same path requires dropping this instance first.
    pub fn close(&self) {
        let mut state = self.state.write().unwrap();
        if !state.open {
            return;
        }
        state.open = false;
        for table in state.tables.values() {
            table.mark_closed();
        }
        state.tables.clear();
        state.factorizers.clear();
        tracing::info!(path = %self.path.display(), "database closed");
    }
}

/// Shard count is the highest numeric directory name plus one; a virgin data
/// directory gets the configured default.
fn discover_shard_count(data_dir: &Path, default: usize) -> Result<usize> {
    let mut count = 0;
    for entry in fs::read_dir(data_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if let Ok(index) = name.to_string_lossy().parse::<usize>() {
            count = count.max(index + 1);
        }
    }
    Ok(if count == 0 { default.max(1) } else { count })
}

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use lmdb::{Database, DatabaseFlags, Environment, EnvironmentFlags, Transaction, WriteFlags};

use ethogram_core::error::{EthogramError, Result};
use ethogram_core::event::Event;
use ethogram_core::observe;
use ethogram_core::value::{DataType, Value};

use crate::cache::FactorCache;
use crate::options::StoreOptions;
use crate::schema::Schema;
use crate::store_err;

/// Largest factor value, in bytes, stored in the dictionary. Longer values
/// are truncated before storage and callers see the truncated bytes on
/// read-back. This bound keeps forward keys inside LMDB's key size limit.
pub const MAX_KEY_SIZE: usize = 500;

/// Entries kept in the per-property LRU cache.
pub const FACTOR_CACHE_SIZE: usize = 1000;

const SEQ_KEY: &[u8] = b"+";

/// Per-table dictionary interning `factor`-typed string values as dense
/// 64-bit sequences, backed by an LMDB environment at
/// `<root>/factors/<table>` with one named database per property.
///
/// Keyspaces inside a property's database:
/// - `>` + value bytes → big-endian u64 sequence
/// - `<` + decimal sequence → value bytes
/// - `+` → big-endian u64 sequence counter
///
/// The empty string is reserved sequence 0 and never stored. Every
/// dictionary write commits eagerly; the cache absorbs read amplification,
/// so reads after writes are always consistent.
pub struct Factorizer {
    table: String,
    path: PathBuf,
    inner: Mutex<Inner>,
}

struct Inner {
    env: Environment,
    dbs: HashMap<String, Database>,
    caches: HashMap<String, FactorCache>,
}

impl Factorizer {
    pub fn open(factors_dir: &Path, table: &str, options: &StoreOptions) -> Result<Factorizer> {
        let path = factors_dir.join(table);
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
            .map_err(|e| EthogramError::Store(format!("factor store open: {e}")))?;

        Ok(Factorizer {
            table: table.to_string(),
            path,
            inner: Mutex::new(Inner {
                env,
                dbs: HashMap::new(),
                caches: HashMap::new(),
            }),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Convert a value into its numeric sequence, creating a new sequence if
    /// requested. The empty string is always 0 and does no I/O.
    pub fn factorize(&self, property: &str, value: &str, create_if_missing: bool) -> Result<u64> {
        self.inner
            .lock()
            .unwrap()
            .factorize(property, value, create_if_missing)
    }

    /// Convert a sequence back to its string value. 0 is always the empty
    /// string.
    pub fn defactorize(&self, property: &str, sequence: u64) -> Result<String> {
        self.inner.lock().unwrap().defactorize(property, sequence)
    }

    /// Replace every factor-typed value in the event with its sequence.
    /// Non-string inputs are coerced numerically; names without a catalog
    /// entry are left untouched.
    pub fn factorize_event(
        &self,
        event: &mut Event,
        schema: &Schema,
        create_if_missing: bool,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for (name, value) in event.data.iter_mut() {
            let Some(p) = schema.property(name) else {
                continue;
            };
            if p.data_type != DataType::Factor {
                continue;
            }
            let sequenced = match &*value {
                Value::String(s) => Value::Factor(inner.factorize(name, s, create_if_missing)?),
                other => Value::Factor(other.as_u64_lossy()),
            };
            *value = sequenced;
        }
        Ok(())
    }

    /// Replace every factor-typed value in the event with its string form.
    pub fn defactorize_event(&self, event: &mut Event, schema: &Schema) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for (name, value) in event.data.iter_mut() {
            let Some(p) = schema.property(name) else {
                continue;
            };
            if p.data_type != DataType::Factor {
                continue;
            }
            let sequence = value.as_u64_lossy();
            *value = Value::String(inner.defactorize(name, sequence)?);
        }
        Ok(())
    }

    /// Barrier called before a query's map phase. Dictionary writes commit
    /// eagerly, so there is never a pending transaction to push out; the
    /// method exists to keep the ordering contract explicit at the call site.
    pub fn flush(&self) -> Result<()> {
        Ok(())
    }
}

impl Inner {
    fn db(&mut self, property: &str) -> Result<Database> {
        if let Some(db) = self.dbs.get(property) {
            return Ok(*db);
        }
        let db = self
            .env
            .create_db(Some(property), DatabaseFlags::empty())
            .map_err(store_err)?;
        self.dbs.insert(property.to_string(), db);
        Ok(db)
    }

    fn cache(&mut self, property: &str) -> &mut FactorCache {
        self.caches
            .entry(property.to_string())
            .or_insert_with(|| FactorCache::new(FACTOR_CACHE_SIZE))
    }

    fn factorize(&mut self, property: &str, value: &str, create_if_missing: bool) -> Result<u64> {
        if value.is_empty() {
            return Ok(0);
        }
        let truncated = truncate(value).to_string();

        if let Some(sequence) = self.cache(property).get_value(&truncated) {
            observe::record_factor_cache(true);
            return Ok(sequence);
        }
        observe::record_factor_cache(false);

        let db = self.db(property)?;
        let key = forward_key(&truncated);
        {
            let txn = self.env.begin_ro_txn().map_err(store_err)?;
            match txn.get(db, &key) {
                Ok(data) => {
                    let sequence = decode_sequence(data)?;
                    drop(txn);
                    self.cache(property).add(&truncated, sequence);
                    return Ok(sequence);
                }
                Err(lmdb::Error::NotFound) => {}
                Err(e) => return Err(store_err(e)),
            }
        }

        if !create_if_missing {
            return Err(EthogramError::FactorNotFound {
                property: property.to_string(),
                detail: truncated,
            });
        }
        self.add(db, property, &truncated)
    }

    /// Allocate the next sequence and write both dictionary rows in one
    /// committed transaction.
    fn add(&mut self, db: Database, property: &str, value: &str) -> Result<u64> {
        let mut txn = self.env.begin_rw_txn().map_err(store_err)?;

        let sequence = match txn.get(db, &SEQ_KEY) {
            Ok(data) => decode_sequence(data)? + 1,
            Err(lmdb::Error::NotFound) => 1,
            Err(e) => return Err(store_err(e)),
        };
        txn.put(db, &SEQ_KEY, &sequence.to_be_bytes(), WriteFlags::empty())
            .map_err(store_err)?;
        put_with_retruncate(&mut txn, db, forward_key(value), &sequence.to_be_bytes())?;
        txn.put(db, &reverse_key(sequence), &value.as_bytes(), WriteFlags::empty())
            .map_err(store_err)?;

        if let Err(e) = txn.commit() {
            // The cache may now disagree with the store for this property.
            self.caches.remove(property);
            return Err(store_err(e));
        }

        self.cache(property).add(value, sequence);
        Ok(sequence)
    }

    fn defactorize(&mut self, property: &str, sequence: u64) -> Result<String> {
        if sequence == 0 {
            return Ok(String::new());
        }

        if let Some(value) = self.cache(property).get_key(sequence) {
            observe::record_factor_cache(true);
            return Ok(value);
        }
        observe::record_factor_cache(false);

        let db = self.db(property)?;
        let value = {
            let txn = self.env.begin_ro_txn().map_err(store_err)?;
            match txn.get(db, &reverse_key(sequence)) {
                Ok(data) => String::from_utf8_lossy(data).into_owned(),
                Err(lmdb::Error::NotFound) => {
                    return Err(EthogramError::FactorNotFound {
                        property: property.to_string(),
                        detail: format!("<{sequence}"),
                    })
                }
                Err(e) => return Err(store_err(e)),
            }
        };
        self.cache(property).add(&value, sequence);
        Ok(value)
    }
}

/// Write a forward row, retrying once after re-truncation if the store
/// rejects the key size.
fn put_with_retruncate(
    txn: &mut lmdb::RwTransaction<'_>,
    db: Database,
    key: Vec<u8>,
    data: &[u8],
) -> Result<()> {
    match txn.put(db, &key, &data, WriteFlags::empty()) {
        Ok(()) => Ok(()),
        Err(lmdb::Error::BadValSize) => {
            let retruncated = &key[..key.len().min(MAX_KEY_SIZE)];
            txn.put(db, &retruncated, &data, WriteFlags::empty())
                .map_err(|_| EthogramError::KeyTooLarge {
                    size: key.len(),
                    max: MAX_KEY_SIZE,
                })
        }
        Err(e) => Err(store_err(e)),
    }
}

fn truncate(value: &str) -> &str {
    if value.len() <= MAX_KEY_SIZE {
        return value;
    }
    let mut end = MAX_KEY_SIZE;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

fn forward_key(value: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(value.len() + 1);
    key.push(b'>');
    key.extend_from_slice(value.as_bytes());
    key
}

fn reverse_key(sequence: u64) -> Vec<u8> {
    format!("<{sequence}").into_bytes()
}

fn decode_sequence(data: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = data
        .try_into()
        .map_err(|_| EthogramError::Store("malformed factor sequence row".into()))?;
    Ok(u64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_factorizer(dir: &Path) -> Factorizer {
        Factorizer::open(dir, "foo", &StoreOptions::default()).unwrap()
    }

    #[test]
    fn test_roundtrip_and_identity() {
        let dir = tempfile::tempdir().unwrap();
        let f = open_factorizer(dir.path());

        let a = f.factorize("fruit", "apple", true).unwrap();
        let b = f.factorize("fruit", "grape", true).unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        // Repeated factorization returns the same sequence.
        assert_eq!(f.factorize("fruit", "apple", true).unwrap(), a);

        assert_eq!(f.defactorize("fruit", a).unwrap(), "apple");
        assert_eq!(f.defactorize("fruit", b).unwrap(), "grape");
    }

    #[test]
    fn test_empty_value_is_zero() {
        let dir = tempfile::tempdir().unwrap();
        let f = open_factorizer(dir.path());
        assert_eq!(f.factorize("fruit", "", true).unwrap(), 0);
        assert_eq!(f.defactorize("fruit", 0).unwrap(), "");
    }

    #[test]
    fn test_missing_without_create() {
        let dir = tempfile::tempdir().unwrap();
        let f = open_factorizer(dir.path());
        assert!(matches!(
            f.factorize("fruit", "kumquat", false).unwrap_err(),
            EthogramError::FactorNotFound { .. }
        ));
        assert!(matches!(
            f.defactorize("fruit", 42).unwrap_err(),
            EthogramError::FactorNotFound { .. }
        ));
    }

    #[test]
    fn test_properties_have_separate_sequences() {
        let dir = tempfile::tempdir().unwrap();
        let f = open_factorizer(dir.path());
        assert_eq!(f.factorize("fruit", "apple", true).unwrap(), 1);
        assert_eq!(f.factorize("color", "red", true).unwrap(), 1);
        assert_eq!(f.defactorize("fruit", 1).unwrap(), "apple");
        assert_eq!(f.defactorize("color", 1).unwrap(), "red");
    }

    #[test]
    fn test_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let f = open_factorizer(dir.path());
        let long = "*".repeat(600);
        let seq = f.factorize("prop1", &long, true).unwrap();
        assert_eq!(f.defactorize("prop1", seq).unwrap(), "*".repeat(500));
        // The truncated form is the stored identity.
        assert_eq!(f.factorize("prop1", &"*".repeat(500), true).unwrap(), seq);
    }

    #[test]
    fn test_beyond_cache_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let f = open_factorizer(dir.path());
        let n = FACTOR_CACHE_SIZE * 2;
        let mut sequences = Vec::new();
        for i in 0..n {
            sequences.push(f.factorize("prop1", &format!("value-{i}"), true).unwrap());
        }
        for i in 0..n {
            assert_eq!(
                f.defactorize("prop1", sequences[i]).unwrap(),
                format!("value-{i}")
            );
            assert_eq!(
                f.factorize("prop1", &format!("value-{i}"), false).unwrap(),
                sequences[i]
            );
        }
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let seq = {
            let f = open_factorizer(dir.path());
            f.factorize("fruit", "apple", true).unwrap()
        };
        let f = open_factorizer(dir.path());
        assert_eq!(f.defactorize("fruit", seq).unwrap(), "apple");
        assert_eq!(f.factorize("fruit", "banana", true).unwrap(), seq + 1);
    }
}

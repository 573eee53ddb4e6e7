use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use ethogram_core::error::{EthogramError, Result};
use ethogram_core::event::PropertyId;
use ethogram_core::value::DataType;

use crate::schema::{Property, Schema};

const MANIFEST_FILE: &str = "schema";

/// Handle to one table's property catalog, persisted as a versioned manifest
/// at `<root>/tables/<name>/schema`.
///
/// Handles stay valid after the database closes but refuse every operation
/// with `TableNotOpen`.
#[derive(Debug)]
pub struct Table {
    name: String,
    path: PathBuf,
    inner: RwLock<TableInner>,
}

#[derive(Debug)]
struct TableInner {
    schema: Schema,
    open: bool,
}

impl Table {
    /// Create a new table directory with an empty catalog.
    pub fn create(tables_dir: &Path, name: &str) -> Result<Table> {
        let path = tables_dir.join(name);
        fs::create_dir_all(&path)?;
        let table = Table {
            name: name.to_string(),
            path,
            inner: RwLock::new(TableInner {
                schema: Schema::new(),
                open: true,
            }),
        };
        table.save(&table.inner.read().unwrap().schema)?;
        Ok(table)
    }

    /// Load an existing table's manifest.
    pub fn open(tables_dir: &Path, name: &str) -> Result<Table> {
        let path = tables_dir.join(name);
        let raw = fs::read_to_string(path.join(MANIFEST_FILE))?;
        let mut schema: Schema = serde_json::from_str(&raw)
            .map_err(|e| EthogramError::Store(format!("table manifest decode: {e}")))?;
        schema.reindex();
        Ok(Table {
            name: name.to_string(),
            path,
            inner: RwLock::new(TableInner { schema, open: true }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_open(&self) -> bool {
        self.inner.read().unwrap().open
    }

    pub(crate) fn mark_closed(&self) {
        self.inner.write().unwrap().open = false;
    }

    fn save(&self, schema: &Schema) -> Result<()> {
        let json = serde_json::to_string_pretty(schema)
            .map_err(|e| EthogramError::Store(format!("table manifest encode: {e}")))?;
        fs::write(self.path.join(MANIFEST_FILE), json)?;
        Ok(())
    }

    /// Mutate the schema and persist the manifest; the in-memory catalog only
    /// advances once the write succeeds.
    fn update<T>(&self, f: impl FnOnce(&mut Schema) -> Result<T>) -> Result<T> {
        let mut inner = self.inner.write().unwrap();
        if !inner.open {
            return Err(EthogramError::TableNotOpen);
        }
        let mut schema = inner.schema.clone();
        let out = f(&mut schema)?;
        self.save(&schema)?;
        inner.schema = schema;
        Ok(out)
    }

    pub fn create_property(
        &self,
        name: &str,
        data_type: DataType,
        transient: bool,
    ) -> Result<Property> {
        self.update(|schema| schema.create_property(name, data_type, transient))
    }

    pub fn rename_property(&self, old: &str, new: &str) -> Result<Property> {
        self.update(|schema| schema.rename_property(old, new))
    }

    pub fn delete_property(&self, name: &str) -> Result<()> {
        self.update(|schema| schema.delete_property(name))
    }

    pub fn property(&self, name: &str) -> Result<Option<Property>> {
        let inner = self.inner.read().unwrap();
        if !inner.open {
            return Err(EthogramError::TableNotOpen);
        }
        Ok(inner.schema.property(name).cloned())
    }

    pub fn property_by_id(&self, id: PropertyId) -> Result<Option<Property>> {
        let inner = self.inner.read().unwrap();
        if !inner.open {
            return Err(EthogramError::TableNotOpen);
        }
        Ok(inner.schema.property_by_id(id).cloned())
    }

    pub fn properties(&self) -> Result<Vec<Property>> {
        let inner = self.inner.read().unwrap();
        if !inner.open {
            return Err(EthogramError::TableNotOpen);
        }
        Ok(inner.schema.properties().to_vec())
    }

    /// Consistent copy of the catalog for the duration of an operation.
    pub fn snapshot(&self) -> Result<Schema> {
        let inner = self.inner.read().unwrap();
        if !inner.open {
            return Err(EthogramError::TableNotOpen);
        }
        Ok(inner.schema.clone())
    }
}

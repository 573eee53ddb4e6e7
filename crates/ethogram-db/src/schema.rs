use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use ethogram_core::error::{EthogramError, Result};
use ethogram_core::event::{Event, PropertyId, RawEvent};
use ethogram_core::value::{DataType, Value};

pub const SCHEMA_VERSION: u32 = 1;

/// One entry of a table's property catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub id: PropertyId,
    pub name: String,
    #[serde(rename = "dataType")]
    pub data_type: DataType,
    pub transient: bool,
}

impl Property {
    pub fn cast(&self, value: Value) -> Value {
        value.cast(self.data_type)
    }
}

pub(crate) fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// In-memory property catalog for one table, indexed by name and by id.
///
/// Ids are assigned at creation from two independent monotonic counters:
/// the next positive integer for persistent properties, the next negative
/// integer for transient ones. Neither counter ever reuses an id, so a
/// deleted property's data stays dangling on disk (decoders skip it).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    pub version: u32,
    next_persistent_id: PropertyId,
    next_transient_id: PropertyId,
    properties: Vec<Property>,
    #[serde(skip)]
    by_name: HashMap<String, usize>,
    #[serde(skip)]
    by_id: HashMap<PropertyId, usize>,
}

impl Default for Schema {
    fn default() -> Self {
        Self::new()
    }
}

impl Schema {
    pub fn new() -> Schema {
        Schema {
            version: SCHEMA_VERSION,
            next_persistent_id: 1,
            next_transient_id: -1,
            properties: Vec::new(),
            by_name: HashMap::new(),
            by_id: HashMap::new(),
        }
    }

    /// Rebuild the lookup indexes; required after deserializing.
    pub fn reindex(&mut self) {
        self.by_name.clear();
        self.by_id.clear();
        for (i, p) in self.properties.iter().enumerate() {
            self.by_name.insert(p.name.clone(), i);
            self.by_id.insert(p.id, i);
        }
    }

    pub fn create_property(
        &mut self,
        name: &str,
        data_type: DataType,
        transient: bool,
    ) -> Result<Property> {
        if !valid_name(name) {
            return Err(EthogramError::InvalidPropertyName(name.to_string()));
        }
        if self.by_name.contains_key(name) {
            return Err(EthogramError::PropertyExists(name.to_string()));
        }

        let id = if transient {
            let id = self.next_transient_id;
            self.next_transient_id -= 1;
            id
        } else {
            let id = self.next_persistent_id;
            self.next_persistent_id += 1;
            id
        };

        let property = Property {
            id,
            name: name.to_string(),
            data_type,
            transient,
        };
        self.properties.push(property.clone());
        self.by_name.insert(name.to_string(), self.properties.len() - 1);
        self.by_id.insert(id, self.properties.len() - 1);
        Ok(property)
    }

    /// Rename a property, preserving its id.
    pub fn rename_property(&mut self, old: &str, new: &str) -> Result<Property> {
        if !valid_name(new) {
            return Err(EthogramError::InvalidPropertyName(new.to_string()));
        }
        if self.by_name.contains_key(new) {
            return Err(EthogramError::PropertyExists(new.to_string()));
        }
        let idx = *self
            .by_name
            .get(old)
            .ok_or_else(|| EthogramError::PropertyNotFound(old.to_string()))?;

        self.properties[idx].name = new.to_string();
        self.by_name.remove(old);
        self.by_name.insert(new.to_string(), idx);
        Ok(self.properties[idx].clone())
    }

    /// Delete is permanent: the id is never reassigned and encoded data
    /// referencing it is skipped on decode.
    pub fn delete_property(&mut self, name: &str) -> Result<()> {
        let idx = *self
            .by_name
            .get(name)
            .ok_or_else(|| EthogramError::PropertyNotFound(name.to_string()))?;
        self.properties.remove(idx);
        self.reindex();
        Ok(())
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.by_name.get(name).map(|&i| &self.properties[i])
    }

    pub fn property_by_id(&self, id: PropertyId) -> Option<&Property> {
        self.by_id.get(&id).map(|&i| &self.properties[i])
    }

    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    /// Convert a name-keyed event into its storage form: values are cast to
    /// their declared types and keyed by property id. Names without a catalog
    /// entry are dropped.
    pub fn raw_event(&self, event: &Event) -> RawEvent {
        let mut raw = RawEvent::new(event.timestamp);
        for (name, value) in &event.data {
            if let Some(p) = self.property(name) {
                raw.data.insert(p.id, p.cast(value.clone()));
            }
        }
        raw
    }

    /// Convert a storage event back to the name-keyed form. Ids without a
    /// catalog entry (deleted properties) are dropped.
    pub fn event_from_raw(&self, raw: &RawEvent) -> Event {
        let mut event = Event::new(raw.timestamp);
        for (id, value) in &raw.data {
            if let Some(p) = self.property_by_id(*id) {
                event.data.insert(p.name.clone(), value.clone());
            }
        }
        event
    }
}

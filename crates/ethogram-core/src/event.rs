use std::collections::BTreeMap;

use chrono::{DateTime, Timelike, Utc};

use crate::value::Value;

/// Property identifier. Positive ids are persistent properties, negative ids
/// are transient (query-only) properties; 0 is reserved.
pub type PropertyId = i32;

/// An event at the API boundary: a timestamp plus a property map keyed by
/// property name. Timestamps have microsecond resolution in UTC.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub data: BTreeMap<String, Value>,
}

impl Event {
    pub fn new(timestamp: DateTime<Utc>) -> Event {
        Event {
            timestamp: truncate_micros(timestamp),
            data: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: &str, value: Value) -> Event {
        self.data.insert(name.to_string(), value);
        self
    }
}

/// An event inside the storage layer: the property map is keyed by property
/// id and every value has already been cast (and factor values sequenced).
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub timestamp: DateTime<Utc>,
    pub data: BTreeMap<PropertyId, Value>,
}

impl RawEvent {
    pub fn new(timestamp: DateTime<Utc>) -> RawEvent {
        RawEvent {
            timestamp: truncate_micros(timestamp),
            data: BTreeMap::new(),
        }
    }

    /// Overlay `newer` onto this event. Values from `newer` win; keys present
    /// only in `self` are retained. Timestamps must already match.
    pub fn merge_from(&mut self, newer: &RawEvent) {
        for (id, value) in &newer.data {
            self.data.insert(*id, value.clone());
        }
    }
}

/// Clamp a timestamp to the storage resolution (whole microseconds).
pub fn truncate_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    let nanos = ts.nanosecond();
    let truncated = nanos - (nanos % 1_000);
    // with_nanosecond only fails for leap-second values >= 2e9, which a
    // truncation can never produce.
    ts.with_nanosecond(truncated).unwrap_or(ts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn test_truncate_micros() {
        let t = truncate_micros(ts("2012-01-01T02:00:00.123456111Z"));
        assert_eq!(t, ts("2012-01-01T02:00:00.123456Z"));
    }

    #[test]
    fn test_merge_overlays_new_values() {
        let mut old = RawEvent::new(ts("2000-01-01T00:00:00Z"));
        old.data.insert(1, Value::Int(20));
        old.data.insert(2, Value::Factor(1));
        old.data.insert(3, Value::String("frank".into()));

        let mut new = RawEvent::new(ts("2000-01-01T00:00:00Z"));
        new.data.insert(1, Value::Int(30));
        new.data.insert(2, Value::Factor(2));

        old.merge_from(&new);
        assert_eq!(old.data[&1], Value::Int(30));
        assert_eq!(old.data[&2], Value::Factor(2));
        assert_eq!(old.data[&3], Value::String("frank".into()));
    }
}

//! Binary codec for object event blobs.
//!
//! A blob is the concatenation of encoded events, sorted strictly by
//! timestamp. One event encodes as:
//!
//! ```text
//! [i64 LE shifted timestamp][uvarint pair count]
//!     ([zigzag-varint property id][tag byte][payload])*
//! ```
//!
//! The tag byte makes every value skippable without the catalog, so readers
//! tolerate property ids whose catalog entry has been deleted.

use chrono::{DateTime, Utc};
use ethogram_core::error::{EthogramError, Result};
use ethogram_core::event::{PropertyId, RawEvent};
use ethogram_core::value::Value;

use crate::schema::Schema;

/// Codec epoch: 2000-01-01T00:00:00Z as Unix microseconds. Timestamps are
/// stored shifted against this so contemporary data stays small.
pub const EPOCH_MICROS: i64 = 946_684_800_000_000;

const TAG_STRING: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_FLOAT: u8 = 0x03;
const TAG_BOOL: u8 = 0x04;
const TAG_FACTOR: u8 = 0x05;

pub fn shift_timestamp(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros() - EPOCH_MICROS
}

pub fn unshift_timestamp(shifted: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(shifted + EPOCH_MICROS)
        .ok_or_else(|| EthogramError::Codec(format!("timestamp out of range: {shifted}")))
}

fn write_uvarint(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

fn read_uvarint(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *buf
            .get(*pos)
            .ok_or_else(|| EthogramError::Codec("truncated varint".into()))?;
        *pos += 1;
        if shift >= 64 {
            return Err(EthogramError::Codec("varint overflow".into()));
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

fn unzigzag(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

fn read_exact<'a>(buf: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = pos
        .checked_add(len)
        .filter(|&end| end <= buf.len())
        .ok_or_else(|| EthogramError::Codec("truncated event".into()))?;
    let slice = &buf[*pos..end];
    *pos = end;
    Ok(slice)
}

fn write_value(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::String(s) => {
            buf.push(TAG_STRING);
            write_uvarint(buf, s.len() as u64);
            buf.extend_from_slice(s.as_bytes());
        }
        Value::Int(v) => {
            buf.push(TAG_INT);
            write_uvarint(buf, zigzag(*v));
        }
        Value::Float(v) => {
            buf.push(TAG_FLOAT);
            buf.extend_from_slice(&v.to_bits().to_le_bytes());
        }
        Value::Bool(v) => {
            buf.push(TAG_BOOL);
            buf.push(*v as u8);
        }
        Value::Factor(v) => {
            buf.push(TAG_FACTOR);
            write_uvarint(buf, *v);
        }
    }
}

fn read_value(buf: &[u8], pos: &mut usize) -> Result<Value> {
    let tag = *buf
        .get(*pos)
        .ok_or_else(|| EthogramError::Codec("missing value tag".into()))?;
    *pos += 1;
    match tag {
        TAG_STRING => {
            let len = read_uvarint(buf, pos)? as usize;
            let bytes = read_exact(buf, pos, len)?;
            let s = std::str::from_utf8(bytes)
                .map_err(|e| EthogramError::Codec(format!("invalid utf-8 string: {e}")))?;
            Ok(Value::String(s.to_string()))
        }
        TAG_INT => Ok(Value::Int(unzigzag(read_uvarint(buf, pos)?))),
        TAG_FLOAT => {
            let bytes = read_exact(buf, pos, 8)?;
            let bits = u64::from_le_bytes(bytes.try_into().unwrap());
            Ok(Value::Float(f64::from_bits(bits)))
        }
        TAG_BOOL => {
            let bytes = read_exact(buf, pos, 1)?;
            Ok(Value::Bool(bytes[0] != 0))
        }
        TAG_FACTOR => Ok(Value::Factor(read_uvarint(buf, pos)?)),
        other => Err(EthogramError::Codec(format!("unknown value tag: {other:#x}"))),
    }
}

/// Advance past one tagged value without materializing it.
fn skip_value(buf: &[u8], pos: &mut usize) -> Result<()> {
    let tag = *buf
        .get(*pos)
        .ok_or_else(|| EthogramError::Codec("missing value tag".into()))?;
    *pos += 1;
    match tag {
        TAG_STRING => {
            let len = read_uvarint(buf, pos)? as usize;
            read_exact(buf, pos, len)?;
        }
        TAG_INT | TAG_FACTOR => {
            read_uvarint(buf, pos)?;
        }
        TAG_FLOAT => {
            read_exact(buf, pos, 8)?;
        }
        TAG_BOOL => {
            read_exact(buf, pos, 1)?;
        }
        other => return Err(EthogramError::Codec(format!("unknown value tag: {other:#x}"))),
    }
    Ok(())
}

/// Append one event's encoding to `buf`.
pub fn encode_event(event: &RawEvent, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&shift_timestamp(event.timestamp).to_le_bytes());
    write_uvarint(buf, event.data.len() as u64);
    // BTreeMap iteration gives the property pairs in sorted id order.
    for (id, value) in &event.data {
        write_uvarint(buf, zigzag(*id as i64));
        write_value(buf, value);
    }
}

/// Decode one event starting at `*pos`, advancing it past the event.
/// Property ids with no catalog entry are skipped by tag.
pub fn decode_event(buf: &[u8], pos: &mut usize, schema: &Schema) -> Result<RawEvent> {
    let ts_bytes = read_exact(buf, pos, 8)?;
    let shifted = i64::from_le_bytes(ts_bytes.try_into().unwrap());
    let mut event = RawEvent::new(unshift_timestamp(shifted)?);

    let count = read_uvarint(buf, pos)?;
    for _ in 0..count {
        let id = unzigzag(read_uvarint(buf, pos)?) as PropertyId;
        if schema.property_by_id(id).is_some() {
            event.data.insert(id, read_value(buf, pos)?);
        } else {
            skip_value(buf, pos)?;
        }
    }
    Ok(event)
}

pub fn encode_events(events: &[RawEvent]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(events.len() * 32);
    for event in events {
        encode_event(event, &mut buf);
    }
    buf
}

pub fn decode_events(buf: &[u8], schema: &Schema) -> Result<Vec<RawEvent>> {
    let mut events = Vec::new();
    let mut pos = 0;
    while pos < buf.len() {
        events.push(decode_event(buf, &mut pos, schema)?);
    }
    Ok(events)
}

/// Splice an event into a timestamp-sorted list. An equal-timestamp match is
/// merged in place (new values overwrite, missing keys are retained), keeping
/// the two-events-never-share-a-timestamp invariant.
pub fn splice(events: &mut Vec<RawEvent>, event: RawEvent) {
    match events.binary_search_by_key(&event.timestamp, |e| e.timestamp) {
        Ok(i) => events[i].merge_from(&event),
        Err(i) => events.insert(i, event),
    }
}

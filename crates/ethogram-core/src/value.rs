use serde::{Deserialize, Serialize};

/// Declared type of a table property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    String,
    Integer,
    Float,
    Boolean,
    Factor,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::String => "string",
            DataType::Integer => "integer",
            DataType::Float => "float",
            DataType::Boolean => "boolean",
            DataType::Factor => "factor",
        }
    }
}

/// A single typed property value.
///
/// `Factor` carries the interned dictionary sequence; the string form only
/// exists outside the storage layer, before factorization and after
/// defactorization.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Factor(u64),
}

impl Value {
    /// The zero value for a declared type.
    pub fn zero(data_type: DataType) -> Value {
        match data_type {
            DataType::String => Value::String(String::new()),
            DataType::Integer => Value::Int(0),
            DataType::Float => Value::Float(0.0),
            DataType::Boolean => Value::Bool(false),
            DataType::Factor => Value::Factor(0),
        }
    }

    /// Coerce an untyped input into the declared type. Numeric values promote
    /// between integer and float; anything else collapses to the type's zero
    /// value. This is the single entry point for type sanitization.
    pub fn cast(self, data_type: DataType) -> Value {
        match data_type {
            DataType::String | DataType::Factor => match self {
                Value::String(s) => Value::String(s),
                // A factor value that already went through the dictionary.
                Value::Factor(seq) if data_type == DataType::Factor => Value::Factor(seq),
                _ => Value::String(String::new()),
            },
            DataType::Integer => match self {
                Value::Int(v) => Value::Int(v),
                Value::Float(v) => Value::Int(v as i64),
                _ => Value::Int(0),
            },
            DataType::Float => match self {
                Value::Float(v) => Value::Float(v),
                Value::Int(v) => Value::Float(v as f64),
                _ => Value::Float(0.0),
            },
            DataType::Boolean => match self {
                Value::Bool(v) => Value::Bool(v),
                _ => Value::Bool(false),
            },
        }
    }

    pub fn as_i64(&self) -> i64 {
        match self {
            Value::Int(v) => *v,
            Value::Float(v) => *v as i64,
            Value::Bool(v) => *v as i64,
            Value::Factor(v) => *v as i64,
            Value::String(_) => 0,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match self {
            Value::Int(v) => *v as f64,
            Value::Float(v) => *v,
            Value::Bool(v) => *v as i64 as f64,
            Value::Factor(v) => *v as f64,
            Value::String(_) => 0.0,
        }
    }

    pub fn as_bool(&self) -> bool {
        match self {
            Value::Bool(v) => *v,
            Value::Int(v) => *v != 0,
            Value::Float(v) => *v != 0.0,
            Value::Factor(v) => *v != 0,
            Value::String(s) => !s.is_empty(),
        }
    }

    /// Numeric coercion used when a factor slot arrives as a plain number
    /// (e.g. an already-sequenced value round-tripping through JSON).
    pub fn as_u64_lossy(&self) -> u64 {
        match self {
            Value::Factor(v) => *v,
            Value::Int(v) => *v as u64,
            Value::Float(v) => *v as u64,
            Value::Bool(v) => *v as u64,
            Value::String(_) => 0,
        }
    }

    /// Decode a JSON value at the ingest boundary. Unsupported JSON shapes
    /// (arrays, objects, null) are rejected by returning `None`.
    pub fn from_json(v: &serde_json::Value) -> Option<Value> {
        match v {
            serde_json::Value::String(s) => Some(Value::String(s.clone())),
            serde_json::Value::Bool(b) => Some(Value::Bool(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(Value::Int(i))
                } else {
                    n.as_f64().map(Value::Float)
                }
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cast_numeric_promotion() {
        assert_eq!(Value::Float(3.7).cast(DataType::Integer), Value::Int(3));
        assert_eq!(Value::Int(3).cast(DataType::Float), Value::Float(3.0));
    }

    #[test]
    fn test_cast_mismatch_collapses_to_zero() {
        assert_eq!(
            Value::String("x".into()).cast(DataType::Integer),
            Value::Int(0)
        );
        assert_eq!(Value::Int(1).cast(DataType::Boolean), Value::Bool(false));
        assert_eq!(
            Value::Bool(true).cast(DataType::String),
            Value::String(String::new())
        );
    }

    #[test]
    fn test_from_json() {
        assert_eq!(
            Value::from_json(&serde_json::json!("apple")),
            Some(Value::String("apple".into()))
        );
        assert_eq!(Value::from_json(&serde_json::json!(12)), Some(Value::Int(12)));
        assert_eq!(
            Value::from_json(&serde_json::json!(1.5)),
            Some(Value::Float(1.5))
        );
        assert_eq!(Value::from_json(&serde_json::json!(null)), None);
        assert_eq!(Value::from_json(&serde_json::json!([1])), None);
    }
}

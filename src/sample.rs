//! Sample records produced by OPC UA value changes
//!
//! A `Sample` is created once per dequeued monitored-item value and is never
//! mutated afterwards. Its serde representation uses the camelCase field
//! names of the primary store document schema, so a fallback-file line and a
//! primary document describe the same record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Acquired value, tagged over the OPC UA primitive set.
///
/// Arrays are homogeneous sequences of any primitive variant and recurse
/// through the same encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    Null,
    Bool(bool),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float(f32),
    Double(f64),
    /// Decimal kept in its canonical string form (no lossy float round-trip)
    Decimal(String),
    String(String),
    Bytes(Vec<u8>),
    DateTime(DateTime<Utc>),
    Uuid(Uuid),
    Array(Vec<Value>),
}

impl Value {
    /// Name of the carried primitive, as used for the declared data type
    /// when the transport does not supply one.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Bool(_) => "Boolean",
            Value::Int16(_) => "Int16",
            Value::Int32(_) => "Int32",
            Value::Int64(_) => "Int64",
            Value::UInt16(_) => "UInt16",
            Value::UInt32(_) => "UInt32",
            Value::UInt64(_) => "UInt64",
            Value::Float(_) => "Float",
            Value::Double(_) => "Double",
            Value::Decimal(_) => "Decimal",
            Value::String(_) => "String",
            Value::Bytes(_) => "ByteString",
            Value::DateTime(_) => "DateTime",
            Value::Uuid(_) => "Guid",
            Value::Array(_) => "Array",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// Quality label derived from the OPC UA status code severity bits.
pub fn quality_label(status_code: u32) -> &'static str {
    match status_code >> 30 {
        0 => "good",
        1 => "uncertain",
        _ => "bad",
    }
}

/// One value-change record.
///
/// `timestamp_utc` is stamped at notification-handler entry; `source_timestamp`
/// and `server_timestamp` are carried through from the server when present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub server_id: String,
    pub server_name: String,
    pub timestamp_utc: DateTime<Utc>,
    pub node_id: String,
    pub display_name: String,
    pub browse_path: String,
    pub data_type: String,
    pub value: Value,
    pub status_code: u32,
    pub quality: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_timestamp: Option<DateTime<Utc>>,
}

/// Build a fully-populated sample for unit tests.
#[cfg(test)]
pub(crate) fn make_sample(server_id: &str, node_id: &str, value: Value) -> Sample {
    use chrono::TimeZone;

    Sample {
        server_id: server_id.to_string(),
        server_name: format!("{} (plant)", server_id),
        timestamp_utc: Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap(),
        node_id: node_id.to_string(),
        display_name: "Temperature".to_string(),
        browse_path: "Plant/Line1/Temperature".to_string(),
        data_type: value.type_name().to_string(),
        status_code: 0,
        quality: quality_label(0).to_string(),
        value,
        source_timestamp: Some(Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 52).unwrap()),
        server_timestamp: None,
    }
}

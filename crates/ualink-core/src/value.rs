//! Typed values exchanged with the protocol layer.
//!
//! A write payload is decided once, during literal parsing, and then only pattern-matched.

use crate::types::StatusCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Text with an optional locale, e.g. `en-US|Pump running`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LocalizedText {
    pub locale: String,
    pub text: String,
}

impl LocalizedText {
    pub fn new(locale: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            locale: locale.into(),
            text: text.into(),
        }
    }
}

/// A scalar or one-dimensional array value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Variant {
    #[default]
    Empty,
    Boolean(bool),
    SByte(i8),
    Byte(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float(f32),
    Double(f64),
    String(String),
    DateTime(DateTime<Utc>),
    LocalizedText(LocalizedText),
    ByteString(Vec<u8>),
    /// Node ids read back from `NodeId`/`DataType` attributes
    NodeId(String),
    Array(ArrayValue),
}

/// Homogeneous array payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "element", content = "values")]
pub enum ArrayValue {
    Boolean(Vec<bool>),
    SByte(Vec<i8>),
    Byte(Vec<u8>),
    Int16(Vec<i16>),
    UInt16(Vec<u16>),
    Int32(Vec<i32>),
    UInt32(Vec<u32>),
    Int64(Vec<i64>),
    UInt64(Vec<u64>),
    Float(Vec<f32>),
    Double(Vec<f64>),
    String(Vec<String>),
    DateTime(Vec<DateTime<Utc>>),
    LocalizedText(Vec<LocalizedText>),
    ByteString(Vec<Vec<u8>>),
}

impl ArrayValue {
    pub fn len(&self) -> usize {
        match self {
            ArrayValue::Boolean(v) => v.len(),
            ArrayValue::SByte(v) => v.len(),
            ArrayValue::Byte(v) => v.len(),
            ArrayValue::Int16(v) => v.len(),
            ArrayValue::UInt16(v) => v.len(),
            ArrayValue::Int32(v) => v.len(),
            ArrayValue::UInt32(v) => v.len(),
            ArrayValue::Int64(v) => v.len(),
            ArrayValue::UInt64(v) => v.len(),
            ArrayValue::Float(v) => v.len(),
            ArrayValue::Double(v) => v.len(),
            ArrayValue::String(v) => v.len(),
            ArrayValue::DateTime(v) => v.len(),
            ArrayValue::LocalizedText(v) => v.len(),
            ArrayValue::ByteString(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Builtin type name of the elements.
    pub fn element_type(&self) -> &'static str {
        match self {
            ArrayValue::Boolean(_) => "Boolean",
            ArrayValue::SByte(_) => "SByte",
            ArrayValue::Byte(_) => "Byte",
            ArrayValue::Int16(_) => "Int16",
            ArrayValue::UInt16(_) => "UInt16",
            ArrayValue::Int32(_) => "Int32",
            ArrayValue::UInt32(_) => "UInt32",
            ArrayValue::Int64(_) => "Int64",
            ArrayValue::UInt64(_) => "UInt64",
            ArrayValue::Float(_) => "Float",
            ArrayValue::Double(_) => "Double",
            ArrayValue::String(_) => "String",
            ArrayValue::DateTime(_) => "DateTime",
            ArrayValue::LocalizedText(_) => "LocalizedText",
            ArrayValue::ByteString(_) => "ByteString",
        }
    }
}

impl Variant {
    /// Builtin type name of the value; arrays get a `[]` suffix.
    pub fn type_name(&self) -> String {
        let name = match self {
            Variant::Empty => "Null",
            Variant::Boolean(_) => "Boolean",
            Variant::SByte(_) => "SByte",
            Variant::Byte(_) => "Byte",
            Variant::Int16(_) => "Int16",
            Variant::UInt16(_) => "UInt16",
            Variant::Int32(_) => "Int32",
            Variant::UInt32(_) => "UInt32",
            Variant::Int64(_) => "Int64",
            Variant::UInt64(_) => "UInt64",
            Variant::Float(_) => "Float",
            Variant::Double(_) => "Double",
            Variant::String(_) => "String",
            Variant::DateTime(_) => "DateTime",
            Variant::LocalizedText(_) => "LocalizedText",
            Variant::ByteString(_) => "ByteString",
            Variant::NodeId(_) => "NodeId",
            Variant::Array(array) => return format!("{}[]", array.element_type()),
        };
        name.to_string()
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Variant::Array(_))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Variant::Empty)
    }

    /// Wraps a scalar into a one-element array of the same type.
    pub fn into_single_element_array(self) -> Option<Variant> {
        let array = match self {
            Variant::Boolean(v) => ArrayValue::Boolean(vec![v]),
            Variant::SByte(v) => ArrayValue::SByte(vec![v]),
            Variant::Byte(v) => ArrayValue::Byte(vec![v]),
            Variant::Int16(v) => ArrayValue::Int16(vec![v]),
            Variant::UInt16(v) => ArrayValue::UInt16(vec![v]),
            Variant::Int32(v) => ArrayValue::Int32(vec![v]),
            Variant::UInt32(v) => ArrayValue::UInt32(vec![v]),
            Variant::Int64(v) => ArrayValue::Int64(vec![v]),
            Variant::UInt64(v) => ArrayValue::UInt64(vec![v]),
            Variant::Float(v) => ArrayValue::Float(vec![v]),
            Variant::Double(v) => ArrayValue::Double(vec![v]),
            Variant::String(v) => ArrayValue::String(vec![v]),
            Variant::DateTime(v) => ArrayValue::DateTime(vec![v]),
            Variant::LocalizedText(v) => ArrayValue::LocalizedText(vec![v]),
            Variant::ByteString(v) => ArrayValue::ByteString(vec![v]),
            Variant::Empty | Variant::NodeId(_) | Variant::Array(_) => return None,
        };
        Some(Variant::Array(array))
    }

    /// Integer view of the value, used for attributes such as value rank.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Variant::SByte(v) => Some(v as i64),
            Variant::Byte(v) => Some(v as i64),
            Variant::Int16(v) => Some(v as i64),
            Variant::UInt16(v) => Some(v as i64),
            Variant::Int32(v) => Some(v as i64),
            Variant::UInt32(v) => Some(v as i64),
            Variant::Int64(v) => Some(v),
            Variant::UInt64(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    /// Text view of string-like values.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Variant::String(s) | Variant::NodeId(s) => Some(s),
            Variant::LocalizedText(lt) => Some(&lt.text),
            _ => None,
        }
    }
}

/// A value with its status and source timestamp.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DataValue {
    pub value: Variant,
    pub status: StatusCode,
    pub source_timestamp: Option<DateTime<Utc>>,
}

impl DataValue {
    pub fn new(value: Variant) -> Self {
        Self {
            value,
            status: StatusCode::GOOD,
            source_timestamp: Some(Utc::now()),
        }
    }

    pub fn bad(status: StatusCode) -> Self {
        Self {
            value: Variant::Empty,
            status,
            source_timestamp: None,
        }
    }
}

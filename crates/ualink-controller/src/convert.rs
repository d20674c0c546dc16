//! Literal parsing and value formatting.
//!
//! Type names are matched case-insensitively and accept the usual aliases
//! (`bool`, `float32`, `float64`). Integer parsing is range checked, so an
//! out-of-range literal is a `WriteError::Conversion` rather than a wrap.

use chrono::{DateTime, NaiveDateTime, Utc};
use ualink_core::error::WriteError;
use ualink_core::value::{ArrayValue, LocalizedText, Variant};

/// Trimmed, lowercase form of a type name.
pub fn normalize_type(data_type: &str) -> String {
    data_type.trim().to_ascii_lowercase()
}

/// Converts a text literal to a scalar of the named type.
pub fn parse_literal(data_type: &str, literal: &str) -> Result<Variant, WriteError> {
    let conversion = |reason: &dyn std::fmt::Display| WriteError::conversion(data_type, literal, reason);
    let trimmed = literal.trim();

    let value = match normalize_type(data_type).as_str() {
        "boolean" | "bool" => Variant::Boolean(parse_bool(trimmed).ok_or_else(|| {
            conversion(&"expected true, false, 1 or 0")
        })?),
        "sbyte" => Variant::SByte(trimmed.parse().map_err(|e| conversion(&e))?),
        "byte" => Variant::Byte(trimmed.parse().map_err(|e| conversion(&e))?),
        "int16" => Variant::Int16(trimmed.parse().map_err(|e| conversion(&e))?),
        "uint16" => Variant::UInt16(trimmed.parse().map_err(|e| conversion(&e))?),
        "int32" => Variant::Int32(trimmed.parse().map_err(|e| conversion(&e))?),
        "uint32" => Variant::UInt32(trimmed.parse().map_err(|e| conversion(&e))?),
        "int64" => Variant::Int64(trimmed.parse().map_err(|e| conversion(&e))?),
        "uint64" => Variant::UInt64(trimmed.parse().map_err(|e| conversion(&e))?),
        "float" | "float32" => {
            let wide: f64 = trimmed.parse().map_err(|e| conversion(&e))?;
            let narrow = wide as f32;
            if wide.is_finite() && !narrow.is_finite() {
                return Err(conversion(&"value out of range for Float"));
            }
            Variant::Float(narrow)
        }
        "double" | "float64" => Variant::Double(trimmed.parse().map_err(|e| conversion(&e))?),
        "datetime" => Variant::DateTime(parse_datetime(trimmed).ok_or_else(|| {
            conversion(&"expected now, RFC 3339 or YYYY-MM-DD HH:MM:SS[.mmm]")
        })?),
        "localizedtext" => Variant::LocalizedText(parse_localized_text(literal)),
        "string" => Variant::String(literal.to_string()),
        "bytestring" => Variant::ByteString(parse_bytestring(literal)),
        _ => {
            return Err(WriteError::UnsupportedType {
                data_type: data_type.to_string(),
            })
        }
    };
    Ok(value)
}

fn parse_bool(literal: &str) -> Option<bool> {
    match literal.to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

fn parse_datetime(literal: &str) -> Option<DateTime<Utc>> {
    if literal.eq_ignore_ascii_case("now") {
        return Some(Utc::now());
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(literal) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(literal, format).ok())
        .map(|naive| naive.and_utc())
}

/// `locale|text`, or plain text with no locale.
fn parse_localized_text(literal: &str) -> LocalizedText {
    match literal.split_once('|') {
        Some((locale, text)) => LocalizedText::new(locale.trim(), text.trim()),
        None => LocalizedText::new("", literal),
    }
}

/// Interprets a ByteString literal.
///
/// Accepted forms include `4345de`, `43 45 DE`, `0x43,0x45,0xDE`, `hex:43 45 DE`
/// and `ascii:abcd`. Input that is not valid hex is taken as raw bytes.
pub fn parse_bytestring(literal: &str) -> Vec<u8> {
    let trimmed = literal.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let lower = trimmed.to_ascii_lowercase();
    if lower.starts_with("ascii:") || lower.starts_with("text:") {
        let (_, rest) = trimmed.split_once(':').unwrap_or(("", trimmed));
        return rest.trim().as_bytes().to_vec();
    }

    let body = if lower.starts_with("hex:") {
        trimmed[4..].trim()
    } else {
        trimmed
    };

    let digits: String = body
        .split(|c: char| c.is_whitespace() || matches!(c, ',' | ';' | ':'))
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.strip_prefix("0x")
                .or_else(|| part.strip_prefix("0X"))
                .unwrap_or(part)
        })
        .collect();

    if digits.len() % 2 == 0 {
        if let Ok(bytes) = hex::decode(&digits) {
            return bytes;
        }
    }
    literal.as_bytes().to_vec()
}

macro_rules! gather {
    ($items:expr, $kind:ident) => {
        ArrayValue::$kind(
            $items
                .into_iter()
                .filter_map(|value| match value {
                    Variant::$kind(inner) => Some(inner),
                    _ => None,
                })
                .collect(),
        )
    };
}

/// Parses `[a, b, c]` (brackets optional) into a typed array.
pub fn parse_array(element_type: &str, literal: &str) -> Result<Variant, WriteError> {
    let body = literal.trim();
    let body = body.strip_prefix('[').unwrap_or(body);
    let body = body.strip_suffix(']').unwrap_or(body);
    let items: Vec<&str> = body
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .collect();

    let kind = normalize_type(element_type);
    let supported = matches!(
        kind.as_str(),
        "float" | "float32" | "double" | "float64" | "int16" | "uint16" | "int32" | "uint32"
            | "int64" | "uint64" | "boolean" | "bool" | "string" | "localizedtext" | "datetime"
    );
    if !supported {
        return Err(WriteError::UnsupportedArrayType {
            data_type: element_type.to_string(),
        });
    }
    if items.is_empty() {
        return Err(WriteError::conversion(element_type, literal, "empty array input"));
    }

    let values = items
        .iter()
        .map(|item| parse_literal(element_type, item))
        .collect::<Result<Vec<_>, _>>()?;

    let array = match kind.as_str() {
        "float" | "float32" => gather!(values, Float),
        "double" | "float64" => gather!(values, Double),
        "int16" => gather!(values, Int16),
        "uint16" => gather!(values, UInt16),
        "int32" => gather!(values, Int32),
        "uint32" => gather!(values, UInt32),
        "int64" => gather!(values, Int64),
        "uint64" => gather!(values, UInt64),
        "boolean" | "bool" => gather!(values, Boolean),
        "string" => gather!(values, String),
        "localizedtext" => gather!(values, LocalizedText),
        _ => gather!(values, DateTime),
    };
    Ok(Variant::Array(array))
}

/// Type name to parse with when the current value of a scalar is known.
///
/// Only numeric and boolean kinds are trusted; anything else defers to the
/// declared type.
pub fn preferred_scalar_type(current: &Variant) -> Option<&'static str> {
    match current {
        Variant::Float(_) => Some("float"),
        Variant::Double(_) => Some("double"),
        Variant::Int16(_) => Some("int16"),
        Variant::Int32(_) => Some("int32"),
        Variant::Int64(_) => Some("int64"),
        Variant::UInt16(_) => Some("uint16"),
        Variant::UInt32(_) => Some("uint32"),
        Variant::UInt64(_) => Some("uint64"),
        Variant::Boolean(_) => Some("boolean"),
        _ => None,
    }
}

/// Formats a value for display, taking the declared data type into account.
pub fn format_value(value: &Variant, data_type: &str) -> String {
    match value {
        Variant::Empty => String::new(),
        Variant::ByteString(bytes) => format_bytes(bytes, data_type),
        Variant::Array(array) => format!("[{}]", format_array(array).join(" ")),
        other => format_scalar(other),
    }
}

fn format_bytes(bytes: &[u8], data_type: &str) -> String {
    if data_type.eq_ignore_ascii_case("string") {
        String::from_utf8_lossy(bytes).into_owned()
    } else if data_type.eq_ignore_ascii_case("bytestring") {
        hex::encode(bytes)
    } else {
        bytes
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn format_datetime(value: &DateTime<Utc>) -> String {
    value.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

fn format_scalar(value: &Variant) -> String {
    match value {
        Variant::Empty => String::new(),
        Variant::Boolean(v) => v.to_string(),
        Variant::SByte(v) => v.to_string(),
        Variant::Byte(v) => v.to_string(),
        Variant::Int16(v) => v.to_string(),
        Variant::UInt16(v) => v.to_string(),
        Variant::Int32(v) => v.to_string(),
        Variant::UInt32(v) => v.to_string(),
        Variant::Int64(v) => v.to_string(),
        Variant::UInt64(v) => v.to_string(),
        Variant::Float(v) => v.to_string(),
        Variant::Double(v) => v.to_string(),
        Variant::String(v) | Variant::NodeId(v) => v.clone(),
        Variant::DateTime(v) => format_datetime(v),
        Variant::LocalizedText(v) => v.text.clone(),
        Variant::ByteString(v) => format_bytes(v, ""),
        Variant::Array(array) => format!("[{}]", format_array(array).join(" ")),
    }
}

fn format_array(array: &ArrayValue) -> Vec<String> {
    fn each<T: ToString>(values: &[T]) -> Vec<String> {
        values.iter().map(ToString::to_string).collect()
    }
    match array {
        ArrayValue::Boolean(v) => each(v),
        ArrayValue::SByte(v) => each(v),
        ArrayValue::Byte(v) => each(v),
        ArrayValue::Int16(v) => each(v),
        ArrayValue::UInt16(v) => each(v),
        ArrayValue::Int32(v) => each(v),
        ArrayValue::UInt32(v) => each(v),
        ArrayValue::Int64(v) => each(v),
        ArrayValue::UInt64(v) => each(v),
        ArrayValue::Float(v) => each(v),
        ArrayValue::Double(v) => each(v),
        ArrayValue::String(v) => v.clone(),
        ArrayValue::DateTime(v) => v.iter().map(format_datetime).collect(),
        ArrayValue::LocalizedText(v) => v.iter().map(|lt| lt.text.clone()).collect(),
        ArrayValue::ByteString(v) => v.iter().map(|bytes| format_bytes(bytes, "")).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn test_parse_integers_with_range_checks() {
        assert_eq!(parse_literal("Int32", "42").unwrap(), Variant::Int32(42));
        assert_eq!(parse_literal("uint16", " 65535 ").unwrap(), Variant::UInt16(65535));
        assert_eq!(parse_literal("SByte", "-128").unwrap(), Variant::SByte(-128));

        assert!(matches!(
            parse_literal("Int16", "40000"),
            Err(WriteError::Conversion { .. })
        ));
        assert!(matches!(
            parse_literal("Byte", "-1"),
            Err(WriteError::Conversion { .. })
        ));
        assert!(matches!(
            parse_literal("float", "1e40"),
            Err(WriteError::Conversion { .. })
        ));
    }

    #[test]
    fn test_parse_boolean() {
        assert_eq!(parse_literal("Boolean", "TRUE").unwrap(), Variant::Boolean(true));
        assert_eq!(parse_literal("bool", "0").unwrap(), Variant::Boolean(false));
        assert!(parse_literal("Boolean", "yes").is_err());
    }

    #[test]
    fn test_parse_datetime_layouts() {
        let Variant::DateTime(value) = parse_literal("DateTime", "2024-03-01T12:30:00Z").unwrap() else {
            panic!("expected DateTime");
        };
        assert_eq!((value.year(), value.month(), value.hour()), (2024, 3, 12));

        let Variant::DateTime(value) = parse_literal("datetime", "2024-03-01 08:15:30.250").unwrap() else {
            panic!("expected DateTime");
        };
        assert_eq!(value.timestamp_subsec_millis(), 250);

        assert!(parse_literal("datetime", "now").is_ok());
        assert!(parse_literal("datetime", "yesterday").is_err());
    }

    #[test]
    fn test_parse_localized_text() {
        assert_eq!(
            parse_literal("LocalizedText", "en-US | Pump running").unwrap(),
            Variant::LocalizedText(LocalizedText::new("en-US", "Pump running"))
        );
        assert_eq!(
            parse_literal("LocalizedText", "plain").unwrap(),
            Variant::LocalizedText(LocalizedText::new("", "plain"))
        );
    }

    #[test]
    fn test_unsupported_type() {
        assert!(matches!(
            parse_literal("Guid", "x"),
            Err(WriteError::UnsupportedType { .. })
        ));
    }

    #[test]
    fn test_bytestring_forms_are_equivalent() {
        let expected = vec![0x43, 0x45, 0xDE];
        for literal in [
            "4345de",
            "43 45 DE",
            "0x43 0x45 0xDE",
            "0x43,0x45,0xDE",
            "43,45,DE",
            "hex:4345de",
            "hex:43 45 DE",
            "43;45:de",
        ] {
            assert_eq!(parse_bytestring(literal), expected, "literal {:?}", literal);
        }
    }

    #[test]
    fn test_bytestring_text_and_fallback() {
        assert_eq!(parse_bytestring(""), Vec::<u8>::new());
        assert_eq!(parse_bytestring("ascii:abcd"), b"abcd".to_vec());
        assert_eq!(parse_bytestring("TEXT: hi"), b"hi".to_vec());
        // Odd length and non-hex input keep the original bytes
        assert_eq!(parse_bytestring("abc"), b"abc".to_vec());
        assert_eq!(parse_bytestring("zz yy"), b"zz yy".to_vec());
    }

    #[test]
    fn test_parse_array() {
        assert_eq!(
            parse_array("Double", "[1, 2.5, 3]").unwrap(),
            Variant::Array(ArrayValue::Double(vec![1.0, 2.5, 3.0]))
        );
        assert_eq!(
            parse_array("boolean", "true,0").unwrap(),
            Variant::Array(ArrayValue::Boolean(vec![true, false]))
        );
        assert!(matches!(
            parse_array("ByteString", "[01, 02]"),
            Err(WriteError::UnsupportedArrayType { .. })
        ));
        assert!(matches!(
            parse_array("Int32", "[]"),
            Err(WriteError::Conversion { .. })
        ));
        assert!(matches!(
            parse_array("Int16", "[1, 99999]"),
            Err(WriteError::Conversion { .. })
        ));
    }

    #[test]
    fn test_preferred_scalar_type() {
        assert_eq!(preferred_scalar_type(&Variant::Float(1.0)), Some("float"));
        assert_eq!(preferred_scalar_type(&Variant::String("x".into())), None);
    }

    #[test]
    fn test_format_value() {
        let bytes = Variant::ByteString(vec![0xDE, 0xAD]);
        assert_eq!(format_value(&bytes, "ByteString"), "dead");
        assert_eq!(format_value(&bytes, "Variant"), "DE AD");
        assert_eq!(
            format_value(&Variant::ByteString(b"ok".to_vec()), "String"),
            "ok"
        );
        assert_eq!(format_value(&Variant::Float(12.5), "Float"), "12.5");
        assert_eq!(
            format_value(&Variant::Array(ArrayValue::Int32(vec![1, 2])), "Int32"),
            "[1 2]"
        );
        assert_eq!(format_value(&Variant::Empty, "Int32"), "");
    }
}

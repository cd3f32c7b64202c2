//! Coercion des valeurs non typées selon le type déclaré de la colonne
//!
//! Une valeur rejetée donne `None` : l'attribut est omis, l'enregistrement est conservé.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;

use crate::{ColumnType, SqlValue};

const TRUE_TOKENS: &[&str] = &["t", "true", "y", "yes", "on", "1"];
const FALSE_TOKENS: &[&str] = &["f", "false", "n", "no", "off", "0"];

/// Formats date/heure acceptés en plus du RFC 3339
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// Convertit une valeur source vers le type de la colonne
pub fn coerce(value: &Value, kind: &ColumnType) -> Option<SqlValue> {
    if value.is_null() {
        return None;
    }

    match kind {
        ColumnType::Text => {
            let text = to_text(value);
            (!text.is_empty()).then_some(SqlValue::Text(text))
        }
        ColumnType::DoublePrecision => to_double(value).map(SqlValue::Double),
        ColumnType::Integer => to_integer(value)
            .and_then(|v| i32::try_from(v).ok())
            .map(SqlValue::Integer),
        ColumnType::BigInt => to_integer(value)
            .and_then(|v| i64::try_from(v).ok())
            .map(SqlValue::BigInt),
        ColumnType::TimestampTz => to_datetime(value).map(SqlValue::TimestampTz),
        ColumnType::Timestamp => to_datetime(value).map(|dt| SqlValue::Timestamp(dt.naive_utc())),
        ColumnType::Boolean => to_boolean(value).map(SqlValue::Boolean),
        ColumnType::Unsupported(_) => None,
    }
}

/// Représentation texte d'une valeur scalaire
pub fn to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(u) = n.as_u64() {
                u.to_string()
            } else {
                // 1.0 s'écrit "1"
                n.as_f64().map(|f| f.to_string()).unwrap_or_default()
            }
        }
        Value::Array(items) => items
            .iter()
            .map(to_text)
            .collect::<Vec<_>>()
            .join(","),
        Value::Object(_) => value.to_string(),
    }
}

fn to_double(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        other => parse_float_prefix(&to_text(other)),
    };
    parsed.filter(|f| !f.is_nan())
}

/// Lit le plus long préfixe décimal d'une chaîne (`"12.5 m"` → 12.5)
pub fn parse_float_prefix(input: &str) -> Option<f64> {
    let s = input.trim_start();
    let (negative, unsigned) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };

    if unsigned.starts_with("Infinity") {
        return Some(if negative {
            f64::NEG_INFINITY
        } else {
            f64::INFINITY
        });
    }

    let bytes = unsigned.as_bytes();
    let starts_numeric = match bytes {
        [d, ..] if d.is_ascii_digit() => true,
        [b'.', d, ..] if d.is_ascii_digit() => true,
        _ => false,
    };
    if !starts_numeric {
        return None;
    }

    let (parsed, _consumed) = fast_float::parse_partial::<f64, _>(unsigned).ok()?;
    Some(if negative { -parsed } else { parsed })
}

fn to_integer(value: &Value) -> Option<i128> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i128::from(i))
            } else if let Some(u) = n.as_u64() {
                Some(i128::from(u))
            } else {
                n.as_f64()
                    .filter(|f| f.is_finite() && f.abs() < 1e21)
                    .map(|f| f.trunc() as i128)
            }
        }
        other => parse_int_prefix(&to_text(other)),
    }
}

/// Lit le plus long préfixe entier en base 10 (`"42abc"` → 42)
pub fn parse_int_prefix(input: &str) -> Option<i128> {
    let s = input.trim_start();
    let (negative, unsigned) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };

    let mut acc: i128 = 0;
    let mut digits = 0usize;
    for b in unsigned.bytes().take_while(u8::is_ascii_digit) {
        acc = acc.checked_mul(10)?.checked_add(i128::from(b - b'0'))?;
        digits += 1;
    }

    if digits == 0 {
        return None;
    }
    Some(if negative { -acc } else { acc })
}

fn to_datetime(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let millis = n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))?;
            DateTime::from_timestamp_millis(millis)
        }
        Value::String(s) => parse_timestamp(s),
        _ => None,
    }
}

/// Interprète une date/heure ; les valeurs sans fuseau sont lues en UTC
pub fn parse_timestamp(input: &str) -> Option<DateTime<Utc>> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    for format in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }

    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn to_boolean(value: &Value) -> Option<bool> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(*b),
        Value::Number(n) => Some(n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan())),
        Value::String(s) => {
            if s == "NULL" {
                return None;
            }
            let token = s.trim().to_lowercase();
            if TRUE_TOKENS.contains(&token.as_str()) {
                Some(true)
            } else if FALSE_TOKENS.contains(&token.as_str()) {
                Some(false)
            } else {
                None
            }
        }
        Value::Array(_) | Value::Object(_) => Some(true),
    }
}

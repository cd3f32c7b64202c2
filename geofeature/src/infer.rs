//! Inférence du schéma initial d'une table à partir d'un échantillon de features

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::coerce::parse_timestamp;
use crate::{ColumnType, Feature};

/// Genre observé d'une valeur, ordonné pour l'élargissement numérique
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Observed {
    Integer,
    BigInt,
    Double,
    Boolean,
    Timestamp,
    Text,
}

impl Observed {
    fn is_numeric(self) -> bool {
        matches!(self, Self::Integer | Self::BigInt | Self::Double)
    }

    fn merge(self, other: Self) -> Self {
        if self == other {
            self
        } else if self.is_numeric() && other.is_numeric() {
            self.max(other)
        } else {
            Self::Text
        }
    }

    fn column_type(self) -> ColumnType {
        match self {
            Self::Integer => ColumnType::Integer,
            Self::BigInt => ColumnType::BigInt,
            Self::Double => ColumnType::DoublePrecision,
            Self::Boolean => ColumnType::Boolean,
            Self::Timestamp => ColumnType::TimestampTz,
            Self::Text => ColumnType::Text,
        }
    }
}

fn integer_pattern() -> &'static Regex {
    static INTEGER: OnceLock<Regex> = OnceLock::new();
    INTEGER.get_or_init(|| Regex::new(r"^-?(0|[1-9][0-9]*)$").expect("static regex"))
}

fn decimal_pattern() -> &'static Regex {
    static DECIMAL: OnceLock<Regex> = OnceLock::new();
    DECIMAL.get_or_init(|| {
        Regex::new(r"^-?(0|[1-9][0-9]*)(\.[0-9]+)?([eE][+-]?[0-9]+)?$").expect("static regex")
    })
}

fn date_prefix_pattern() -> &'static Regex {
    static DATE: OnceLock<Regex> = OnceLock::new();
    DATE.get_or_init(|| Regex::new(r"^\d{4}-\d{2}-\d{2}").expect("static regex"))
}

fn classify_integer(value: i128) -> Observed {
    if i32::try_from(value).is_ok() {
        Observed::Integer
    } else if i64::try_from(value).is_ok() {
        Observed::BigInt
    } else {
        Observed::Double
    }
}

fn observe(value: &Value) -> Option<Observed> {
    match value {
        Value::Null => None,
        Value::Bool(_) => Some(Observed::Boolean),
        Value::Number(n) => Some(if let Some(i) = n.as_i64() {
            classify_integer(i128::from(i))
        } else if let Some(u) = n.as_u64() {
            classify_integer(i128::from(u))
        } else {
            Observed::Double
        }),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                None
            } else if integer_pattern().is_match(s) {
                Some(s.parse::<i128>().map_or(Observed::Double, classify_integer))
            } else if decimal_pattern().is_match(s) {
                Some(Observed::Double)
            } else if date_prefix_pattern().is_match(s) && parse_timestamp(s).is_some() {
                Some(Observed::Timestamp)
            } else {
                Some(Observed::Text)
            }
        }
        Value::Array(_) | Value::Object(_) => Some(Observed::Text),
    }
}

/// Infère les colonnes à créer, dans l'ordre de première apparition
///
/// Les clés présentes dans `excluded` (colonnes internes) sont ignorées.
pub fn infer_columns(features: &[Feature], excluded: &[&str]) -> Vec<(String, ColumnType)> {
    let mut order: Vec<String> = Vec::new();
    let mut observed: HashMap<String, Option<Observed>> = HashMap::new();

    for feature in features {
        for (key, value) in &feature.properties {
            if excluded.contains(&key.as_str()) {
                continue;
            }
            let slot = observed.entry(key.clone()).or_insert_with(|| {
                order.push(key.clone());
                None
            });
            if let Some(kind) = observe(value) {
                *slot = Some(match *slot {
                    Some(previous) => previous.merge(kind),
                    None => kind,
                });
            }
        }
    }

    order
        .into_iter()
        .map(|key| {
            let kind = observed
                .get(&key)
                .copied()
                .flatten()
                .map_or(ColumnType::Text, Observed::column_type);
            (key, kind)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Properties;
    use serde_json::json;

    fn features(rows: Vec<Value>) -> Vec<Feature> {
        rows.into_iter()
            .map(|row| match row {
                Value::Object(map) => Feature::new(map, None),
                _ => Feature::new(Properties::new(), None),
            })
            .collect()
    }

    fn kind_of(columns: &[(String, ColumnType)], name: &str) -> ColumnType {
        columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, k)| k.clone())
            .unwrap()
    }

    #[test]
    fn test_scalar_kinds() {
        let cols = infer_columns(
            &features(vec![json!({
                "name": "Lyon",
                "pop": 513275,
                "big": 9000000000i64,
                "area": 47.87,
                "capital": false,
                "founded": "2024-01-15T00:00:00Z"
            })]),
            &[],
        );

        assert_eq!(kind_of(&cols, "name"), ColumnType::Text);
        assert_eq!(kind_of(&cols, "pop"), ColumnType::Integer);
        assert_eq!(kind_of(&cols, "big"), ColumnType::BigInt);
        assert_eq!(kind_of(&cols, "area"), ColumnType::DoublePrecision);
        assert_eq!(kind_of(&cols, "capital"), ColumnType::Boolean);
        assert_eq!(kind_of(&cols, "founded"), ColumnType::TimestampTz);
    }

    #[test]
    fn test_numeric_widening() {
        let cols = infer_columns(
            &features(vec![
                json!({"v": 1, "w": 1}),
                json!({"v": 2.5, "w": 3000000000i64}),
            ]),
            &[],
        );
        assert_eq!(kind_of(&cols, "v"), ColumnType::DoublePrecision);
        assert_eq!(kind_of(&cols, "w"), ColumnType::BigInt);
    }

    #[test]
    fn test_numeric_strings() {
        let cols = infer_columns(
            &features(vec![json!({"code": "007", "n": "42", "d": "3.5", "z": "0"})]),
            &[],
        );
        assert_eq!(kind_of(&cols, "code"), ColumnType::Text);
        assert_eq!(kind_of(&cols, "n"), ColumnType::Integer);
        assert_eq!(kind_of(&cols, "d"), ColumnType::DoublePrecision);
        assert_eq!(kind_of(&cols, "z"), ColumnType::Integer);
    }

    #[test]
    fn test_mixed_kinds_fall_back_to_text() {
        let cols = infer_columns(
            &features(vec![json!({"m": true}), json!({"m": 1}), json!({"n": null})]),
            &[],
        );
        assert_eq!(kind_of(&cols, "m"), ColumnType::Text);
        assert_eq!(kind_of(&cols, "n"), ColumnType::Text);
    }

    #[test]
    fn test_order_and_exclusions() {
        let cols = infer_columns(
            &features(vec![
                json!({"b": 1, "row_id": 5}),
                json!({"a": "x", "b": 2}),
            ]),
            &["row_id"],
        );
        let names: Vec<&str> = cols.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
    }
}

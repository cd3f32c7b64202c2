//! Types de données pour le crate geofeature

use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use geo::Geometry;
use serde_json::Value;

use crate::FeatureError;

/// Attributs d'une feature, dans l'ordre de la source
pub type Properties = serde_json::Map<String, Value>;

/// Une feature source : attributs non typés et géométrie optionnelle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Feature {
    /// Attributs (scalaires ou null)
    pub properties: Properties,

    /// Géométrie, absente pour les lignes purement tabulaires
    pub geometry: Option<Geometry>,
}

impl Feature {
    pub fn new(properties: Properties, geometry: Option<Geometry>) -> Self {
        Self {
            properties,
            geometry,
        }
    }

    /// Construit une feature depuis une feature GeoJSON
    ///
    /// `index` sert uniquement au message d'erreur.
    pub fn from_geojson(feature: geojson::Feature, index: usize) -> Result<Self, FeatureError> {
        let geometry = match feature.geometry {
            Some(geometry) => Some(
                Geometry::<f64>::try_from(geometry)
                    .map_err(|e| FeatureError::invalid_geometry(index, e.to_string()))?,
            ),
            None => None,
        };

        Ok(Self {
            properties: feature.properties.unwrap_or_default(),
            geometry,
        })
    }
}

/// Type déclaré d'une colonne, tel que lu dans le catalogue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    DoublePrecision,
    Integer,
    BigInt,
    /// `timestamp with time zone`
    TimestampTz,
    /// `timestamp without time zone`
    Timestamp,
    Boolean,
    /// Tout autre type : les valeurs sont toujours rejetées
    Unsupported(String),
}

impl ColumnType {
    /// Interprète le `data_type` de `information_schema.columns`
    pub fn from_declared(declared: &str) -> Self {
        match declared.trim().to_ascii_lowercase().as_str() {
            "text" | "character" | "character varying" => Self::Text,
            "double precision" => Self::DoublePrecision,
            "integer" => Self::Integer,
            "bigint" => Self::BigInt,
            "timestamp with time zone" => Self::TimestampTz,
            "timestamp without time zone" | "timestamp" => Self::Timestamp,
            "boolean" => Self::Boolean,
            other => Self::Unsupported(other.to_string()),
        }
    }

    /// Nom SQL utilisé pour créer la colonne
    pub fn sql_name(&self) -> Result<&'static str, FeatureError> {
        match self {
            Self::Text => Ok("text"),
            Self::DoublePrecision => Ok("double precision"),
            Self::Integer => Ok("integer"),
            Self::BigInt => Ok("bigint"),
            Self::TimestampTz => Ok("timestamp with time zone"),
            Self::Timestamp => Ok("timestamp without time zone"),
            Self::Boolean => Ok("boolean"),
            Self::Unsupported(name) => Err(FeatureError::UnsupportedType(name.clone())),
        }
    }
}

/// Valeur typée prête à être écrite
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Text(String),
    Double(f64),
    Integer(i32),
    BigInt(i64),
    TimestampTz(DateTime<Utc>),
    Timestamp(NaiveDateTime),
    Boolean(bool),
}

/// Colonne d'une table cible
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    /// Type tel que déclaré dans le catalogue
    pub declared: String,
    pub kind: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, declared: impl Into<String>) -> Self {
        let declared = declared.into();
        Self {
            name: name.into(),
            kind: ColumnType::from_declared(&declared),
            declared,
        }
    }
}

/// Schéma découvert d'une table (colonnes utilisateur, ordre du catalogue)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableSchema {
    columns: Vec<Column>,
    positions: HashMap<String, usize>,
    /// SRID de la colonne géométrie, `None` si la table n'en a pas
    geometry_srid: Option<i32>,
}

impl TableSchema {
    pub fn new(columns: Vec<Column>, geometry_srid: Option<i32>) -> Self {
        let positions = columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.clone(), i))
            .collect();

        Self {
            columns,
            positions,
            geometry_srid,
        }
    }

    /// Construit un schéma depuis des paires (nom, type déclaré)
    pub fn from_pairs<I, N, T>(pairs: I, geometry_srid: Option<i32>) -> Self
    where
        I: IntoIterator<Item = (N, T)>,
        N: Into<String>,
        T: Into<String>,
    {
        let columns = pairs
            .into_iter()
            .map(|(name, declared)| Column::new(name, declared))
            .collect();
        Self::new(columns, geometry_srid)
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, position: usize) -> Option<&Column> {
        self.columns.get(position)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.positions.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.positions.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn has_geometry(&self) -> bool {
        self.geometry_srid.is_some()
    }

    pub fn geometry_srid(&self) -> Option<i32> {
        self.geometry_srid
    }
}

/// Enregistrement validé : valeurs typées indexées par position de colonne
#[derive(Debug, Clone, PartialEq)]
pub struct TypedRecord {
    /// Triées par position dans le schéma
    pub values: Vec<(usize, SqlValue)>,
    pub geometry: Option<Geometry>,
}

impl TypedRecord {
    /// Positions des colonnes renseignées
    pub fn positions(&self) -> Vec<usize> {
        self.values.iter().map(|(p, _)| *p).collect()
    }

    pub fn value(&self, position: usize) -> Option<&SqlValue> {
        self.values
            .binary_search_by_key(&position, |(p, _)| *p)
            .ok()
            .map(|i| &self.values[i].1)
    }
}

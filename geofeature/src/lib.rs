//! # geofeature
//!
//! Préparation de features géographiques avant chargement dans PostGIS.
//!
//! ## Features
//!
//! - Assainissement déterministe des noms de tables et de colonnes
//! - Coercion des attributs selon le type déclaré de la colonne cible
//! - Validation par chargement, avec signalement unique des champs inattendus
//! - Inférence du schéma initial d'une table à partir d'un échantillon
//! - Lecture GeoJSON vers des types `geo`
//!
//! ## Usage
//!
//! ```rust,ignore
//! use geofeature::{parse_geojson, Sanitizer, TableSchema, Validator};
//!
//! let schema = TableSchema::from_pairs([("nom", "text"), ("population", "integer")], Some(4326));
//! let mut sanitizer = Sanitizer::new();
//! let mut validator = Validator::new(schema);
//!
//! for feature in parse_geojson(&text)? {
//!     if let Some(record) = validator.validate(sanitizer.sanitize_feature(feature)) {
//!         println!("{} valeurs", record.values.len());
//!     }
//! }
//! ```

pub mod coerce;
pub mod error;
pub mod infer;
pub mod sanitize;
pub mod source;
pub mod types;
pub mod validator;

pub use coerce::coerce;
pub use error::FeatureError;
pub use infer::infer_columns;
pub use sanitize::{resolve_table_name, sanitize, Sanitizer, MAX_IDENTIFIER_BYTES};
pub use source::{parse_geojson, read_geojson};
pub use types::{Column, ColumnType, Feature, Properties, SqlValue, TableSchema, TypedRecord};
pub use validator::{Validator, ValidatorStats};

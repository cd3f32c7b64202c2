//! # into-postgis
//!
//! Chargement de features géographiques dans des tables PostGIS.
//!
//! ## Features
//!
//! - Trois méthodes : création, ajout, remplacement
//! - Écriture en staging puis swap transactionnel (la cible n'est jamais partiellement chargée)
//! - Validation du schéma et coercion des attributs, avertissement unique par champ inattendu
//! - Chaîne de validation extensible, réparation des géométries toujours en tête
//! - Transport INSERT multi-lignes ou COPY
//! - Nettoyage des tables de staging orphelines
//!
//! ## Usage CLI
//!
//! ```bash
//! # Crée la table "communes" à partir d'un GeoJSON
//! into-postgis load --file communes.geojson --table Communes -c
//!
//! # Remplace son contenu, en COPY
//! into-postgis load --file communes.geojson --table Communes -r --copy
//!
//! # Supprime les staging abandonnées
//! into-postgis cleanup --schema public
//! ```

pub mod config;
pub mod error;
pub mod export;
pub mod loader;
pub mod report;
pub mod validations;

pub use config::LoadSettings;
pub use error::LoadError;
pub use export::pool::{
    create_pool, test_connection, ConnectionOverrides, ConnectionParams, SslMode,
};
pub use export::TableRef;
pub use loader::{
    cleanup_orphans, load, FeatureSink, LoadCompletion, LoadEvent, LoadHandle, LoadMethod,
    LoadOptions, SinkClosed,
};
pub use report::{LoadReport, LoadStatus};
pub use validations::{
    Dedupe, FieldMap, GeometryRepair, MinRows, NotNull, StepConfig, ValidationContext,
    ValidationStep,
};

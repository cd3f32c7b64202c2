//! Types d'erreurs pour le crate geofeature

use thiserror::Error;

/// Erreurs pouvant survenir lors de la préparation des features
#[derive(Debug, Error)]
pub enum FeatureError {
    /// Document GeoJSON illisible
    #[error("Invalid GeoJSON: {0}")]
    GeoJson(#[from] geojson::Error),

    /// Le document ne contient ni Feature ni FeatureCollection
    #[error("Unsupported GeoJSON document: {0}")]
    UnsupportedDocument(String),

    /// Géométrie non convertible vers `geo`
    #[error("Invalid geometry for feature #{index}: {reason}")]
    InvalidGeometry { index: usize, reason: String },

    /// Type de colonne déclaré inconnu
    #[error("Unsupported column type: {0}")]
    UnsupportedType(String),
}

impl FeatureError {
    /// Crée une erreur de géométrie invalide
    pub fn invalid_geometry(index: usize, reason: impl Into<String>) -> Self {
        Self::InvalidGeometry {
            index,
            reason: reason.into(),
        }
    }
}

//! Lecture de documents GeoJSON en features

use std::path::Path;

use geojson::GeoJson;

use crate::{Feature, FeatureError};

/// Convertit un document GeoJSON (FeatureCollection ou Feature) en features
pub fn parse_geojson(text: &str) -> Result<Vec<Feature>, FeatureError> {
    let document: GeoJson = text.parse()?;

    match document {
        GeoJson::FeatureCollection(collection) => collection
            .features
            .into_iter()
            .enumerate()
            .map(|(index, feature)| Feature::from_geojson(feature, index))
            .collect(),
        GeoJson::Feature(feature) => Ok(vec![Feature::from_geojson(feature, 0)?]),
        GeoJson::Geometry(_) => Err(FeatureError::UnsupportedDocument(
            "bare geometry (expected Feature or FeatureCollection)".to_string(),
        )),
    }
}

/// Lit et convertit un fichier GeoJSON
pub fn read_geojson(path: &Path) -> Result<Vec<Feature>, FeatureError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| FeatureError::UnsupportedDocument(format!("{}: {}", path.display(), e)))?;
    parse_geojson(&text)
}

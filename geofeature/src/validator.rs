//! Validation des features contre le schéma découvert d'une table
//!
//! Un `Validator` vit le temps d'un chargement : les champs inattendus ne sont
//! signalés qu'une fois par instance.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::coerce::coerce;
use crate::{Feature, TableSchema, TypedRecord};

/// Compteurs d'un validateur
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidatorStats {
    /// Features reçues
    pub received: u64,
    /// Features écartées (ni attribut ni géométrie après coercion)
    pub dropped: u64,
    /// Valeurs rejetées par la coercion
    pub rejected_values: u64,
}

#[derive(Debug)]
pub struct Validator {
    schema: TableSchema,
    unexpected: HashSet<String>,
    pending_warnings: Vec<String>,
    geometry_warned: bool,
    stats: ValidatorStats,
}

impl Validator {
    pub fn new(schema: TableSchema) -> Self {
        Self {
            schema,
            unexpected: HashSet::new(),
            pending_warnings: Vec::new(),
            geometry_warned: false,
            stats: ValidatorStats::default(),
        }
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Filtre et type une feature
    ///
    /// Retourne `None` si la feature ne porte plus rien à écrire.
    pub fn validate(&mut self, feature: Feature) -> Option<TypedRecord> {
        self.stats.received += 1;

        let mut values = Vec::with_capacity(feature.properties.len());
        for (key, value) in &feature.properties {
            let Some(position) = self.schema.position(key) else {
                self.report_unexpected(key);
                continue;
            };
            let Some(column) = self.schema.column(position) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            match coerce(value, &column.kind) {
                Some(typed) => values.push((position, typed)),
                None => {
                    self.stats.rejected_values += 1;
                    debug!(column = %column.name, declared = %column.declared, "Value rejected by coercion");
                }
            }
        }
        values.sort_unstable_by_key(|(position, _)| *position);

        let geometry = match feature.geometry {
            Some(geometry) if self.schema.has_geometry() => Some(geometry),
            Some(_) => {
                self.report_geometry_dropped();
                None
            }
            None => None,
        };

        if values.is_empty() && geometry.is_none() {
            self.stats.dropped += 1;
            return None;
        }

        Some(TypedRecord { values, geometry })
    }

    fn report_unexpected(&mut self, key: &str) {
        if self.unexpected.contains(key) {
            return;
        }
        self.unexpected.insert(key.to_string());
        let message = format!(
            "An unexpected field \"{}\" was encountered. This field was not uploaded",
            key
        );
        warn!("{}", message);
        self.pending_warnings.push(message);
    }

    fn report_geometry_dropped(&mut self) {
        if self.geometry_warned {
            return;
        }
        self.geometry_warned = true;
        let message =
            "The target table has no geometry column. Geometries were not uploaded".to_string();
        warn!("{}", message);
        self.pending_warnings.push(message);
    }

    /// Récupère les avertissements émis depuis le dernier appel
    pub fn drain_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending_warnings)
    }

    /// Champs inattendus rencontrés (triés)
    pub fn unexpected_fields(&self) -> Vec<&str> {
        let mut fields: Vec<&str> = self.unexpected.iter().map(String::as_str).collect();
        fields.sort_unstable();
        fields
    }

    pub fn stats(&self) -> ValidatorStats {
        self.stats
    }
}

//! Configuration d'un chargement (fichier JSON optionnel)

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::loader::{LoadMethod, LoadOptions};
use crate::validations::StepConfig;

/// Réglages de chargement lus depuis un fichier
///
/// Chaque champ absent garde la valeur des options (CLI ou défauts).
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LoadSettings {
    #[serde(default)]
    pub method: Option<LoadMethod>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub direct: Option<bool>,
    #[serde(default)]
    pub copy: Option<bool>,
    #[serde(default)]
    pub progress_interval: Option<u64>,
    /// SRID des tables créées
    #[serde(default)]
    pub srid: Option<i32>,
    /// Étapes de validation, exécutées après la réparation des géométries
    #[serde(default)]
    pub validations: Vec<StepConfig>,
}

impl LoadSettings {
    /// Charge les réglages depuis un fichier
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read settings file: {}", path.display()))?;

        Self::from_json(&content)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(json).context("Failed to parse settings JSON")?;
        if settings.batch_size == Some(0) {
            anyhow::bail!("batch_size must be greater than 0");
        }
        Ok(settings)
    }

    /// Applique les réglages sur des options existantes
    pub fn apply(self, options: &mut LoadOptions) {
        if let Some(method) = self.method {
            options.method = method;
        }
        if let Some(batch_size) = self.batch_size {
            options.batch_size = batch_size;
        }
        if let Some(direct) = self.direct {
            options.direct = direct;
        }
        if let Some(copy) = self.copy {
            options.copy = copy;
        }
        if let Some(interval) = self.progress_interval {
            options.progress_interval = interval;
        }
        if let Some(srid) = self.srid {
            options.srid = srid;
        }
        options
            .validations
            .extend(self.validations.into_iter().map(StepConfig::into_step));
    }
}

//! Chaîne de validation exécutée sur la table de staging avant le swap
//!
//! La réparation des géométries passe toujours en premier, puis les étapes
//! fournies par l'appelant, dans l'ordre, une à la fois.

pub mod geometry;
pub mod steps;

use std::collections::BTreeSet;

use async_trait::async_trait;
use tokio_postgres::Client;
use tracing::{debug, info};

use crate::error::LoadError;
use crate::export::{quote_ident, TableRef};

pub use geometry::GeometryRepair;
pub use steps::{Dedupe, MinRows, NotNull, StepConfig};

/// Projection du swap : colonne destination → expression source (ordonnée)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldMap {
    entries: Vec<(String, String)>,
}

impl FieldMap {
    /// Projection identité sur les colonnes données
    pub fn identity<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            entries: columns
                .into_iter()
                .map(|c| (c.as_ref().to_string(), quote_ident(c.as_ref())))
                .collect(),
        }
    }

    /// Définit (ou remplace) l'expression d'une colonne destination
    pub fn set(&mut self, dest: impl Into<String>, expression: impl Into<String>) {
        let dest = dest.into();
        let expression = expression.into();
        match self.entries.iter_mut().find(|(d, _)| *d == dest) {
            Some(entry) => entry.1 = expression,
            None => self.entries.push((dest, expression)),
        }
    }

    pub fn get(&self, dest: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(d, _)| d == dest)
            .map(|(_, e)| e.as_str())
    }

    pub fn remove(&mut self, dest: &str) -> Option<String> {
        let index = self.entries.iter().position(|(d, _)| d == dest)?;
        Some(self.entries.remove(index).1)
    }

    pub fn contains(&self, dest: &str) -> bool {
        self.entries.iter().any(|(d, _)| d == dest)
    }

    pub fn destinations(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(d, _)| d.as_str())
    }

    pub fn expressions(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(_, e)| e.as_str())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut String)> {
        self.entries.iter_mut().map(|(d, e)| (d.as_str(), e))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// État partagé par les étapes d'une même chaîne
#[derive(Debug, Clone, Default)]
pub struct ValidationContext {
    /// Projection finale du swap
    pub fields: FieldMap,
    /// Colonnes de regroupement (`GROUP BY` lors du swap)
    pub group: BTreeSet<String>,
    /// La table possède une colonne `geometry`
    pub geometry_column: bool,
}

impl ValidationContext {
    pub fn new(fields: FieldMap, geometry_column: bool) -> Self {
        Self {
            fields,
            group: BTreeSet::new(),
            geometry_column,
        }
    }
}

/// Étape de validation asynchrone
///
/// Une erreur interrompt le chargement ; la staging et, en création, la
/// cible sont alors supprimées.
#[async_trait]
pub trait ValidationStep: Send + Sync {
    /// Nom court (logs, erreurs)
    fn name(&self) -> &str;

    async fn validate(
        &self,
        staging: &TableRef,
        ctx: &mut ValidationContext,
        client: &Client,
    ) -> anyhow::Result<()>;
}

/// Chaîne ordonnée : réparation des géométries puis étapes de l'appelant
pub struct ValidationPipeline {
    steps: Vec<Box<dyn ValidationStep>>,
}

impl ValidationPipeline {
    pub fn new(caller_steps: Vec<Box<dyn ValidationStep>>) -> Self {
        let mut steps: Vec<Box<dyn ValidationStep>> = Vec::with_capacity(caller_steps.len() + 1);
        steps.push(Box::new(GeometryRepair));
        steps.extend(caller_steps);
        Self { steps }
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Exécute les étapes séquentiellement
    pub async fn run(
        &self,
        staging: &TableRef,
        mut ctx: ValidationContext,
        client: &Client,
    ) -> Result<ValidationContext, LoadError> {
        for step in &self.steps {
            debug!(staging = %staging, step = step.name(), "Running validation step");
            step.validate(staging, &mut ctx, client)
                .await
                .map_err(|e| LoadError::validation(step.name(), e))?;
        }

        info!(
            staging = %staging,
            steps = self.steps.len(),
            columns = ctx.fields.len(),
            grouped = !ctx.group.is_empty(),
            "Validation passed"
        );
        Ok(ctx)
    }
}

impl std::fmt::Debug for ValidationPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationPipeline")
            .field("steps", &self.step_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_map_identity_and_set() {
        let mut fields = FieldMap::identity(["a", "b"]);
        assert_eq!(fields.get("a"), Some("\"a\""));

        fields.set("b", "upper(\"b\")");
        fields.set("geometry", "geometry");

        assert_eq!(fields.destinations().collect::<Vec<_>>(), vec!["a", "b", "geometry"]);
        assert_eq!(
            fields.expressions().collect::<Vec<_>>(),
            vec!["\"a\"", "upper(\"b\")", "geometry"]
        );
    }

    #[test]
    fn test_field_map_remove() {
        let mut fields = FieldMap::identity(["a", "b"]);
        assert_eq!(fields.remove("a"), Some("\"a\"".to_string()));
        assert!(!fields.contains("a"));
        assert_eq!(fields.remove("a"), None);
        assert_eq!(fields.len(), 1);
    }

    #[test]
    fn test_geometry_repair_runs_first() {
        let pipeline = ValidationPipeline::new(vec![
            Box::new(MinRows { count: 10 }),
            Box::new(NotNull {
                column: "nom".into(),
            }),
        ]);
        assert_eq!(
            pipeline.step_names(),
            vec!["geometry_repair", "min_rows", "not_null"]
        );
    }
}

//! Étapes de validation prêtes à l'emploi, déclarables en configuration

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_postgres::Client;
use tracing::debug;

use super::{ValidationContext, ValidationStep};
use crate::export::{quote_ident, TableRef};

/// Échoue si la staging contient moins de `count` lignes
#[derive(Debug, Clone)]
pub struct MinRows {
    pub count: i64,
}

#[async_trait]
impl ValidationStep for MinRows {
    fn name(&self) -> &str {
        "min_rows"
    }

    async fn validate(
        &self,
        staging: &TableRef,
        _ctx: &mut ValidationContext,
        client: &Client,
    ) -> Result<()> {
        let rows: i64 = client
            .query_one(&format!("SELECT count(*) FROM {}", staging.qualified()), &[])
            .await
            .with_context(|| format!("Failed to count rows of {}", staging))?
            .get(0);

        if rows < self.count {
            anyhow::bail!("expected at least {} rows, got {}", self.count, rows);
        }
        Ok(())
    }
}

/// Échoue si une ligne de la staging a `column` à NULL
#[derive(Debug, Clone)]
pub struct NotNull {
    pub column: String,
}

#[async_trait]
impl ValidationStep for NotNull {
    fn name(&self) -> &str {
        "not_null"
    }

    async fn validate(
        &self,
        staging: &TableRef,
        ctx: &mut ValidationContext,
        client: &Client,
    ) -> Result<()> {
        if !ctx.fields.contains(&self.column) {
            anyhow::bail!("unknown column '{}'", self.column);
        }

        let nulls: i64 = client
            .query_one(
                &format!(
                    "SELECT count(*) FROM {} WHERE {} IS NULL",
                    staging.qualified(),
                    quote_ident(&self.column)
                ),
                &[],
            )
            .await
            .with_context(|| format!("Failed to check NULLs in {}", self.column))?
            .get(0);

        if nulls > 0 {
            anyhow::bail!("{} rows have no value for '{}'", nulls, self.column);
        }
        Ok(())
    }
}

/// Fusionne les lignes ayant les mêmes valeurs sur `columns`
///
/// Les colonnes sont ajoutées au regroupement du swap ; les autres colonnes
/// projetées prennent la première valeur du groupe.
#[derive(Debug, Clone)]
pub struct Dedupe {
    pub columns: Vec<String>,
}

#[async_trait]
impl ValidationStep for Dedupe {
    fn name(&self) -> &str {
        "dedupe"
    }

    async fn validate(
        &self,
        staging: &TableRef,
        ctx: &mut ValidationContext,
        _client: &Client,
    ) -> Result<()> {
        schedule_dedupe(&self.columns, ctx)?;
        debug!(staging = %staging, group = ?ctx.group, "Deduplication scheduled for swap");
        Ok(())
    }
}

/// Ajoute `columns` au regroupement et agrège les autres colonnes projetées
fn schedule_dedupe(columns: &[String], ctx: &mut ValidationContext) -> Result<()> {
    if columns.is_empty() {
        anyhow::bail!("no columns to deduplicate on");
    }
    for column in columns {
        if !ctx.fields.contains(column) {
            anyhow::bail!("unknown column '{}'", column);
        }
        ctx.group.insert(column.clone());
    }

    let group = &ctx.group;
    for (dest, expression) in ctx.fields.iter_mut() {
        if group.contains(dest) || is_aggregated(expression) {
            continue;
        }
        *expression = format!("(array_agg({}))[1]", expression);
    }
    Ok(())
}

fn is_aggregated(expression: &str) -> bool {
    expression.starts_with("(array_agg(")
}

/// Déclaration d'une étape dans le fichier de configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepConfig {
    MinRows { count: i64 },
    Dedupe { columns: Vec<String> },
    NotNull { column: String },
}

impl StepConfig {
    pub fn into_step(self) -> Box<dyn ValidationStep> {
        match self {
            Self::MinRows { count } => Box::new(MinRows { count }),
            Self::Dedupe { columns } => Box::new(Dedupe { columns }),
            Self::NotNull { column } => Box::new(NotNull { column }),
        }
    }
}

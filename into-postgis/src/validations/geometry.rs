//! Réparation des géométries de la staging (toujours exécutée en premier)

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_postgres::Client;
use tracing::{debug, info, warn};

use super::{ValidationContext, ValidationStep};
use crate::export::TableRef;

/// Vérifie la présence de lignes et répare les géométries invalides
///
/// Les géométries réparées qui dégénèrent en GEOMETRYCOLLECTION sont supprimées.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeometryRepair;

#[async_trait]
impl ValidationStep for GeometryRepair {
    fn name(&self) -> &str {
        "geometry_repair"
    }

    async fn validate(
        &self,
        staging: &TableRef,
        ctx: &mut ValidationContext,
        client: &Client,
    ) -> Result<()> {
        let table = staging.qualified();

        let rows: i64 = client
            .query_one(&format!("SELECT count(*) FROM {}", table), &[])
            .await
            .with_context(|| format!("Failed to count rows of {}", staging))?
            .get(0);

        if rows == 0 {
            anyhow::bail!("no rows inserted");
        }

        if !ctx.geometry_column {
            return Ok(());
        }

        let has_geometry: Option<bool> = client
            .query_one(
                &format!("SELECT bool_or(geometry IS NOT NULL) FROM {}", table),
                &[],
            )
            .await
            .context("Failed to check geometry presence")?
            .get(0);

        if !has_geometry.unwrap_or(false) {
            debug!(staging = %staging, "No geometry staged");
            return Ok(());
        }

        let all_valid: Option<bool> = client
            .query_one(
                &format!(
                    "SELECT bool_and(ST_IsValid(geometry)) FROM {} WHERE geometry IS NOT NULL",
                    table
                ),
                &[],
            )
            .await
            .context("Failed to check geometry validity")?
            .get(0);

        if !all_valid.unwrap_or(true) {
            let repaired = client
                .execute(
                    &format!(
                        "UPDATE {} SET geometry = ST_MakeValid(geometry) WHERE NOT ST_IsValid(geometry)",
                        table
                    ),
                    &[],
                )
                .await
                .context("Failed to repair invalid geometries")?;

            let removed = client
                .execute(
                    &format!(
                        "DELETE FROM {} WHERE GeometryType(geometry) = 'GEOMETRYCOLLECTION'",
                        table
                    ),
                    &[],
                )
                .await
                .context("Failed to remove degenerate geometries")?;

            info!(staging = %staging, repaired, "Repaired invalid geometries");
            if removed > 0 {
                warn!(
                    staging = %staging,
                    removed,
                    "Removed rows whose repaired geometry is a GEOMETRYCOLLECTION"
                );
            }
        }

        ctx.fields.set("geometry", "geometry");
        Ok(())
    }
}

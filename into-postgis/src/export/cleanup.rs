//! Nettoyage des tables de staging orphelines

use anyhow::{Context, Result};
use deadpool_postgres::Pool;
use tracing::{info, warn};

use super::staging::{drop_staging, is_staging_name};
use super::TableRef;

/// Supprime les tables de staging laissées par des chargements interrompus
///
/// Retourne le nombre de tables supprimées. Un chargement en cours dans le même
/// schéma perdrait sa staging : à lancer hors des fenêtres de chargement.
pub async fn sweep_orphans(pool: &Pool, schema: &str) -> Result<usize> {
    let client = pool
        .get()
        .await
        .context("Failed to get connection from pool")?;

    let rows = client
        .query(
            r#"
            SELECT table_name::text
            FROM information_schema.tables
            WHERE table_schema = $1 AND table_name LIKE '%\_temp\_%'
            "#,
            &[&schema],
        )
        .await
        .with_context(|| format!("Failed to list staging tables in schema {}", schema))?;

    let orphans: Vec<TableRef> = rows
        .iter()
        .map(|row| row.get::<_, String>(0))
        .filter(|name| is_staging_name(name))
        .map(|name| TableRef::new(schema, name))
        .collect();

    let mut removed = 0;
    for orphan in &orphans {
        match drop_staging(&client, orphan).await {
            Ok(()) => removed += 1,
            Err(e) => warn!(staging = %orphan, "Failed to drop orphan staging table: {e:#}"),
        }
    }

    info!(schema, found = orphans.len(), removed, "Orphan cleanup finished");
    Ok(removed)
}

//! Tables de staging : copies structurelles et éphémères de la table cible

use std::sync::OnceLock;

use anyhow::{Context, Result};
use geofeature::sanitize::truncate_bytes;
use regex::Regex;
use tokio_postgres::Client;
use tracing::debug;
use uuid::Uuid;

use super::TableRef;

/// Longueur maximale du préfixe repris de la table cible
const STAGING_PREFIX_BYTES: usize = 20;

fn staging_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^[a-z0-9_]*_temp_[0-9a-f]{8}_[0-9a-f]{4}_[0-9a-f]{4}_[0-9a-f]{4}_[0-9a-f]{12}$",
        )
        .expect("static regex")
    })
}

/// Génère un nom de staging unique : `<préfixe>_temp_<uuid>`
pub fn staging_name(target: &str) -> String {
    let suffix = Uuid::new_v4().hyphenated().to_string().replace('-', "_");
    format!("{}_temp_{}", truncate_bytes(target, STAGING_PREFIX_BYTES), suffix)
}

/// Indique si un nom de table suit le motif des tables de staging
pub fn is_staging_name(name: &str) -> bool {
    staging_pattern().is_match(name)
}

/// Crée une table de staging vide ayant la structure de la cible
pub async fn create_staging(client: &Client, target: &TableRef) -> Result<TableRef> {
    let staging = target.sibling(staging_name(&target.name));

    client
        .execute(
            &format!(
                "CREATE UNLOGGED TABLE {} (LIKE {} INCLUDING DEFAULTS)",
                staging.qualified(),
                target.qualified()
            ),
            &[],
        )
        .await
        .with_context(|| format!("Failed to create staging table {}", staging))?;

    debug!(target = %target, staging = %staging, "Created staging table");
    Ok(staging)
}

/// Supprime une table de staging
pub async fn drop_staging(client: &Client, staging: &TableRef) -> Result<()> {
    client
        .execute(
            &format!("DROP TABLE IF EXISTS {} CASCADE", staging.qualified()),
            &[],
        )
        .await
        .with_context(|| format!("Failed to drop staging table {}", staging))?;

    debug!(staging = %staging, "Dropped staging table");
    Ok(())
}

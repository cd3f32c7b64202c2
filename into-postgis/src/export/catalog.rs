//! Lecture du catalogue et création initiale des tables cibles

use anyhow::{Context, Result};
use geofeature::{sanitize::truncate_bytes, Column, ColumnType, TableSchema};
use tokio_postgres::Client;
use tracing::{debug, info, warn};

use super::{quote_ident, TableRef};

/// Colonnes gérées par la base, jamais alimentées par les features
pub const INTERNAL_COLUMNS: &[&str] = &[
    "row_id",
    "geometry",
    "geometry_webmercator",
    "created_at",
    "updated_at",
];

/// SRID par défaut des tables créées
pub const DEFAULT_SRID: i32 = 4326;

/// Résultat du contrôle d'existence
#[derive(Debug, Clone, PartialEq)]
pub enum Existence {
    Absent,
    Present(TableSchema),
}

impl Existence {
    pub fn is_present(&self) -> bool {
        matches!(self, Self::Present(_))
    }
}

/// Vérifie l'existence d'une table et récupère son schéma le cas échéant
pub async fn check_existence(client: &Client, table: &TableRef) -> Result<Existence> {
    let exists = client
        .query_opt(
            "SELECT 1 FROM information_schema.tables WHERE table_schema = $1 AND table_name = $2",
            &[&table.schema, &table.name],
        )
        .await
        .with_context(|| format!("Failed to check existence of {}", table))?
        .is_some();

    if !exists {
        debug!(table = %table, "Table is absent");
        return Ok(Existence::Absent);
    }

    Ok(Existence::Present(fetch_schema(client, table).await?))
}

/// Lit les colonnes utilisateur d'une table, dans l'ordre du catalogue
pub async fn fetch_schema(client: &Client, table: &TableRef) -> Result<TableSchema> {
    let rows = client
        .query(
            r#"
            SELECT column_name::text, data_type::text
            FROM information_schema.columns
            WHERE table_schema = $1 AND table_name = $2
            ORDER BY ordinal_position
            "#,
            &[&table.schema, &table.name],
        )
        .await
        .with_context(|| format!("Failed to fetch columns of {}", table))?;

    let mut has_geometry_column = false;
    let mut columns = Vec::with_capacity(rows.len());
    for row in rows {
        let name: String = row.get(0);
        let declared: String = row.get(1);
        if name == "geometry" {
            has_geometry_column = true;
        }
        if INTERNAL_COLUMNS.contains(&name.as_str()) {
            continue;
        }
        columns.push(Column::new(name, declared));
    }

    let geometry_srid = if has_geometry_column {
        Some(fetch_geometry_srid(client, table).await?)
    } else {
        None
    };

    debug!(
        table = %table,
        columns = columns.len(),
        srid = ?geometry_srid,
        "Fetched table schema"
    );

    Ok(TableSchema::new(columns, geometry_srid))
}

/// SRID de la colonne `geometry` (0 si non contrainte)
async fn fetch_geometry_srid(client: &Client, table: &TableRef) -> Result<i32> {
    let row = client
        .query_opt(
            r#"
            SELECT srid FROM geometry_columns
            WHERE f_table_schema = $1 AND f_table_name = $2 AND f_geometry_column = 'geometry'
            "#,
            &[&table.schema, &table.name],
        )
        .await
        .with_context(|| format!("Failed to read geometry SRID of {}", table))?;

    Ok(row.map(|r| r.get::<_, i32>(0)).unwrap_or(0))
}

/// Active PostGIS, ou vérifie qu'il est déjà installé
pub async fn ensure_postgis(client: &Client) -> Result<()> {
    match client
        .execute("CREATE EXTENSION IF NOT EXISTS postgis", &[])
        .await
    {
        Ok(_) => Ok(()),
        Err(e) => {
            warn!("CREATE EXTENSION postgis failed (will check if already installed): {e}");
            let exists = client
                .query_opt("SELECT 1 FROM pg_extension WHERE extname = 'postgis'", &[])
                .await
                .context("Failed to check pg_extension")?
                .is_some();
            if !exists {
                anyhow::bail!("PostGIS extension is not installed and could not be created: {e}");
            }
            Ok(())
        }
    }
}

/// SQL de création d'une table cible et de son index spatial
pub fn bootstrap_sql(table: &TableRef, columns: &[(String, ColumnType)], srid: i32) -> Result<String> {
    let mut defs = vec!["row_id BIGSERIAL PRIMARY KEY".to_string()];
    for (name, kind) in columns {
        if INTERNAL_COLUMNS.contains(&name.as_str()) {
            continue;
        }
        defs.push(format!("{} {}", quote_ident(name), kind.sql_name()?));
    }
    defs.push(format!("geometry geometry(Geometry, {})", srid));
    defs.push("created_at TIMESTAMPTZ DEFAULT NOW()".to_string());
    defs.push("updated_at TIMESTAMPTZ DEFAULT NOW()".to_string());

    let index_name = format!("{}_geom_idx", truncate_bytes(&table.name, 54));

    Ok(format!(
        "CREATE TABLE {table} (\n    {defs}\n);\nCREATE INDEX {index} ON {table} USING GIST (geometry);",
        table = table.qualified(),
        defs = defs.join(",\n    "),
        index = quote_ident(&index_name),
    ))
}

/// Crée la table cible en un seul appel (table + index)
pub async fn bootstrap_table(
    client: &Client,
    table: &TableRef,
    columns: &[(String, ColumnType)],
    srid: i32,
) -> Result<()> {
    ensure_postgis(client).await?;

    let sql = bootstrap_sql(table, columns, srid)?;
    debug!(table = %table, sql = %sql, "Bootstrapping table");

    // Requête simple multi-instructions : exécutée dans une transaction implicite
    client
        .batch_execute(&sql)
        .await
        .with_context(|| format!("Failed to create table {}", table))?;

    info!(table = %table, columns = columns.len(), srid, "Created table");
    Ok(())
}

/// Supprime une table si elle existe
pub async fn drop_table(client: &Client, table: &TableRef) -> Result<()> {
    client
        .execute(&format!("DROP TABLE IF EXISTS {} CASCADE", table.qualified()), &[])
        .await
        .with_context(|| format!("Failed to drop table {}", table))?;
    Ok(())
}

/// Nombre de lignes d'une table
pub async fn count_rows(client: &Client, table: &TableRef) -> Result<i64> {
    let row = client
        .query_one(&format!("SELECT count(*) FROM {}", table.qualified()), &[])
        .await
        .with_context(|| format!("Failed to count rows of {}", table))?;
    Ok(row.get(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_sql_layout() {
        let table = TableRef::new("public", "communes");
        let sql = bootstrap_sql(
            &table,
            &[
                ("nom".into(), ColumnType::Text),
                ("population".into(), ColumnType::Integer),
                ("row_id".into(), ColumnType::BigInt),
            ],
            2154,
        )
        .unwrap();

        assert!(sql.starts_with("CREATE TABLE \"public\".\"communes\" ("));
        assert!(sql.contains("row_id BIGSERIAL PRIMARY KEY"));
        assert!(sql.contains("\"nom\" text"));
        assert!(sql.contains("\"population\" integer"));
        assert!(sql.contains("geometry geometry(Geometry, 2154)"));
        assert!(sql.contains("created_at TIMESTAMPTZ DEFAULT NOW()"));
        assert!(sql.contains("USING GIST (geometry)"));
        // row_id fourni par la source n'est pas recréé
        assert_eq!(sql.matches("row_id").count(), 1);
    }

    #[test]
    fn test_bootstrap_sql_rejects_unsupported_type() {
        let table = TableRef::new("public", "t");
        let result = bootstrap_sql(&table, &[("x".into(), ColumnType::Unsupported("jsonb".into()))], 4326);
        assert!(result.is_err());
    }

    #[test]
    fn test_bootstrap_index_name_fits() {
        let table = TableRef::new("public", "a".repeat(63));
        let sql = bootstrap_sql(&table, &[], 4326).unwrap();
        let index = format!("\"{}_geom_idx\"", "a".repeat(54));
        assert!(sql.contains(&index));
    }
}

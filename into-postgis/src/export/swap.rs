//! Transaction de swap : fusion de la staging dans la cible
//!
//! La cible n'est modifiée qu'ici, en une seule transaction. La staging est
//! supprimée dans la même transaction ; en cas d'échec le rollback la laisse
//! en place et l'appelant doit la supprimer.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use deadpool_postgres::{Object, Transaction};
use tracing::{debug, error, info};

use super::{quote_ident, TableRef};
use crate::validations::FieldMap;

/// Plan du swap : requêtes à exécuter dans l'ordre
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapPlan {
    /// `DELETE FROM cible` (mode replace)
    pub delete: Option<String>,
    /// `INSERT INTO cible (...) SELECT ... FROM staging`, absent si aucune colonne
    pub insert: Option<String>,
    /// `DROP TABLE staging`
    pub drop_staging: String,
}

impl SwapPlan {
    pub fn build(
        staging: &TableRef,
        target: &TableRef,
        fields: &FieldMap,
        group: &BTreeSet<String>,
        replace: bool,
    ) -> Self {
        let delete = replace.then(|| format!("DELETE FROM {}", target.qualified()));

        let insert = (!fields.is_empty()).then(|| {
            let dest: Vec<String> = fields.destinations().map(quote_ident).collect();
            let exprs: Vec<&str> = fields.expressions().collect();
            let mut sql = format!(
                "INSERT INTO {} ({}) SELECT {} FROM {}",
                target.qualified(),
                dest.join(", "),
                exprs.join(", "),
                staging.qualified()
            );
            if !group.is_empty() {
                let columns: Vec<String> = group.iter().map(|c| quote_ident(c)).collect();
                sql.push_str(" GROUP BY ");
                sql.push_str(&columns.join(", "));
            }
            sql
        });

        Self {
            delete,
            insert,
            drop_staging: format!("DROP TABLE {}", staging.qualified()),
        }
    }
}

/// Transaction de swap en cours
pub struct SwapTransaction<'a> {
    transaction: Transaction<'a>,
    target: TableRef,
    staging: TableRef,
}

impl<'a> SwapTransaction<'a> {
    /// Démarre la transaction
    pub async fn begin(client: &'a mut Object, target: &TableRef, staging: &TableRef) -> Result<Self> {
        let transaction = client
            .transaction()
            .await
            .context("Failed to begin swap transaction")?;

        debug!(target = %target, staging = %staging, "Starting swap transaction");

        Ok(Self {
            transaction,
            target: target.clone(),
            staging: staging.clone(),
        })
    }

    /// Exécute le plan ; retourne le nombre de lignes insérées dans la cible
    pub async fn apply(&self, plan: &SwapPlan) -> Result<u64> {
        if let Some(delete) = &plan.delete {
            let deleted = self
                .transaction
                .execute(delete.as_str(), &[])
                .await
                .with_context(|| format!("Failed to clear {}", self.target))?;
            debug!(target = %self.target, deleted, "Cleared target rows");
        }

        let inserted = match &plan.insert {
            Some(insert) => {
                debug!(sql = %insert, "Merging staging into target");
                self.transaction
                    .execute(insert.as_str(), &[])
                    .await
                    .with_context(|| {
                        format!("Failed to merge {} into {}", self.staging, self.target)
                    })?
            }
            None => 0,
        };

        self.transaction
            .execute(plan.drop_staging.as_str(), &[])
            .await
            .with_context(|| format!("Failed to drop staging table {}", self.staging))?;

        Ok(inserted)
    }

    /// Valide et commit la transaction
    pub async fn commit(self, inserted: u64) -> Result<u64> {
        self.transaction
            .commit()
            .await
            .context("Failed to commit swap transaction")?;

        info!(target = %self.target, rows = inserted, "Swap committed");
        Ok(inserted)
    }

    /// Annule la transaction (rollback)
    ///
    /// La transaction est également annulée si elle est droppée.
    pub async fn rollback(self, reason: &str) {
        error!(
            target = %self.target,
            staging = %self.staging,
            reason = %reason,
            "Rolling back swap"
        );

        if let Err(e) = self.transaction.rollback().await {
            error!(error = %e, "Explicit rollback failed (will rollback on drop anyway)");
        }
    }
}

/// Exécute le swap complet : begin, plan, commit ou rollback
pub async fn swap(
    client: &mut Object,
    target: &TableRef,
    staging: &TableRef,
    plan: &SwapPlan,
) -> Result<u64> {
    let swap = SwapTransaction::begin(client, target, staging).await?;

    match swap.apply(plan).await {
        Ok(inserted) => swap.commit(inserted).await,
        Err(e) => {
            swap.rollback(&format!("{e:#}")).await;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables() -> (TableRef, TableRef) {
        (
            TableRef::new("public", "communes_temp_x"),
            TableRef::new("public", "communes"),
        )
    }

    #[test]
    fn test_append_plan() {
        let (staging, target) = tables();
        let fields = FieldMap::identity(["nom", "pop"]);
        let plan = SwapPlan::build(&staging, &target, &fields, &BTreeSet::new(), false);

        assert_eq!(plan.delete, None);
        assert_eq!(
            plan.insert.as_deref(),
            Some(
                "INSERT INTO \"public\".\"communes\" (\"nom\", \"pop\") SELECT \"nom\", \"pop\" FROM \"public\".\"communes_temp_x\""
            )
        );
        assert_eq!(plan.drop_staging, "DROP TABLE \"public\".\"communes_temp_x\"");
    }

    #[test]
    fn test_replace_plan_deletes_first() {
        let (staging, target) = tables();
        let fields = FieldMap::identity(["nom"]);
        let plan = SwapPlan::build(&staging, &target, &fields, &BTreeSet::new(), true);

        assert_eq!(plan.delete.as_deref(), Some("DELETE FROM \"public\".\"communes\""));
    }

    #[test]
    fn test_grouped_plan() {
        let (staging, target) = tables();
        let mut fields = FieldMap::identity(["code", "nom"]);
        fields.set("nom", "(array_agg(\"nom\"))[1]");
        let group: BTreeSet<String> = ["code".to_string()].into_iter().collect();

        let plan = SwapPlan::build(&staging, &target, &fields, &group, false);

        let insert = plan.insert.unwrap();
        assert!(insert.contains("SELECT \"code\", (array_agg(\"nom\"))[1] FROM"));
        assert!(insert.ends_with(" GROUP BY \"code\""));
    }

    #[test]
    fn test_empty_projection_skips_insert() {
        let (staging, target) = tables();
        let plan = SwapPlan::build(&staging, &target, &FieldMap::default(), &BTreeSet::new(), true);
        assert!(plan.insert.is_none());
        assert!(plan.delete.is_some());
    }
}

//! Rapport de chargement
//!
//! Collecte les compteurs d'un chargement et les affiche ou les sauvegarde en JSON.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;

use crate::loader::LoadMethod;

/// Statut final du chargement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoadStatus {
    /// Chargement commité
    Success,
    /// Chargement abandonné, cible inchangée (hors mode direct)
    Failed,
}

/// Rapport complet d'un chargement
#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    /// Table cible (schéma.table)
    pub table: String,
    pub method: LoadMethod,
    /// Table de staging utilisée (absente en mode direct)
    pub staging: Option<String>,
    /// Features reçues
    pub rows_received: u64,
    /// Features écartées par la validation (ni attribut ni géométrie)
    pub rows_dropped: u64,
    /// Lignes écrites en staging (ou dans la cible en mode direct)
    pub rows_written: u64,
    /// Lignes insérées dans la cible
    pub rows_committed: u64,
    /// Avertissements émis (un par champ inattendu)
    pub warnings: Vec<String>,
    /// Durée du chargement
    pub duration_secs: f64,
    pub status: LoadStatus,
    /// Erreur terminale éventuelle
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LoadReport {
    pub fn new(table: impl Into<String>, method: LoadMethod) -> Self {
        Self {
            table: table.into(),
            method,
            staging: None,
            rows_received: 0,
            rows_dropped: 0,
            rows_written: 0,
            rows_committed: 0,
            warnings: Vec::new(),
            duration_secs: 0.0,
            status: LoadStatus::Success,
            error: None,
        }
    }

    /// Rapport d'un chargement en échec
    pub fn failed(table: impl Into<String>, method: LoadMethod, error: &str) -> Self {
        Self {
            status: LoadStatus::Failed,
            error: Some(error.to_string()),
            ..Self::new(table, method)
        }
    }

    /// Définit la durée du chargement
    pub fn set_duration(&mut self, duration: Duration) {
        self.duration_secs = duration.as_secs_f64();
    }

    /// Affiche le rapport sur la console
    pub fn display(&self) {
        println!("\n{}", "=".repeat(60));
        println!("LOAD REPORT - {} ({})", self.table, self.method);
        println!("{}", "=".repeat(60));

        println!("\nStatus: {:?}", self.status);
        println!("Duration: {:.2}s", self.duration_secs);
        if let Some(staging) = &self.staging {
            println!("Staging: {}", staging);
        }

        println!("\n--- SUMMARY ---");
        println!(
            "Rows: {} received, {} dropped, {} written, {} committed",
            self.rows_received, self.rows_dropped, self.rows_written, self.rows_committed
        );

        if !self.warnings.is_empty() {
            println!("\n--- WARNINGS ({}) ---", self.warnings.len());
            for w in self.warnings.iter().take(10) {
                println!("  {}", w);
            }
            if self.warnings.len() > 10 {
                println!("  ... and {} more", self.warnings.len() - 10);
            }
        }

        if let Some(error) = &self.error {
            println!("\n--- ERROR ---");
            println!("  {}", error);
        }

        println!("\n{}", "=".repeat(60));
    }

    /// Sauvegarde le rapport en JSON
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Affichage compact pour le résumé
    pub fn summary(&self) -> String {
        format!(
            "{} ({}): {} committed, {} dropped, {} warnings",
            self.table,
            self.method,
            self.rows_committed,
            self.rows_dropped,
            self.warnings.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_report() {
        let report = LoadReport::new("public.communes", LoadMethod::Create);
        assert_eq!(report.status, LoadStatus::Success);
        assert_eq!(report.rows_committed, 0);
        assert!(report.error.is_none());
    }

    #[test]
    fn test_failed_report() {
        let report = LoadReport::failed("public.communes", LoadMethod::Append, "boom");
        assert_eq!(report.status, LoadStatus::Failed);
        assert_eq!(report.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_summary() {
        let mut report = LoadReport::new("public.communes", LoadMethod::Replace);
        report.rows_committed = 75;
        report.rows_dropped = 2;
        report.warnings.push("w".into());

        assert_eq!(
            report.summary(),
            "public.communes (replace): 75 committed, 2 dropped, 1 warnings"
        );
    }

    #[test]
    fn test_serialization() {
        let mut report = LoadReport::new("public.t", LoadMethod::Create);
        report.set_duration(Duration::from_millis(1500));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["method"], "create");
        assert_eq!(json["status"], "Success");
        assert_eq!(json["duration_secs"], 1.5);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_save_to_file() {
        let path = std::env::temp_dir().join(format!("load-report-{}.json", std::process::id()));
        let report = LoadReport::new("public.t", LoadMethod::Append);
        report.save_to_file(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("\"table\": \"public.t\""));
        let _ = std::fs::remove_file(&path);
    }
}

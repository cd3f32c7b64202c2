//! Erreurs terminales d'un chargement

use thiserror::Error;

/// Erreur terminale d'un chargement (au plus une par exécution)
#[derive(Debug, Error)]
pub enum LoadError {
    /// Existence de la table incompatible avec la méthode choisie
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// Une étape de validation a rejeté la table de staging
    #[error("Validation failed in step '{step}': {source:#}")]
    Validation {
        step: String,
        #[source]
        source: anyhow::Error,
    },

    /// Échec d'un appel à la base (connexion, requête, transaction)
    #[error("Transport error: {0:#}")]
    Transport(#[source] anyhow::Error),
}

impl LoadError {
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }

    pub fn validation(step: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Validation {
            step: step.into(),
            source,
        }
    }

    /// Nom court du type d'erreur (rapports, logs)
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Precondition(_) => "precondition",
            Self::Validation { .. } => "validation",
            Self::Transport(_) => "transport",
        }
    }
}

impl From<anyhow::Error> for LoadError {
    fn from(error: anyhow::Error) -> Self {
        Self::Transport(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_validation_message_includes_step() {
        let err = LoadError::validation("min_rows", anyhow::anyhow!("only 3 rows"));
        assert_eq!(
            err.to_string(),
            "Validation failed in step 'min_rows': only 3 rows"
        );
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn test_transport_keeps_context_chain() {
        let inner: anyhow::Result<()> = Err(anyhow::anyhow!("connection refused"));
        let err: LoadError = inner.context("Failed to get connection from pool").unwrap_err().into();
        let message = err.to_string();
        assert!(message.contains("Failed to get connection from pool"));
        assert!(message.contains("connection refused"));
    }
}

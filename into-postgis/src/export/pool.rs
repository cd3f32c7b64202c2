//! Pool de connexions PostgreSQL

use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use deadpool_postgres::{Config, Pool, PoolConfig, Runtime, Timeouts};
use tokio_postgres::NoTls;
use tokio_postgres_rustls::MakeRustlsConnect;

/// Nom d'application visible dans `pg_stat_activity`
const APPLICATION_NAME: &str = "into-postgis";

/// Mode SSL de la connexion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SslMode {
    #[default]
    Disable,
    /// TLS tenté, même connecteur que `Require`
    Prefer,
    Require,
}

impl FromStr for SslMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "disable" | "off" | "false" | "no" => Ok(Self::Disable),
            "prefer" => Ok(Self::Prefer),
            "require" | "on" | "true" | "yes" => Ok(Self::Require),
            _ => bail!("Invalid SSL mode: {s} (expected disable, prefer or require)"),
        }
    }
}

/// Paramètres de connexion et routage vers le schéma cible
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: Option<String>,
    /// Schéma des tables chargées et balayées
    pub schema: String,
    pub pool_size: usize,
    pub ssl_mode: SslMode,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 5432,
            dbname: "postgres".into(),
            user: "postgres".into(),
            password: None,
            schema: "public".into(),
            pool_size: 4,
            ssl_mode: SslMode::Disable,
        }
    }
}

/// Surcharges explicites (ligne de commande)
#[derive(Debug, Clone, Default)]
pub struct ConnectionOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub dbname: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub schema: Option<String>,
    pub ssl_mode: Option<SslMode>,
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or(default)
}

fn env_parsed<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

impl ConnectionParams {
    /// Variables libpq (`PG*`) plus `PGSCHEMA` et `POOL_SIZE`
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: env_or("PGHOST", defaults.host),
            port: env_parsed("PGPORT").unwrap_or(defaults.port),
            dbname: env_or("PGDATABASE", defaults.dbname),
            user: env_or("PGUSER", defaults.user),
            password: std::env::var("PGPASSWORD").ok(),
            schema: env_or("PGSCHEMA", defaults.schema),
            pool_size: env_parsed("POOL_SIZE").unwrap_or(defaults.pool_size),
            ssl_mode: env_parsed("PGSSLMODE").unwrap_or_default(),
        }
    }

    pub fn apply_overrides(&mut self, overrides: ConnectionOverrides) {
        let ConnectionOverrides {
            host,
            port,
            dbname,
            user,
            password,
            schema,
            ssl_mode,
        } = overrides;

        self.host = host.unwrap_or(std::mem::take(&mut self.host));
        self.port = port.unwrap_or(self.port);
        self.dbname = dbname.unwrap_or(std::mem::take(&mut self.dbname));
        self.user = user.unwrap_or(std::mem::take(&mut self.user));
        self.password = password.or(self.password.take());
        self.schema = schema.unwrap_or(std::mem::take(&mut self.schema));
        self.ssl_mode = ssl_mode.unwrap_or(self.ssl_mode);
    }

    fn pool_config(&self) -> Config {
        let mut cfg = Config::new();
        cfg.host = Some(self.host.clone());
        cfg.port = Some(self.port);
        cfg.dbname = Some(self.dbname.clone());
        cfg.user = Some(self.user.clone());
        cfg.password = self.password.clone();
        cfg.application_name = Some(APPLICATION_NAME.to_string());
        cfg.pool = Some(PoolConfig {
            max_size: self.pool_size.max(1),
            timeouts: Timeouts {
                wait: Some(Duration::from_secs(30)),
                create: Some(Duration::from_secs(10)),
                recycle: Some(Duration::from_secs(30)),
            },
            ..Default::default()
        });
        cfg
    }
}

/// Crée la configuration TLS pour rustls
fn make_tls_connector() -> MakeRustlsConnect {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    MakeRustlsConnect::new(config)
}

/// Crée un pool de connexions ; aucune connexion n'est ouverte avant le premier `get`
pub fn create_pool(params: &ConnectionParams) -> Result<Pool> {
    let cfg = params.pool_config();
    let pool = match params.ssl_mode {
        SslMode::Disable => cfg.create_pool(Some(Runtime::Tokio1), NoTls),
        SslMode::Prefer | SslMode::Require => {
            cfg.create_pool(Some(Runtime::Tokio1), make_tls_connector())
        }
    };
    pool.with_context(|| {
        format!(
            "Failed to create database pool for {}@{}:{}/{}",
            params.user, params.host, params.port, params.dbname
        )
    })
}

/// Teste la connexion à la base
pub async fn test_connection(pool: &Pool) -> Result<()> {
    let client = pool
        .get()
        .await
        .context("Failed to get connection from pool")?;
    client
        .execute("SELECT 1", &[])
        .await
        .context("Connection test failed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssl_mode_parse() {
        assert_eq!("disable".parse::<SslMode>().unwrap(), SslMode::Disable);
        assert_eq!("PREFER".parse::<SslMode>().unwrap(), SslMode::Prefer);
        assert_eq!("on".parse::<SslMode>().unwrap(), SslMode::Require);

        let err = "verify-full".parse::<SslMode>().unwrap_err();
        assert!(err.to_string().contains("verify-full"));
    }

    #[test]
    fn test_overrides() {
        let mut params = ConnectionParams {
            password: Some("secret".into()),
            ..ConnectionParams::default()
        };
        params.apply_overrides(ConnectionOverrides {
            host: Some("db.example.org".into()),
            user: Some("loader".into()),
            port: Some(6432),
            schema: Some("staging_area".into()),
            ssl_mode: Some(SslMode::Require),
            ..ConnectionOverrides::default()
        });

        assert_eq!(params.host, "db.example.org");
        assert_eq!(params.dbname, "postgres");
        assert_eq!(params.user, "loader");
        assert_eq!(params.password.as_deref(), Some("secret"));
        assert_eq!(params.port, 6432);
        assert_eq!(params.schema, "staging_area");
        assert_eq!(params.ssl_mode, SslMode::Require);
    }

    #[test]
    fn test_pool_config() {
        let params = ConnectionParams {
            pool_size: 0,
            ..ConnectionParams::default()
        };
        let cfg = params.pool_config();

        assert_eq!(cfg.application_name.as_deref(), Some("into-postgis"));
        assert_eq!(cfg.pool.map(|p| p.max_size), Some(1));
    }
}

//! Définition et implémentation des commandes CLI
//!
//! - `load`: GeoJSON → table PostGIS (création, ajout ou remplacement)
//! - `cleanup`: suppression des tables de staging orphelines

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use geofeature::{read_geojson, resolve_table_name};
use into_postgis::{
    cleanup_orphans, create_pool, load, test_connection, ConnectionOverrides, ConnectionParams,
    LoadEvent, LoadMethod, LoadOptions, LoadReport, LoadSettings, SslMode,
};
use tracing::{error, info, warn};

#[derive(Subcommand)]
pub enum Commands {
    /// Load a GeoJSON file into a PostGIS table
    Load(LoadArgs),

    /// Drop staging tables left behind by interrupted loads
    Cleanup {
        #[command(flatten)]
        db: DatabaseArgs,
    },
}

#[derive(Args)]
pub struct LoadArgs {
    /// GeoJSON file (FeatureCollection or Feature)
    #[arg(short, long)]
    pub file: PathBuf,

    /// Target table name (sanitized before use)
    #[arg(short, long)]
    pub table: String,

    #[command(flatten)]
    pub method: MethodArgs,

    /// Records per write batch (défaut : 200)
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Append straight into the target, without staging (not atomic)
    #[arg(long)]
    pub direct: bool,

    /// Use COPY instead of multi-row INSERT
    #[arg(long)]
    pub copy: bool,

    /// JSON settings file (batch size, SRID, validation steps...)
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// Write the load report as JSON
    #[arg(long)]
    pub report: Option<PathBuf>,

    #[command(flatten)]
    pub db: DatabaseArgs,
}

/// Méthode de chargement ; à défaut, celle du fichier de réglages
#[derive(Args)]
#[group(required = false, multiple = false)]
pub struct MethodArgs {
    /// Create the table (it must not exist)
    #[arg(short = 'c', long)]
    pub create: bool,

    /// Append to an existing table
    #[arg(short = 'a', long)]
    pub append: bool,

    /// Replace the contents of an existing table
    #[arg(short = 'r', long)]
    pub replace: bool,
}

impl MethodArgs {
    pub fn method(&self) -> Option<LoadMethod> {
        if self.create {
            Some(LoadMethod::Create)
        } else if self.append {
            Some(LoadMethod::Append)
        } else if self.replace {
            Some(LoadMethod::Replace)
        } else {
            None
        }
    }
}

/// La ligne de commande l'emporte sur le fichier de réglages
fn resolve_method(cli: Option<LoadMethod>, settings: Option<LoadMethod>) -> Result<LoadMethod> {
    match cli.or(settings) {
        Some(method) => Ok(method),
        None => bail!(
            "No load method given: pass --create, --append or --replace, or set \"method\" in the settings file"
        ),
    }
}

#[derive(Args)]
pub struct DatabaseArgs {
    /// PostgreSQL host (défaut : env PGHOST / localhost)
    #[arg(long)]
    pub host: Option<String>,

    /// PostgreSQL database name (défaut : env PGDATABASE / postgres)
    #[arg(long)]
    pub database: Option<String>,

    /// PostgreSQL user (défaut : env PGUSER / postgres)
    #[arg(long)]
    pub user: Option<String>,

    /// PostgreSQL password (défaut : env PGPASSWORD)
    #[arg(long)]
    pub password: Option<String>,

    /// PostgreSQL port (défaut : env PGPORT / 5432)
    #[arg(long)]
    pub port: Option<u16>,

    /// Target schema (défaut : env PGSCHEMA / public)
    #[arg(long)]
    pub schema: Option<String>,

    /// SSL mode: disable, prefer, require (défaut : env PGSSLMODE / disable)
    #[arg(long)]
    pub ssl: Option<String>,
}

impl DatabaseArgs {
    /// Paramètres d'environnement surchargés par la ligne de commande
    pub fn into_params(self) -> Result<ConnectionParams> {
        let mut params = ConnectionParams::from_env();
        params.apply_overrides(ConnectionOverrides {
            host: self.host,
            dbname: self.database,
            user: self.user,
            password: self.password,
            port: self.port,
            schema: self.schema,
            ssl_mode: self.ssl.map(|s| s.parse::<SslMode>()).transpose()?,
        });
        Ok(params)
    }
}

/// Exécute la commande load
pub async fn cmd_load(args: LoadArgs) -> Result<()> {
    let started = Instant::now();
    let params = args.db.into_params()?;

    // Défauts, puis fichier de réglages, puis options explicites
    let mut options = LoadOptions {
        schema: params.schema.clone(),
        ..LoadOptions::default()
    };
    let settings = match &args.settings {
        Some(path) => LoadSettings::load(path)?,
        None => LoadSettings::default(),
    };
    let method = resolve_method(args.method.method(), settings.method)?;
    settings.apply(&mut options);
    options.method = method;
    if let Some(batch_size) = args.batch_size {
        anyhow::ensure!(batch_size > 0, "--batch-size must be greater than 0");
        options.batch_size = batch_size;
    }
    options.direct |= args.direct;
    options.copy |= args.copy;

    let features = read_geojson(&args.file)
        .with_context(|| format!("Failed to read {}", args.file.display()))?;
    let table_label = format!("{}.{}", params.schema, resolve_table_name(&args.table));

    println!("=== Load {} ===", table_label);
    println!("File: {}", args.file.display());
    println!("Features: {}", features.len());
    println!("Method: {}", method);
    println!("Batch size: {}", options.batch_size);
    println!("Direct: {}", options.direct);
    println!("Copy: {}", options.copy);
    println!(
        "Database: {}@{}:{}/{} (SSL: {:?})",
        params.user, params.host, params.port, params.dbname, params.ssl_mode
    );

    let pool = create_pool(&params)?;
    test_connection(&pool).await?;
    println!("Connected to PostgreSQL");

    let handle = load(pool, &args.table, options);
    let (sink, mut completion) = handle.split();

    let feeder = tokio::spawn(async move {
        let mut sent = 0usize;
        for feature in features {
            if sink.send(feature).await.is_err() {
                break;
            }
            sent += 1;
        }
        sent
    });

    let mut inserted = 0u64;
    while let Some(event) = completion.next_event().await {
        match event {
            LoadEvent::Inserted(delta) => {
                inserted += delta;
                info!(rows = inserted, "Rows written");
            }
            LoadEvent::Warning(message) => warn!("{}", message),
            LoadEvent::Uploaded => info!(table = %table_label, "Upload complete"),
            LoadEvent::Error(message) => error!(table = %table_label, "{}", message),
        }
    }

    let sent = feeder.await.context("Feature feeder task failed")?;
    info!(sent, "Input stream closed");

    match completion.wait().await {
        Ok(report) => {
            report.display();
            if let Some(path) = &args.report {
                report.save_to_file(path)?;
                println!("Report saved to {}", path.display());
            }
            Ok(())
        }
        Err(e) => {
            let mut report = LoadReport::failed(&table_label, method, &e.to_string());
            report.set_duration(started.elapsed());
            if let Some(path) = &args.report {
                report.save_to_file(path)?;
                println!("Report saved to {}", path.display());
            }
            Err(e.into())
        }
    }
}

/// Exécute la commande cleanup
pub async fn cmd_cleanup(db: DatabaseArgs) -> Result<()> {
    let params = db.into_params()?;
    let pool = create_pool(&params)?;
    test_connection(&pool).await?;

    let removed = cleanup_orphans(&pool, &params.schema).await?;
    println!(
        "Removed {} orphan staging table(s) from schema {}",
        removed, params.schema
    );
    Ok(())
}

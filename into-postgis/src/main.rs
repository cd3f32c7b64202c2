//! Point d'entrée CLI pour into-postgis

use anyhow::Result;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, EnvFilter};

// Charger .env au démarrage
fn load_env() {
    if dotenvy::dotenv().is_err() {
        // Essayer depuis le répertoire du binaire
        if let Ok(exe) = std::env::current_exe() {
            if let Some(dir) = exe.parent() {
                let _ = dotenvy::from_path(dir.join(".env"));
            }
        }
    }
}

mod cli;

use cli::Commands;

/// Charger des features GeoJSON dans PostGIS
#[derive(Parser)]
#[command(name = "into-postgis")]
#[command(author, version)]
#[command(about = "Charger des features GeoJSON dans une table PostGIS (création, ajout, remplacement)")]
#[command(long_about = "Chargement via une table de staging, validation puis swap transactionnel : la table cible n'est jamais visible partiellement chargée.")]
struct Cli {
    /// Augmenter la verbosité (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Mode silencieux
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();

    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    match cli.command {
        Commands::Load(args) => {
            info!(file = %args.file.display(), table = %args.table, "Load GeoJSON into PostGIS");
            cli::cmd_load(args).await?;
        }
        Commands::Cleanup { db } => {
            info!("Cleanup of orphan staging tables");
            cli::cmd_cleanup(db).await?;
        }
    }

    Ok(())
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => Level::WARN,
        (_, 0) => Level::INFO,
        (_, 1) => Level::DEBUG,
        (_, _) => Level::TRACE,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .init();
}

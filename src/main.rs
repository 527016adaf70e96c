use anyhow::Result;
use clap::{Parser, Subcommand};

use autoheal::config::AutohealConfig;

#[derive(Parser)]
#[command(
    name = "autoheal",
    about = "Anomaly correlation and bounded-risk autonomous remediation",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML config file (falls back to AUTOHEAL_CONFIG, then
    /// /etc/autoheal/autoheal.toml, then compiled-in defaults)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (ingestion API + remediation pipeline)
    Serve {
        /// Bind address (overrides the config file)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Print the effective configuration and exit
    CheckConfig,
}

fn load_config(path: Option<&str>) -> Result<AutohealConfig> {
    match path {
        Some(p) => AutohealConfig::load(std::path::Path::new(p)),
        None => Ok(AutohealConfig::load_or_default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| config.api.bind.clone());
            tracing::info!(%bind, autonomy_mode = ?config.safety.autonomy_mode, "starting autoheal daemon");
            autoheal::serve(&bind, config).await?;
        }
        Commands::CheckConfig => {
            let rendered = toml::to_string_pretty(&config)?;
            println!("{rendered}");
        }
    }

    Ok(())
}

//! Lockup Sweeper
use anyhow::{Context, Result, bail};
use bip39::Mnemonic;
use clap::{Parser, Subcommand};
use lockup_sweeper::alert::{AlertSink, LogAlertSink, WebhookAlertSink};
use lockup_sweeper::config::AppConfig;
use lockup_sweeper::horizon::HorizonGateway;
use lockup_sweeper::keys::Keypair;
use lockup_sweeper::orchestrator::Orchestrator;
use lockup_sweeper::server::{self, AppState};
use lockup_sweeper::store::{JsonWalletStore, WalletStore};
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::RwLock;
use tracing::info;
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "lockup_sweeper")]
struct Cli {
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "wallets.json")]
    store: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP control surface
    Serve {
        /// Start the bot immediately with the saved configuration
        #[arg(long)]
        autostart: bool,
    },

    /// Run the bot until Ctrl+C, then wait for in-flight tasks
    Run,

    /// Submit secret phrases from a file, one per line
    Schedule { file: PathBuf },

    /// Print wallet counts per status
    Summary,

    /// Run the full pipeline for one wallet immediately
    ForceRun { secret_phrase: String },

    /// Write a config file with freshly generated sponsor phrases
    InitConfig {
        #[arg(long, default_value = "5")]
        sponsors: usize,

        #[arg(long)]
        recipient: Option<String>,

        #[arg(long)]
        funding_phrase: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lockup_sweeper=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    if let Commands::InitConfig {
        sponsors,
        recipient,
        funding_phrase,
    } = &cli.command
    {
        return init_config(&cli.config, *sponsors, recipient.clone(), funding_phrase.clone())
            .await;
    }

    info!("Loading configuration from {}", cli.config.display());
    let config = AppConfig::load(&cli.config).await?;

    info!("Loading wallet store from {}", cli.store.display());
    let store: Arc<dyn WalletStore> = Arc::new(JsonWalletStore::load(cli.store.clone()).await?);

    let ledger = Arc::new(HorizonGateway::new(
        config.network.horizon_endpoints.clone(),
        &config.network.network_passphrase,
    )?);

    let alerts: Arc<dyn AlertSink> = match &config.alerts.webhook_url {
        Some(url) => Arc::new(WebhookAlertSink::new(url.clone())),
        None => Arc::new(LogAlertSink),
    };

    let orchestrator = Arc::new(Orchestrator::new(
        ledger,
        Arc::clone(&store),
        alerts,
        config.engine_settings(),
    ));

    match cli.command {
        Commands::Serve { autostart } => {
            if autostart {
                orchestrator.start(config.run.clone()).await?;
            }
            let state = AppState {
                orchestrator: Arc::clone(&orchestrator),
                config: Arc::new(RwLock::new(config)),
                config_path: cli.config.clone(),
            };
            server::serve(state, server::shutdown_on(signal::ctrl_c())).await?;
            orchestrator.stop_and_drain().await;
        }
        Commands::Run => {
            orchestrator.start(config.run.clone()).await?;
            signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
            info!("Received Ctrl+C, shutting down gracefully...");
            orchestrator.stop_and_drain().await;
        }
        Commands::Schedule { file } => {
            let content = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let phrases: Vec<String> = content.lines().map(str::to_string).collect();
            let stats = orchestrator.schedule_new(&phrases).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Summary => {
            let summary = store.summary().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::ForceRun { secret_phrase } => {
            orchestrator.start(config.run.clone()).await?;
            let outcome = orchestrator.force_run(&secret_phrase).await;
            orchestrator.stop_and_drain().await;
            println!("{}", outcome?);
        }
        Commands::InitConfig { .. } => {
            unreachable!("InitConfig handled above");
        }
    }

    info!("Lockup Sweeper shutdown complete");
    Ok(())
}

async fn init_config(
    path: &Path,
    sponsors: usize,
    recipient: Option<String>,
    funding_phrase: Option<String>,
) -> Result<()> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        bail!("{} already exists", path.display());
    }

    info!("Generating {} sponsor phrase(s)", sponsors);
    let mut config = AppConfig::default();
    config.run.sponsor_phrases = (0..sponsors)
        .map(|_| generate_phrase())
        .collect::<Result<_>>()?;
    config.run.recipient = recipient.unwrap_or_default();
    config.run.funding_phrase = funding_phrase.unwrap_or_default();

    for (i, phrase) in config.run.sponsor_phrases.iter().enumerate() {
        let keypair = Keypair::from_phrase(phrase)?;
        info!("  Sponsor {}: {}", i + 1, keypair.public_key());
    }

    config.save(path).await?;
    info!("✓ Created configuration file: {}", path.display());
    if let Err(e) = config.run.validate() {
        info!("Edit the file before starting: {}", e);
    }
    Ok(())
}

fn generate_phrase() -> Result<String> {
    let mut entropy = [0u8; 16];
    rand::rng().fill(&mut entropy);
    let mnemonic = Mnemonic::from_entropy(&entropy).context("Failed to build mnemonic")?;
    Ok(mnemonic.to_string())
}

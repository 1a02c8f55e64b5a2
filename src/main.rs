mod attachments;
mod cli;
mod config;
mod dispatch;
mod error;
mod llm;
mod models;
mod orchestrator;
mod persist;
mod postprocess;
mod prompt;
mod stream;
mod types;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::AppConfig;
use dispatch::Dispatcher;
use orchestrator::Orchestrator;
use persist::{FileStore, MemoryStore, UserDataStore};

#[derive(Parser, Debug)]
#[command(name = "parley")]
#[command(about = "Streaming chat with Perplexity, OpenAI, Anthropic and Gemini models")]
struct Args {
    /// Config file (default: ~/.parley/config.toml, created on first run)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Model id to start with
    #[arg(short, long)]
    model: Option<String>,

    /// User id whose conversations are loaded and saved
    #[arg(short, long)]
    user: Option<String>,

    /// Keep conversations in memory only
    #[arg(long)]
    ephemeral: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let config_path = match args.config {
        Some(path) => path,
        None => AppConfig::config_path()?,
    };
    if !config_path.exists() {
        AppConfig::save_default(&config_path)?;
        println!("[Config] Created default config: {}", config_path.display());
        println!("[Config] Add your API keys under [settings.keys] or via environment variables.");
    }

    let mut config = AppConfig::load_from(&config_path)?;
    if let Some(model) = args.model {
        config.pin_model(model);
    }
    if let Some(user) = args.user {
        config.storage.user_id = user;
    }
    config.validate()?;

    let store: Arc<dyn UserDataStore> = if args.ephemeral {
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(FileStore::new(config.data_dir()?))
    };
    let dispatcher = Arc::new(Dispatcher::from_config(&config));
    info!(
        model = %config.settings.model,
        user = %config.storage.user_id,
        ephemeral = args.ephemeral,
        "starting parley"
    );

    let mut orchestrator = Orchestrator::load(&config, dispatcher, store).await;
    let outcome = cli::run(&mut orchestrator).await;

    if let Err(err) = orchestrator.flush().await {
        warn!(error = %err, "final save failed");
    }
    outcome
}

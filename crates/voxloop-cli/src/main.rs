use std::sync::Arc;

use clap::{Parser, Subcommand};

use voxloop_core::config::Config;
use voxloop_gateway::{start_gateway, GatewayState};
use voxloop_media::{Synthesizer, Transcriber};
use voxloop_pipeline::{LlmSettings, Orchestrator};
use voxloop_providers::openai::OpenAiProvider;

#[derive(Parser)]
#[command(
    name = "voxloop",
    about = "Streaming voice conversation gateway — speech in, spoken reply out while the model is still generating",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Gateway {
        /// Port to listen on (default: 3000)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show version and configuration summary
    Status,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the resolved config (secrets redacted)
    Show,
    /// Print the config file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    // Load config
    let config_path = cli
        .config
        .map(std::path::PathBuf::from)
        .unwrap_or_else(Config::config_dir);

    let config = Config::load(&config_path)?;

    match cli.command {
        Commands::Gateway { port } => {
            let port = port.unwrap_or_else(|| config.server_port());
            let state = build_state(config)?;
            tracing::info!(port, "Starting Voxloop gateway");
            start_gateway(state, port).await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                println!("{}", serde_json::to_string_pretty(&config.redacted())?);
            }
            ConfigAction::Path => {
                println!("{}", config_path.display());
            }
        },
        Commands::Status => {
            println!("Voxloop v{}", env!("CARGO_PKG_VERSION"));
            println!("Config: {}", config_path.display());
            println!("Gateway port: {}", config.server_port());
            println!("LLM model: {}", config.llm_model());
            println!("STT model: {}", config.stt_model());
            println!("TTS model: {}", config.tts_model_id());
        }
    }

    Ok(())
}

/// Wire the pipeline stages into shared gateway state.
fn build_state(config: Config) -> anyhow::Result<Arc<GatewayState>> {
    let config = Arc::new(config);

    let transcriber = Transcriber::from_config(&config)?;
    let synthesizer = Synthesizer::from_config(&config)?;

    let llm_api_key = config
        .llm_api_key()
        .ok_or_else(|| anyhow::anyhow!("No LLM API key configured"))?;
    let llm_base_url = config.llm_base_url();
    let provider = OpenAiProvider::new(Some(&llm_base_url), llm_api_key);

    let orchestrator = Orchestrator::new(
        Arc::new(transcriber),
        Arc::new(provider),
        Arc::new(synthesizer),
        LlmSettings::from_config(&config),
    );

    Ok(Arc::new(GatewayState::new(config, Arc::new(orchestrator))))
}

// llama-gateway/crates/llama-gateway/src/main.rs

use std::path::PathBuf;

use clap::Parser;

use llama_gateway::{run_gateway, telemetry};

#[derive(Parser, Debug)]
#[command(
    name = "llama-gateway",
    about = "Local multiplexing gateway for llama.cpp-family model servers"
)]
struct Cli {
    /// Path to the config file (defaults to ~/.llama-gateway/config.json).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Minimum console log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Accepted for launcher compatibility; the gateway always runs without
    /// a UI.
    #[arg(long)]
    headless: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing(&cli.log_level);

    let config_path = cli
        .config
        .unwrap_or_else(llama_gateway::config::default_config_path);
    run_gateway(config_path).await
}

use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Fleet Agent — serverless GPU worker sidecar
#[derive(Parser)]
#[command(name = "fleet-agent", version, about)]
struct Cli {
    /// Override listen address (e.g., 0.0.0.0:3000)
    #[arg(short, long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> fleet_agent::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    tracing::info!("Fleet Agent v{}", fleet_agent::VERSION);

    let mut config = fleet_agent::WorkerConfig::from_env();
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }

    fleet_agent::WorkerAgent::new(config)?.run().await
}

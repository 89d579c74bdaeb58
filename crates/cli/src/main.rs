mod supervisor;

use clap::{Parser, Subcommand};
use supervisor::Supervisor;

#[derive(Parser)]
#[command(name = "botfleet")]
#[command(about = "Bot fleet controller for the coding-duel platform", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the fleet controller
    Run {
        /// Config file path
        #[arg(short, long, default_value = "config/Config.toml")]
        config: String,
    },
    /// Validate the configuration and print the effective values
    CheckConfig {
        /// Config file path
        #[arg(short, long, default_value = "config/Config.toml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            let config = botfleet_core::ConfigLoader::load_from(&config)?;
            Supervisor::run(config).await?;
        }
        Commands::CheckConfig { config } => {
            let config = botfleet_core::ConfigLoader::load_from(&config)?;
            config.validate()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

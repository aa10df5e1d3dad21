use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use monkchat::config::{Config, DriveStrategy};

mod commands;

#[derive(Parser)]
#[command(name = "monkchat")]
#[command(version)]
#[command(about = "Talk to Buddhist monk personas backed by a hosted assistant", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// How replies are obtained: poll (then replay) or stream
    #[arg(long, global = true)]
    strategy: Option<DriveStrategy>,

    /// Use a built-in scripted backend instead of the remote API
    #[arg(long, global = true)]
    offline: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive conversation (default)
    Chat {
        /// Persona to start with, by name or number
        #[arg(short, long)]
        persona: Option<String>,
    },
    /// Ask a single question and print the answer
    Ask {
        #[arg(short, long)]
        persona: Option<String>,
        message: String,
    },
    /// List the available personas
    Personas,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = Config::load()?;
    if let Some(strategy) = cli.strategy {
        config.driver.strategy = strategy;
    }

    match cli.command.unwrap_or(Commands::Chat { persona: None }) {
        Commands::Personas => commands::list_personas(&config),
        Commands::Chat { persona } => commands::chat(&config, cli.offline, persona.as_deref()).await,
        Commands::Ask { persona, message } => {
            commands::ask(&config, cli.offline, persona.as_deref(), &message).await
        }
    }
}

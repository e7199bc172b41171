use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use homebid::config::CONFIG_FILE;

mod cmd;

#[derive(Parser)]
#[command(name = "homebid")]
#[command(version, about = "Home-services marketplace backend")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the configuration file
    #[arg(long, global = true, default_value = CONFIG_FILE)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP and WebSocket server
    Serve {
        /// Interface to bind
        #[arg(long)]
        host: Option<String>,

        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Enable dev mode (permissive CORS for a local frontend)
        #[arg(long)]
        dev: bool,
    },
    /// Create the database and run migrations
    InitDb {
        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Create an admin account with this email
        #[arg(long, requires = "admin_name")]
        admin_email: Option<String>,

        /// Display name for the admin account
        #[arg(long, requires = "admin_email")]
        admin_name: Option<String>,
    },
    /// Show the commission owed on a bid amount
    Quote {
        /// Bid amount in cents
        #[arg(allow_hyphen_values = true)]
        amount_cents: i64,

        /// Print the breakdown as JSON
        #[arg(long)]
        json: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration (file plus environment)
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default homebid.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Serve {
            host,
            port,
            db_path,
            dev,
        } => {
            let overrides = cmd::ServeOverrides {
                host: host.clone(),
                port: *port,
                db_path: db_path.clone(),
                dev: *dev,
            };
            cmd::cmd_serve(&cli, overrides).await?;
        }
        Commands::InitDb {
            db_path,
            admin_email,
            admin_name,
        } => {
            let admin = admin_email.as_deref().zip(admin_name.as_deref());
            cmd::cmd_init_db(&cli, db_path.clone(), admin)?;
        }
        Commands::Quote { amount_cents, json } => cmd::cmd_quote(&cli, *amount_cents, *json)?,
        Commands::Config { command } => cmd::cmd_config(&cli, command.clone())?,
    }

    Ok(())
}

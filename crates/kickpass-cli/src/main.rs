//! kickpass - stupid simple password safe
//!
//! Usage:
//!   kickpass init              - Initialize the storage root
//!   kickpass create <safe>     - Create a safe in your editor
//!   kickpass edit <safe>       - Edit an existing safe
//!   kickpass cat <safe>        - Print a safe's metadata (or password)
//!   kickpass forget <safe>     - Drop a safe from the agent cache
//!   kickpass agent             - Run the caching agent
//!   kickpass version           - Show tool and storage versions

mod commands;
mod prompt;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use kickpass_core::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "kickpass")]
#[command(author = "Paul Fariello")]
#[command(version)]
#[command(about = "Stupid simple password safe with a caching agent", long_about = None)]
struct Cli {
    /// Configuration file (default ~/.kickpass/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging to stderr
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the storage root
    Init,

    /// Create a new password safe
    #[command(visible_aliases = ["new", "insert"])]
    Create {
        /// Safe path, e.g. email/gmail
        safe: String,
    },

    /// Edit an existing safe
    Edit {
        safe: String,
    },

    /// Print a safe's metadata
    #[command(visible_alias = "open")]
    Cat {
        /// Print the password instead of the metadata
        #[arg(short, long)]
        password: bool,

        safe: String,
    },

    /// Drop a safe from the agent cache
    Forget {
        safe: String,
    },

    /// Run the caching agent in the foreground
    Agent,

    /// Show tool and storage engine versions
    Version,
}

fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

/// Exit status for a failed command: the kind of the first lifecycle error
/// in the chain, 1 for anything else
fn exit_code(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<kickpass_core::Error>())
        .map(|e| e.kind().exit_code())
        .unwrap_or(1)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Init => commands::init(&config),
        Commands::Create { safe } => commands::create(config, &safe).await,
        Commands::Edit { safe } => commands::edit(config, &safe).await,
        Commands::Cat { password, safe } => commands::cat(config, &safe, password).await,
        Commands::Forget { safe } => commands::forget(&config, &safe).await,
        Commands::Agent => commands::agent(&config).await,
        Commands::Version => commands::version(&config),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.debug);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("kickpass: {:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}

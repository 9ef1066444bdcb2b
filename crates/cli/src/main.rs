//! attestgate CLI — the main entry point.
//!
//! Commands:
//! - `serve`   — Start the HTTP gateway, running the full boot sequence
//! - `keygen`  — Force-generate a new signing key, refusing to overwrite one
//! - `migrate` — Apply the `users`/`query_logs` schema to the database
//! - `health`  — One-shot readiness probe against a running instance

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "attestgate",
    about = "attestgate — an authenticated, attestable LLM inference gateway",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full boot sequence and start the HTTP gateway
    Serve {
        /// Run database migrations before starting, if not already applied
        #[arg(long)]
        auto_migrate: bool,
    },

    /// Generate a new signing key, refusing to overwrite an existing one
    Keygen,

    /// Apply the users/query_logs schema to the configured database
    Migrate,

    /// One-shot readiness probe against a running instance
    Health {
        /// Base URL of the instance to probe
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        url: String,
    },
}

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Serve { auto_migrate } => commands::serve::run(auto_migrate).await?,
        Commands::Keygen => commands::keygen::run()?,
        Commands::Migrate => commands::migrate::run().await?,
        Commands::Health { url } => commands::health::run(&url).await?,
    }

    Ok(())
}

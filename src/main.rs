mod commands;
mod config;
mod error;

use clap::{Parser, Subcommand};
use commands::*;
use std::io;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "amt-agent", about = "Intel AMT provisioning agent tools", version)]
struct Cli {
    /// Agent INI file. Defaults to $AMT_AGENT_CONFIG or ./amt-agent.ini.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the stored policy and whether an admin password is stored.
    Status,
    /// Validate and store a policy, e.g. '{"type":2,"badpass":1}'.
    SetPolicy { policy: String },
    /// Print the host-based setup digest for a credential.
    Digest {
        user: String,
        realm: String,
        password: String,
    },
    /// Serve the tunnel control protocol over stdin/stdout.
    Ctrl {
        #[arg(long)]
        root: Option<PathBuf>,
    },
}

fn init_tracing(debug: bool) {
    let default = if debug {
        "amt_agent=debug,amt_core=debug"
    } else {
        "amt_agent=info,amt_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(config::paths::agent_config_path);
    let config = config::load_agent_config(&config_path)?;
    init_tracing(config.debug);
    tracing::debug!(path = %config_path.display(), "configuration loaded");

    let result = match cli.command {
        Commands::Status => status_cmd(&config).map(|report| print_json(&report)),
        Commands::SetPolicy { policy } => set_policy_cmd(&config, &policy).map(|p| print_json(&p)),
        Commands::Digest {
            user,
            realm,
            password,
        } => {
            println!("{}", digest_cmd(&user, &realm, &password));
            Ok(Ok(()))
        }
        Commands::Ctrl { root } => {
            let stdin = io::stdin();
            ctrl_cmd(&config, root, stdin.lock(), io::stdout().lock()).map(Ok)
        }
    };

    match result {
        Ok(printed) => printed,
        Err(err) => {
            eprintln!("{}", serde_json::to_string(&err)?);
            std::process::exit(1);
        }
    }
}

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "ogctl",
    about = "offergrid — inspect and repair a scheduler state store",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Path to the scheduler's state store
    #[arg(short, long, global = true, default_value = "/var/lib/offergrid/offergrid.redb")]
    data: PathBuf,
    /// Output format: text or json
    #[arg(short, long, global = true, default_value = "text")]
    format: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List applications
    Apps {
        /// Only this namespace
        #[arg(short, long)]
        namespace: Option<String>,
    },
    /// List the taskgroups of one application
    Taskgroups { namespace: String, app: String },
    /// List transactions
    Transactions {
        #[arg(short, long)]
        namespace: Option<String>,
        /// Include finished, failed and timed-out transactions
        #[arg(short, long)]
        all: bool,
    },
    /// List agents and their outstanding reservations
    Agents,
    /// Run a consistency check against the store.
    ///
    /// Agent staleness needs the cluster manager and is not checked here.
    /// With --recover, orphan taskgroup records are deleted, expired
    /// transactions are timed out and stuck rolling flags are cleared.
    Check {
        #[arg(long)]
        recover: bool,
    },
    /// Print per-application gauges in Prometheus text format
    Metrics,
    /// Validate a scheduler config file and print the effective settings
    Config { file: PathBuf },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn,ogctl=info")),
        )
        .init();

    let cli = Cli::parse();
    let json = cli.format == "json";

    match cli.command {
        Commands::Apps { namespace } => {
            commands::inspect::apps(&cli.data, namespace.as_deref(), json)
        }
        Commands::Taskgroups { namespace, app } => {
            commands::inspect::taskgroups(&cli.data, &namespace, &app, json)
        }
        Commands::Transactions { namespace, all } => {
            commands::inspect::transactions(&cli.data, namespace.as_deref(), all, json)
        }
        Commands::Agents => commands::inspect::agents(&cli.data, json),
        Commands::Check { recover } => commands::check::check(&cli.data, recover, json),
        Commands::Metrics => commands::check::metrics(&cli.data),
        Commands::Config { file } => commands::check::config(&file, json),
    }
}

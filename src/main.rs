use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use coupon_quorum::{Backend, Config, Validator, import::import_sources};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(version, about)]
struct Cli {
    /// Path to config file
    #[clap(short, long)]
    config: Option<PathBuf>,
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check the given codes and print whether each is valid.
    Check {
        /// Backend to use instead of the configured one
        #[clap(long, value_enum)]
        backend: Option<Backend>,
        /// Codes to check
        #[clap(required = true)]
        codes: Vec<String>,
    },
    /// Answer codes read line by line from stdin until EOF or Ctrl-C.
    Run {
        /// Backend to use instead of the configured one
        #[clap(long, value_enum)]
        backend: Option<Backend>,
    },
    /// Print every known code with the number of sources containing it.
    Snapshot {
        /// Backend to use instead of the configured one
        #[clap(long, value_enum)]
        backend: Option<Backend>,
        /// Only print codes that reach the quorum threshold
        #[clap(long)]
        valid_only: bool,
    },
    /// Build the persistent store from the configured sources.
    Import {
        /// Replace an existing store
        #[clap(long)]
        force: bool,
        /// Store location, overriding the config
        #[clap(long)]
        store: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let args = Cli::parse();

    let mut config = if let Some(path) = args.config {
        debug!("loading config from {:?}", path);
        Config::load(path).await?
    } else {
        debug!("using default config");
        Config::default()
    };

    match args.command {
        Commands::Check { backend, codes } => {
            config.backend = backend.unwrap_or(config.backend);
            let validator = Validator::from_config(&config).await?;
            for code in codes {
                println!("{code}\t{}", verdict(validator.is_valid_promo(&code)));
            }
            validator.shutdown().await;
        }
        Commands::Run { backend } => {
            config.backend = backend.unwrap_or(config.backend);
            let validator = Validator::from_config(&config).await?;
            serve_stdin(&validator).await?;
            validator.shutdown().await;
        }
        Commands::Snapshot {
            backend,
            valid_only,
        } => {
            config.backend = backend.unwrap_or(config.backend);
            let validator = Validator::from_config(&config).await?;
            let mut counts: Vec<_> = validator
                .snapshot()?
                .into_iter()
                .filter(|(_, count)| !valid_only || *count >= config.quorum_threshold)
                .collect();
            counts.sort_unstable();
            for (code, count) in counts {
                println!("{code}\t{count}");
            }
            validator.shutdown().await;
        }
        Commands::Import { force, store } => {
            let path = match store {
                Some(path) => path,
                None => config.store_path()?,
            };
            let stats = import_sources(&config, &path, force).await?;
            for (name, count) in stats.per_partition {
                println!("{name}\t{count}");
            }
        }
    }
    Ok(())
}

/// Answer codes from stdin, one per line, until EOF or Ctrl-C.
async fn serve_stdin(validator: &Validator) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            biased;

            _ = &mut ctrl_c => {
                info!("received ctrl-c, shutting down");
                break;
            }
            line = lines.next_line() => {
                let Some(code) = line? else {
                    debug!("stdin closed");
                    break;
                };
                println!("{code}\t{}", verdict(validator.is_valid_promo(&code)));
            }
        }
    }
    Ok(())
}

fn verdict(valid: bool) -> &'static str {
    if valid { "valid" } else { "invalid" }
}

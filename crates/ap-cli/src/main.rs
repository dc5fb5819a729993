use anyhow::Result;
use ap_relay::tenant::TenantConfig;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "apiary", version, about = "Multi-tenant Nostr group relay")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve every tenant found in the config directory (the default).
    Serve,
    /// Parse each tenant file and report problems without serving.
    CheckConfig {
        /// Config directory; defaults to the CONFIG env var.
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let config = ap_relay::load_config()?;
            ap_relay::run(config).await
        }
        Commands::CheckConfig { dir } => {
            let dir = match dir {
                Some(dir) => dir,
                None => PathBuf::from(std::env::var("CONFIG").unwrap_or_else(|_| "./config".into())),
            };
            check_config(&dir)
        }
    }
}

fn check_config(dir: &PathBuf) -> Result<()> {
    let mut failures = 0usize;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.metadata()?.is_dir() {
            continue;
        }
        let path = entry.path();
        match TenantConfig::load(&path) {
            Ok(config) => {
                println!("ok: {} (host {}, schema {})", path.display(), config.host, config.schema);
            }
            Err(err) => {
                failures += 1;
                println!("error: {}: {err:#}", path.display());
            }
        }
    }

    if failures > 0 {
        std::process::exit(1);
    }
    Ok(())
}

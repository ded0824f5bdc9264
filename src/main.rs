use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use beoflow::server::{ServerConfig, start_server};

#[derive(Parser)]
#[command(name = "beoflow")]
#[command(version, about = "BEO digitization and review workflow server")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the workflow server
    Serve {
        /// Port to serve on
        #[arg(short, long, default_value = "8000")]
        port: u16,

        /// Path to the SQLite database
        #[arg(long, default_value = "beoflow.db")]
        db_path: PathBuf,

        /// Root directory for originals, thumbnails and high-res images
        #[arg(long, env = "STORAGE_ROOT", default_value = "storage")]
        storage_root: PathBuf,

        /// Enable dev mode (bind 0.0.0.0 instead of localhost)
        #[arg(long)]
        dev: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    match cli.command {
        Commands::Serve {
            port,
            db_path,
            storage_root,
            dev,
        } => {
            start_server(ServerConfig {
                port,
                db_path,
                storage_root,
                dev_mode: dev,
            })
            .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_root_falls_back_to_env_var() {
        let cli = Cli::try_parse_from(["beoflow", "serve"]).unwrap();
        let Commands::Serve { storage_root, .. } = cli.command;
        assert_eq!(storage_root, PathBuf::from("storage"));

        unsafe { std::env::set_var("STORAGE_ROOT", "/srv/beo-images") };
        let cli = Cli::try_parse_from(["beoflow", "serve"]).unwrap();
        let Commands::Serve { storage_root, .. } = cli.command;
        assert_eq!(storage_root, PathBuf::from("/srv/beo-images"));

        // An explicit flag still wins over the environment.
        let cli =
            Cli::try_parse_from(["beoflow", "serve", "--storage-root", "/tmp/override"]).unwrap();
        let Commands::Serve { storage_root, .. } = cli.command;
        assert_eq!(storage_root, PathBuf::from("/tmp/override"));
        unsafe { std::env::remove_var("STORAGE_ROOT") };
    }
}

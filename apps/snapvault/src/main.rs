//! snapvault entry point.

mod app;
mod config;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Chunked, verified uploads of disk images to blob storage.
#[derive(Debug, Parser)]
#[command(name = "snapvault", version, about)]
struct Cli {
    /// Configuration file. Defaults to the per-user config location.
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Upload a disk image to one or all configured targets.
    Upload {
        /// Image file to upload.
        image: PathBuf,

        /// Only upload to this target.
        #[arg(long, short)]
        target: Option<String>,
    },
    /// Delete temporary chunk objects left behind by interrupted uploads.
    Prune {
        #[arg(long, short)]
        target: Option<String>,

        /// Only list what would be deleted.
        #[arg(long)]
        dry_run: bool,
    },
    /// List configured targets.
    Targets,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.unwrap_or_else(config::default_config_path);
    let config = config::Config::load(&config_path)?;
    tracing::debug!(
        path = %config_path.display(),
        targets = config.targets.len(),
        "configuration loaded"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        match cli.command {
            Command::Upload { image, target } => {
                let cancel = CancellationToken::new();
                let on_signal = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::warn!("interrupt received, cancelling after cleanup");
                        on_signal.cancel();
                    }
                });
                app::upload(&config, &image, target.as_deref(), cancel).await
            }
            Command::Prune { target, dry_run } => {
                app::prune(&config, target.as_deref(), dry_run).await
            }
            Command::Targets => app::targets(&config),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_upload_with_target() {
        let cli = Cli::try_parse_from([
            "snapvault",
            "--config",
            "/tmp/c.toml",
            "upload",
            "disk.sparseimage",
            "--target",
            "nas",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.toml")));
        match cli.command {
            Command::Upload { image, target } => {
                assert_eq!(image, PathBuf::from("disk.sparseimage"));
                assert_eq!(target.as_deref(), Some("nas"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn parses_prune_dry_run() {
        let cli = Cli::try_parse_from(["snapvault", "prune", "--dry-run"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Prune {
                target: None,
                dry_run: true
            }
        ));
    }

    #[test]
    fn upload_requires_image() {
        assert!(Cli::try_parse_from(["snapvault", "upload"]).is_err());
    }
}

//! vch-portlayer: control-plane API of a virtual container host.
//!
//! ```text
//! vch-portlayer serve [--config FILE] [--listen ADDR]
//! vch-portlayer validate --inventory FILE --install FILE [--apply]
//! vch-portlayer print-config [--config FILE]
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;

use vch_portlayer::api::{self, PortLayer};
use vch_portlayer::config::PortLayerConfig;
use vch_portlayer::logging;
use vch_portlayer::paths::PortLayerPaths;
use vch_portlayer::validate::{Dispatcher, InstallConfig, InventorySnapshot, LocalInventory, Validator};

#[derive(Parser, Debug)]
#[command(name = "vch-portlayer", version, about = "Virtual container host port layer")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API over the local datastore and compute simulator.
    Serve {
        /// Config file; defaults to portlayer.toml in the config directory.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Overrides `service.listen`.
        #[arg(short, long)]
        listen: Option<String>,
    },
    /// Check an install configuration against an inventory snapshot.
    Validate {
        /// TOML snapshot of the target inventory.
        #[arg(long)]
        inventory: PathBuf,
        /// TOML install configuration.
        #[arg(long)]
        install: PathBuf,
        /// Write missing target settings after a clean report.
        #[arg(long)]
        apply: bool,
    },
    /// Print the effective configuration as TOML.
    PrintConfig {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn load_config(paths: &PortLayerPaths, path: Option<PathBuf>) -> Result<PortLayerConfig> {
    let path = path.unwrap_or_else(|| paths.config_file());
    PortLayerConfig::load(&path).with_context(|| format!("load config {}", path.display()))
}

async fn serve(paths: PortLayerPaths, config: Option<PathBuf>, listen: Option<String>) -> Result<()> {
    let mut cfg = load_config(&paths, config)?;
    if let Some(listen) = listen {
        cfg.service.listen = listen;
    }
    paths.ensure().context("create directories")?;

    let state = PortLayer::local(&cfg, &paths)
        .await
        .context("initialise port layer")?;
    let listener = tokio::net::TcpListener::bind(&cfg.service.listen)
        .await
        .with_context(|| format!("bind {}", cfg.service.listen))?;

    api::serve(listener, Arc::new(state), async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutting down");
    })
    .await?;
    Ok(())
}

async fn validate(inventory: PathBuf, install: PathBuf, apply: bool) -> Result<()> {
    let snapshot = InventorySnapshot::load(&inventory)
        .with_context(|| format!("load inventory {}", inventory.display()))?;
    let cfg = InstallConfig::load(&install).with_context(|| format!("load install config {}", install.display()))?;

    let inventory = Arc::new(LocalInventory::new(snapshot));
    let report = Validator::new(inventory.clone()).validate(&cfg).await;
    print!("{report}");
    if !report.is_ok() {
        bail!("validation failed with {} issue(s)", report.issues.len());
    }

    if apply {
        let written = Dispatcher::new(inventory.clone())
            .apply_prerequisites(&report)
            .await
            .context("apply prerequisites")?;
        println!("{written} target setting(s) written");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let paths = PortLayerPaths::resolve().context("HOME is not set")?;
    let _log_guard = logging::init(Some(&paths.logs));

    match args.command {
        Command::Serve { config, listen } => serve(paths, config, listen).await,
        Command::Validate {
            inventory,
            install,
            apply,
        } => validate(inventory, install, apply).await,
        Command::PrintConfig { config } => {
            let cfg = load_config(&paths, config)?;
            print!("{}", cfg.to_toml()?);
            Ok(())
        }
    }
}

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use nh_agent_core::config::Config;
use nh_agent_core::logging::{initialize_dev_logging, initialize_prod_logging};
use nh_agent_core::policy::DefaultPolicy;
use nh_agent_core::supervisor::Supervisor;
use nh_agent_platform_linux::{FwupFlasher, SysinfoNetworkObserver, UBootSlotStore};
use tracing::{error, info};

/// Runs the firmware-update agent: loads `--config`, wires the Linux
/// platform adapters, and drives the supervisor until interrupted.
#[derive(Parser)]
#[command(name = "nh-agent")]
#[command(about = "Fleet firmware-update agent")]
struct Cli {
    /// Path to a JSON configuration file (see nh_agent_core::config::Config).
    #[arg(short, long)]
    config: PathBuf,

    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,

    /// Path to the `fwup` binary.
    #[arg(long, default_value = "fwup")]
    fwup_path: String,

    /// Path to the `fw_printenv` binary used to read slot state.
    #[arg(long, default_value = "fw_printenv")]
    fw_printenv_path: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        initialize_dev_logging()?;
    } else {
        initialize_prod_logging()?;
    }

    let config_text = tokio::fs::read_to_string(&cli.config).await?;
    let config: Config = serde_json::from_str(&config_text)?;
    config.validate()?;
    let device_path = config.firmware_device_path.display().to_string();
    let config = Arc::new(config);

    let flasher = Arc::new(FwupFlasher::new(cli.fwup_path, device_path));
    let slot_store = Arc::new(UBootSlotStore::new(cli.fw_printenv_path));
    let network = Arc::new(SysinfoNetworkObserver::new());
    let policy = Arc::new(DefaultPolicy);

    let supervisor = Supervisor::start(config, policy, flasher, slot_store, network).await?;

    info!("nh-agent starting");
    tokio::select! {
        _ = supervisor.run() => {
            error!("channel client loop exited unexpectedly");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            supervisor.stop().await;
        }
    }

    Ok(())
}

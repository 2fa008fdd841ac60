pub mod cache;
pub mod config;
pub mod detect_config;
pub mod exec;
pub mod fetch_crashes;
pub mod provision;
pub mod reconnect;
pub mod restart;

use anyhow::{anyhow, Result};
use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

use dut_provision::config::{Config, DutConfig};
use dut_provision::lro::Operation;
use dut_provision::service::DutService;

/// Options shared by every command that talks to a device.
#[derive(Args, Debug, Clone)]
pub struct DeviceArgs {
    #[arg(short, long, help = "Configuration file (defaults to the user config dir)")]
    pub config: Option<PathBuf>,

    #[arg(short, long, help = "Device name or host[:port], overrides dut.name")]
    pub dut: Option<String>,
}

impl DeviceArgs {
    pub fn load_config(&self) -> Result<Config> {
        let loaded = match &self.config {
            Some(path) => Config::load_from(path),
            None => Config::load(),
        };

        match (loaded, &self.dut) {
            (Ok(mut config), Some(dut)) => {
                config.dut.name = dut.clone();
                Ok(config)
            }
            (Ok(config), None) => Ok(config),
            // A device given on the command line is enough to run without a file.
            (Err(_), Some(dut)) if self.config.is_none() => {
                Ok(Config::new(DutConfig::new(dut.clone())))
            }
            (Err(e), _) => Err(anyhow!(
                "{}\n\nPass --dut <host> or create a config with `dut-provision config init`",
                e
            )),
        }
    }

    pub fn service(&self) -> Result<(Config, DutService)> {
        let config = self.load_config()?;
        let service = DutService::from_config(&config);
        Ok((config, service))
    }
}

/// Blocks on a background operation and turns its failure into an error.
pub async fn wait_for(service: &DutService, op: Operation, timeout: Duration) -> Result<Operation> {
    println!("Started {}", op.name);
    let op = service.wait_operation(&op.name, timeout).await?;
    match &op.result {
        None => Err(anyhow!("{} still running after {:?}", op.name, timeout)),
        Some(Err(e)) => Err(anyhow!("{} failed ({:?}): {}", op.name, e.kind, e.message)),
        Some(Ok(_)) => Ok(op),
    }
}

use anyhow::{anyhow, Context, Result};
use clap::Args;
use log::info;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dut_provision::provision::{self, context_from_config, ProvisionRequest, ProvisionResponse};
use dut_provision::remote::DutAdapter;

use crate::cli::DeviceArgs;

#[derive(Args)]
#[command(about = "Install an OS image, firmware and DLCs on the device")]
pub struct ProvisionCommand {
    #[command(flatten)]
    device: DeviceArgs,

    #[arg(short, long, help = "Provision request (YAML)")]
    input: PathBuf,

    #[arg(short, long, help = "Where to write the provision response (JSON)")]
    output: PathBuf,
}

impl ProvisionCommand {
    pub async fn execute(self) -> Result<()> {
        let contents = fs::read_to_string(&self.input)
            .with_context(|| format!("failed to read request {}", self.input.display()))?;
        let request = ProvisionRequest::from_yaml(&contents)?;
        let config = self.device.load_config()?;

        info!("Provisioning {} with {}", config.dut.name, request.image_path);
        let adapter = Arc::new(DutAdapter::from_config(&config));
        let mut ctx = context_from_config(&config, Arc::clone(&adapter), request);
        let response = provision::provision(&mut ctx).await;
        adapter.close();

        save_response(&self.output, &response)?;

        if response.is_success() {
            println!("✓ Provisioned {}", response.dut);
            Ok(())
        } else {
            Err(anyhow!(
                "failed to provision ({:?}): {}",
                response.status,
                response.error.as_deref().unwrap_or("unknown error")
            ))
        }
    }
}

fn save_response(path: &Path, response: &ProvisionResponse) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create directory for {}", path.display()))?;
    }
    let json = serde_json::to_string_pretty(response)?;
    fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dut_provision::provision::ProvisionStatus;
    use tempfile::TempDir;

    #[test]
    fn test_save_response_creates_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out").join("response.json");
        let response = ProvisionResponse {
            dut: "dut1".to_string(),
            status: ProvisionStatus::ProvisioningFailed,
            failed_state: Some("CrOS Install Stateful".to_string()),
            error: Some("boom".to_string()),
        };

        save_response(&path, &response).unwrap();

        let read: ProvisionResponse =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(read, response);
    }
}

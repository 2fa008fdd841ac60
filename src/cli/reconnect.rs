use anyhow::Result;
use clap::Args;

use crate::cli::{wait_for, DeviceArgs};

#[derive(Args)]
#[command(about = "Re-resolve the device address and open a new connection")]
pub struct ReconnectCommand {
    #[command(flatten)]
    device: DeviceArgs,
}

impl ReconnectCommand {
    pub async fn execute(self) -> Result<()> {
        let (config, service) = self.device.service()?;

        let op = service.force_reconnect()?;
        let result = wait_for(&service, op, config.reboot_timeout()).await;

        if result.is_ok() {
            if let Some(conn) = service.adapter().current_connection() {
                println!("✓ Connected to {} at {}", config.dut.name, conn.address());
            }
        }
        service.close();
        result.map(|_| ())
    }
}

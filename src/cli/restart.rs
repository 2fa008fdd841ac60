use anyhow::Result;
use clap::Args;

use dut_provision::lro::OperationResponse;

use crate::cli::{wait_for, DeviceArgs};

#[derive(Args)]
#[command(about = "Reboot the device and wait until it is reachable again")]
pub struct RestartCommand {
    #[command(flatten)]
    device: DeviceArgs,

    #[arg(
        value_name = "ARGS",
        trailing_var_arg = true,
        allow_hyphen_values = true,
        help = "Extra arguments passed to reboot"
    )]
    args: Vec<String>,
}

impl RestartCommand {
    pub async fn execute(self) -> Result<()> {
        let (config, service) = self.device.service()?;

        let op = service.restart(self.args)?;
        // The operation is bounded by the reboot timeout; allow for the dial.
        let limit = config.reboot_timeout() + config.reboot_timeout();
        let result = wait_for(&service, op, limit).await;
        service.close();

        let op = result?;
        if let Some(Ok(OperationResponse::Restart { output })) = &op.result {
            if !output.trim().is_empty() {
                println!("{}", output.trim());
            }
        }
        println!("✓ {} restarted", config.dut.name);
        Ok(())
    }
}

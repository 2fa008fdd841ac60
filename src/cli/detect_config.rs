use anyhow::Result;
use clap::Args;

use crate::cli::DeviceArgs;

#[derive(Args)]
#[command(about = "Print the device's platform, model and SKU")]
pub struct DetectConfigCommand {
    #[command(flatten)]
    device: DeviceArgs,
}

impl DetectConfigCommand {
    pub async fn execute(self) -> Result<()> {
        let (_, service) = self.device.service()?;
        let result = service.detect_device_config_id().await;
        service.close();

        let id = result?;
        println!("Platform:      {}", id.platform);
        println!("Model:         {}", id.model);
        match id.sku {
            Some(sku) => println!("SKU:           {}", sku),
            None => println!("SKU:           (none)"),
        }
        println!("Brand:         {}", id.brand);
        println!("Customization: {}", id.customization);
        Ok(())
    }
}

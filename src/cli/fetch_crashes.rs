use anyhow::{Context, Result};
use clap::Args;
use std::fs;
use std::path::PathBuf;

use dut_provision::crash::{CrashPayload, FetchCrashesResponse};
use dut_provision::error::Error;

use crate::cli::DeviceArgs;

#[derive(Args)]
#[command(about = "Pull crash reports off the device")]
pub struct FetchCrashesCommand {
    #[command(flatten)]
    device: DeviceArgs,

    #[arg(long, help = "Include core dumps")]
    core: bool,

    #[arg(short, long, help = "Directory to write crash files into")]
    output_dir: Option<PathBuf>,
}

impl FetchCrashesCommand {
    pub async fn execute(self) -> Result<()> {
        let (_, service) = self.device.service()?;

        if let Some(dir) = &self.output_dir {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        let output_dir = self.output_dir.clone();

        let result = service
            .fetch_crashes(self.core, move |msg| {
                println!("{}", msg.summary());
                match &output_dir {
                    Some(dir) => save(dir, &msg),
                    None => Ok(()),
                }
            })
            .await;
        service.close();

        let count = result?;
        println!("✓ Received {} crash messages", count);
        Ok(())
    }
}

/// Appends blob chunks to `<dir>/<crash id>.<filename>`.
fn save(dir: &std::path::Path, msg: &FetchCrashesResponse) -> Result<(), Error> {
    use std::io::Write;

    let (filename, data) = match &msg.payload {
        Some(CrashPayload::Blob(blob)) => (&blob.filename, &blob.blob),
        Some(CrashPayload::Core(core)) => (&core.filename, &core.blob),
        _ => return Ok(()),
    };
    let name = std::path::Path::new(filename)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "blob".to_string());
    let path = dir.join(format!("{}.{}", msg.crash_id, name));

    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(data)?;
    Ok(())
}

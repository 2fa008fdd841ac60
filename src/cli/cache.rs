use anyhow::{anyhow, Result};
use clap::Args;
use std::time::Duration;

use dut_provision::remote::{CacheDestination, CacheSource};

use crate::cli::{wait_for, DeviceArgs};

/// Downloads through the proxy can be large.
const CACHE_WAIT: Duration = Duration::from_secs(3600);

#[derive(Args)]
#[command(about = "Download an artifact onto the device through the caching proxy")]
pub struct CacheCommand {
    #[command(flatten)]
    device: DeviceArgs,

    #[arg(value_name = "GS_URL", help = "Artifact, e.g. gs://bucket/path/image.bin")]
    source: String,

    #[arg(long, value_name = "MEMBER", help = "Extract a single member of a tarball")]
    extract: Option<String>,

    #[arg(long, conflicts_with = "extract", help = "Decompress the archive")]
    decompress: bool,

    #[arg(long, value_name = "PATH", help = "Write the download to this file on the device")]
    file: Option<String>,

    #[arg(
        long,
        value_name = "COMMANDS",
        conflicts_with = "file",
        help = "Pipe the download into these commands on the device"
    )]
    pipe: Option<String>,
}

impl CacheCommand {
    fn source(&self) -> CacheSource {
        match &self.extract {
            Some(member) => CacheSource::GsTarFile {
                path: self.source.clone(),
                file: member.clone(),
            },
            None if self.decompress => CacheSource::GsZipFile(self.source.clone()),
            None => CacheSource::GsFile(self.source.clone()),
        }
    }

    fn destination(&self) -> Result<CacheDestination> {
        match (&self.file, &self.pipe) {
            (Some(path), None) => Ok(CacheDestination::File(path.clone())),
            (None, Some(commands)) => Ok(CacheDestination::Pipe(commands.clone())),
            _ => Err(anyhow!("Specify exactly one of --file or --pipe")),
        }
    }

    pub async fn execute(self) -> Result<()> {
        let destination = self.destination()?;
        let (_, service) = self.device.service()?;

        let result = match service.cache(self.source(), destination) {
            Ok(op) => wait_for(&service, op, CACHE_WAIT).await,
            Err(e) => Err(e.into()),
        };
        service.close();

        result?;
        println!("✓ Cached {}", self.source);
        Ok(())
    }
}

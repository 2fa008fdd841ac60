use anyhow::{anyhow, Result};
use clap::Args;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use dut_provision::remote::StderrMode;

use crate::cli::DeviceArgs;

#[derive(Args)]
#[command(about = "Run a command on the device")]
pub struct ExecCommand {
    #[command(flatten)]
    device: DeviceArgs,

    #[arg(long, help = "Merge stderr into stdout")]
    combined: bool,

    #[arg(long, help = "File fed to the command's stdin")]
    stdin: Option<PathBuf>,

    #[arg(value_name = "COMMAND", help = "Command to run")]
    command: String,

    #[arg(
        value_name = "ARGS",
        trailing_var_arg = true,
        allow_hyphen_values = true,
        help = "Arguments, joined with spaces"
    )]
    args: Vec<String>,
}

impl ExecCommand {
    pub async fn execute(self) -> Result<()> {
        let (_, service) = self.device.service()?;

        let stdin = match &self.stdin {
            Some(path) => Some(fs::read(path)?),
            None => None,
        };
        let mode = if self.combined {
            StderrMode::Combined
        } else {
            StderrMode::Separate
        };
        let args: Vec<&str> = self.args.iter().map(String::as_str).collect();

        let result = service.exec_command(&self.command, &args, stdin, mode).await;
        service.close();

        std::io::stdout().write_all(&result.stdout)?;
        std::io::stderr().write_all(&result.stderr)?;

        if !result.started {
            return Err(anyhow!("command did not start: {}", result.error_message));
        }
        if result.exit_status != 0 {
            return Err(anyhow!("command exited with status {}", result.exit_status));
        }
        Ok(())
    }
}

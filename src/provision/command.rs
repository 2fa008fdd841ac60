//! Reversible units of provisioning work.
//!
//! A state runs its commands in order through [`run_chain`]. When command k
//! fails, commands 1..k-1 are reverted in reverse order, each exactly once.
//! `revert` takes the command by value, so a reverted command cannot run
//! again.

use log::{debug, warn};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::provision::context::ProvisionContext;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Reads the boot layout; everything after depends on it.
    ProbePartitions,
    WipeStateful,
    InstallPartitions,
    StopSystemDaemons,
    ClearDlcArtifacts,
    InstallStateful,
    InstallDlcs,
    WaitForStabilize,
    RunFirmwareUpdater,
    /// Records the slot the next boot will try, if it changed.
    CheckFirmwareSlot { reboot_target: Option<String> },
    Reboot { timeout: Duration },
    VerifyFirmware { expected_slot: Option<String> },
    PostInstall,
    ClearTpm,
    VerifyActiveRoot,
    VerifyDlcs,
}

impl Command {
    pub fn check_firmware_slot() -> Self {
        Command::CheckFirmwareSlot {
            reboot_target: None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::ProbePartitions => "ProbePartitions",
            Command::WipeStateful => "WipeStateful",
            Command::InstallPartitions => "InstallPartitions",
            Command::StopSystemDaemons => "StopSystemDaemons",
            Command::ClearDlcArtifacts => "ClearDlcArtifacts",
            Command::InstallStateful => "InstallStateful",
            Command::InstallDlcs => "InstallDlcs",
            Command::WaitForStabilize => "WaitForStabilize",
            Command::RunFirmwareUpdater => "RunFirmwareUpdater",
            Command::CheckFirmwareSlot { .. } => "CheckFirmwareSlot",
            Command::Reboot { .. } => "Reboot",
            Command::VerifyFirmware { .. } => "VerifyFirmware",
            Command::PostInstall => "PostInstall",
            Command::ClearTpm => "ClearTpm",
            Command::VerifyActiveRoot => "VerifyActiveRoot",
            Command::VerifyDlcs => "VerifyDlcs",
        }
    }

    pub fn error_message(&self) -> &'static str {
        match self {
            Command::ProbePartitions => "failed to get partition info",
            Command::WipeStateful => "failed to wipe stateful",
            Command::InstallPartitions => "failed to install partitions",
            Command::StopSystemDaemons => "failed to stop system daemons",
            Command::ClearDlcArtifacts => "failed to clear DLC artifacts",
            Command::InstallStateful => "failed to install stateful partition",
            Command::InstallDlcs => "failed to install DLCs",
            Command::WaitForStabilize => "failed to wait for DUT to stabilize",
            Command::RunFirmwareUpdater => "failed to run firmware updater",
            Command::CheckFirmwareSlot { .. } => "failed to check firmware slot",
            Command::Reboot { .. } => "failed to reboot DUT",
            Command::VerifyFirmware { .. } => "failed to verify firmware",
            Command::PostInstall => "failed to run post install",
            Command::ClearTpm => "failed to clear TPM",
            Command::VerifyActiveRoot => "failed to verify active root",
            Command::VerifyDlcs => "failed to verify DLCs",
        }
    }

    /// Slot the device must reboot into after a firmware update.
    pub fn reboot_target(&self) -> Option<&str> {
        match self {
            Command::CheckFirmwareSlot { reboot_target } => reboot_target.as_deref(),
            _ => None,
        }
    }

    pub async fn execute(&mut self, ctx: &mut ProvisionContext) -> Result<()> {
        match self {
            Command::ProbePartitions => ctx.probe_partitions().await.map(|_| ()),
            Command::WipeStateful => ctx.wipe_stateful().await,
            Command::InstallPartitions => ctx.install_partitions().await,
            Command::StopSystemDaemons => ctx.stop_system_daemons().await,
            Command::ClearDlcArtifacts => ctx.clear_dlc_artifacts().await,
            Command::InstallStateful => ctx.install_stateful().await,
            Command::InstallDlcs => {
                let transferred = ctx.install_dlcs().await?;
                debug!("Transferred {} DLC images", transferred);
                Ok(())
            }
            Command::WaitForStabilize => ctx.wait_for_stabilize().await,
            Command::RunFirmwareUpdater => ctx.run_firmware_updater().await,
            Command::CheckFirmwareSlot { reboot_target } => {
                *reboot_target = ctx.check_firmware_slot().await?;
                Ok(())
            }
            Command::Reboot { timeout } => ctx.reboot(*timeout).await,
            Command::VerifyFirmware { expected_slot } => {
                ctx.verify_firmware(expected_slot.as_deref()).await
            }
            Command::PostInstall => ctx.post_install().await,
            Command::ClearTpm => ctx.clear_tpm().await,
            Command::VerifyActiveRoot => ctx.verify_active_root().await,
            Command::VerifyDlcs => ctx.verify_dlcs().await,
        }
    }

    /// Undoes a successful `execute`. Commands without device side effects
    /// worth undoing revert to nothing.
    pub async fn revert(self, ctx: &mut ProvisionContext) -> Result<()> {
        match self {
            Command::WipeStateful => ctx.revert_wipe_stateful().await,
            Command::InstallStateful => ctx.revert_stateful_install().await,
            Command::PostInstall => ctx.revert_post_install().await,
            Command::ClearTpm => ctx.revert_clear_tpm().await,
            _ => Ok(()),
        }
    }
}

/// Runs `commands` in order and returns them once all succeeded.
///
/// On failure the already executed commands are reverted last-in first-out.
/// A failing revert stops the rollback and yields [`Error::Revert`], which
/// is fatal.
pub async fn run_chain(
    state: &str,
    commands: Vec<Command>,
    ctx: &mut ProvisionContext,
) -> Result<Vec<Command>> {
    let mut executed: Vec<Command> = Vec::with_capacity(commands.len());

    for mut command in commands {
        debug!("{}: {}", state, command.name());
        if let Err(err) = command.execute(ctx).await {
            let err = err.context(command.error_message());
            while let Some(done) = executed.pop() {
                warn!("{} REVERT {}", state, done.name());
                if let Err(revert) = done.revert(ctx).await {
                    return Err(Error::Revert {
                        original: Box::new(err),
                        revert: Box::new(revert),
                    });
                }
            }
            return Err(err);
        }
        executed.push(command);
    }

    Ok(executed)
}

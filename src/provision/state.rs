//! States of an OS install.
//!
//! Init → InstallPartitions → InstallStateful → UpdateFirmware → PostInstall
//! → Verify. Each state builds its command list from the request and runs it
//! as one chain; a failure ends the run without consulting `next`.

use log::info;

use crate::error::Result;
use crate::provision::command::{run_chain, Command};
use crate::provision::context::ProvisionContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Init,
    InstallPartitions,
    InstallStateful,
    UpdateFirmware,
    PostInstall,
    Verify,
}

/// How a state ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Skipped(String),
}

impl State {
    pub fn name(&self) -> &'static str {
        match self {
            State::Init => "CrOS Init",
            State::InstallPartitions => "CrOS Install Partitions",
            State::InstallStateful => "CrOS Install Stateful",
            State::UpdateFirmware => "CrOS Update Firmware",
            State::PostInstall => "CrOS Post Install",
            State::Verify => "CrOS Verify",
        }
    }

    /// State to run after this one succeeded. `None` ends the run.
    pub fn next(&self, ctx: &ProvisionContext) -> Option<State> {
        match self {
            State::Init => Some(State::InstallPartitions),
            State::InstallPartitions => Some(State::InstallStateful),
            State::InstallStateful => Some(State::UpdateFirmware),
            State::UpdateFirmware => Some(State::PostInstall),
            // Nothing to verify when the device keeps running the old image.
            State::PostInstall if ctx.request().prevent_reboot => None,
            State::PostInstall => Some(State::Verify),
            State::Verify => None,
        }
    }

    pub async fn execute(&self, ctx: &mut ProvisionContext) -> Result<Outcome> {
        match self {
            State::UpdateFirmware => self.update_firmware(ctx).await,
            _ => {
                let commands = self.commands(ctx);
                run_chain(self.name(), commands, ctx).await?;
                Ok(Outcome::Completed)
            }
        }
    }

    fn commands(&self, ctx: &ProvisionContext) -> Vec<Command> {
        let request = ctx.request();
        match self {
            State::Init => {
                let mut commands = vec![Command::ProbePartitions];
                if !request.preserve_stateful {
                    commands.push(Command::WipeStateful);
                }
                commands
            }
            State::InstallPartitions => vec![Command::InstallPartitions],
            State::InstallStateful => {
                let mut commands = vec![Command::StopSystemDaemons];
                if !request.dlc_ids.is_empty() {
                    commands.push(Command::ClearDlcArtifacts);
                }
                commands.push(Command::InstallStateful);
                if !request.dlc_ids.is_empty() {
                    commands.push(Command::InstallDlcs);
                }
                commands
            }
            State::UpdateFirmware => vec![
                Command::WaitForStabilize,
                Command::RunFirmwareUpdater,
                Command::check_firmware_slot(),
            ],
            State::PostInstall => {
                let mut commands = vec![Command::PostInstall, Command::ClearTpm];
                if !request.prevent_reboot {
                    commands.push(Command::Reboot {
                        timeout: ctx.reboot_timeout(),
                    });
                }
                commands
            }
            State::Verify => {
                let mut commands = vec![Command::VerifyActiveRoot];
                if !request.dlc_ids.is_empty() {
                    commands.push(Command::VerifyDlcs);
                }
                commands
            }
        }
    }

    async fn update_firmware(&self, ctx: &mut ProvisionContext) -> Result<Outcome> {
        if !ctx.request().update_firmware {
            return Ok(Outcome::Skipped("by request".to_string()));
        }
        // Some builds ship without an updater.
        if !ctx.firmware_updater_exists().await? {
            return Ok(Outcome::Skipped(
                "firmware updater does not exist on the build".to_string(),
            ));
        }

        let commands = self.commands(ctx);
        let executed = run_chain(self.name(), commands, ctx).await?;
        let target = executed
            .iter()
            .find_map(|c| c.reboot_target())
            .map(str::to_string);

        if target.is_some() {
            let mut reboot = Command::Reboot {
                timeout: ctx.firmware_reboot_timeout(),
            };
            reboot
                .execute(ctx)
                .await
                .map_err(|e| e.context(reboot.error_message()))?;
        } else {
            info!("no firmware slot change detected, skip post firmware update reboot.");
        }

        let mut verify = Command::VerifyFirmware {
            expected_slot: target,
        };
        verify
            .execute(ctx)
            .await
            .map_err(|e| e.context(verify.error_message()))?;

        Ok(Outcome::Completed)
    }
}

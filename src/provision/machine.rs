//! Drives a provisioning run from the first state to the last.
//!
//! [`provision`] maps the outcome of a run onto a [`ProvisionResponse`]
//! status; failures in the firmware state are reported separately from the
//! rest.

use log::{error, info};
use std::sync::Arc;

use crate::config::Config;
use crate::error::Error;
use crate::provision::context::ProvisionContext;
use crate::provision::request::{ProvisionRequest, ProvisionResponse, ProvisionStatus};
use crate::provision::state::{Outcome, State};
use crate::remote::DutAdapter;

/// A run that stopped in `state`.
#[derive(Debug)]
pub struct RunFailure {
    pub state: State,
    pub error: Error,
}

impl std::fmt::Display for RunFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.state.name(), self.error)
    }
}

/// Runs states starting at `first` until one has no successor.
///
/// Returns the states that completed or were skipped, in order.
pub async fn execute_state_machine(
    first: State,
    ctx: &mut ProvisionContext,
) -> Result<Vec<State>, RunFailure> {
    let mut ran = Vec::new();
    let mut current = Some(first);

    while let Some(state) = current {
        info!("State: Execute {}", state.name());
        match state.execute(ctx).await {
            Ok(Outcome::Completed) => info!("State: {} Completed", state.name()),
            Ok(Outcome::Skipped(reason)) => {
                info!("State: Skip {} {}", state.name(), reason)
            }
            Err(error) => {
                let error = error.context(state.name());
                error!("State: {} Failed, {}", state.name(), error);
                return Err(RunFailure { state, error });
            }
        }
        ran.push(state);
        current = state.next(ctx);
    }

    Ok(ran)
}

/// Status reported for a run that stopped in `state`.
pub fn failure_status(state: State) -> ProvisionStatus {
    match state {
        State::UpdateFirmware => ProvisionStatus::FirmwareUpdateFailed,
        _ => ProvisionStatus::ProvisioningFailed,
    }
}

/// Validates `request`, runs the full OS install and reports the outcome.
///
/// A request rejected before anything reached the device is `RpcFailed`.
pub async fn provision(ctx: &mut ProvisionContext) -> ProvisionResponse {
    let dut = ctx.adapter().dut().to_string();

    if let Err(e) = ctx.request().validate() {
        error!("Rejecting provision request: {}", e);
        return ProvisionResponse {
            dut,
            status: ProvisionStatus::RpcFailed,
            failed_state: None,
            error: Some(e.to_string()),
        };
    }

    match execute_state_machine(State::Init, ctx).await {
        Ok(_) => {
            info!("Provisioned {} from {}", dut, ctx.request().image_path);
            ProvisionResponse::success(dut)
        }
        Err(failure) => ProvisionResponse {
            dut,
            status: failure_status(failure.state),
            failed_state: Some(failure.state.name().to_string()),
            error: Some(failure.error.to_string()),
        },
    }
}

/// Builds a context with the timeouts from `config`.
pub fn context_from_config(
    config: &Config,
    adapter: Arc<DutAdapter>,
    request: ProvisionRequest,
) -> ProvisionContext {
    ProvisionContext::new(adapter, request)
        .with_reboot_timeout(config.reboot_timeout())
        .with_firmware_reboot_timeout(config.firmware_reboot_timeout())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_status_by_state() {
        assert_eq!(
            failure_status(State::UpdateFirmware),
            ProvisionStatus::FirmwareUpdateFailed
        );
        for state in [
            State::Init,
            State::InstallPartitions,
            State::InstallStateful,
            State::PostInstall,
            State::Verify,
        ] {
            assert_eq!(failure_status(state), ProvisionStatus::ProvisioningFailed);
        }
    }
}

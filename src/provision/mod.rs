//! OS provisioning as a chain of reversible commands.

pub mod command;
pub mod context;
pub mod machine;
pub mod partition;
pub mod request;
pub mod state;

pub use command::{run_chain, Command};
pub use context::ProvisionContext;
pub use machine::{context_from_config, execute_state_machine, provision, RunFailure};
pub use partition::{DlcSlot, PartitionInfo};
pub use request::{ProvisionRequest, ProvisionResponse, ProvisionStatus};
pub use state::{Outcome, State};

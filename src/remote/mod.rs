//! Remote execution against the device under test.
//!
//! This module provides the SSH transport, the per-command session
//! abstraction, the caching proxy URL mapping and [`DutAdapter`], which ties
//! them together and owns reconnection after reboots.

pub mod adapter;
pub mod cache;
pub mod connection;
pub mod retry;
pub mod session;
pub mod ssh;

pub use adapter::DutAdapter;
pub use cache::{CacheDestination, CacheSource};
pub use connection::{AddressResolver, Connection, Dialer, DirectAddress, HostTable};
pub use retry::RetryConfig;
pub use session::{ExecResult, RemoteSession, RunningCommand, SessionOutput, StderrMode};

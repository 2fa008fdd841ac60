//! Connection handles and how they are obtained.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::remote::session::RemoteSession;

/// An open secure-shell handle to one device.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Address the connection was dialed with.
    fn address(&self) -> &str;

    /// Opens a fresh session. Blocking; call from a blocking context.
    fn new_session(&self) -> Result<Box<dyn RemoteSession>>;

    /// Resolves once the connection is observed to be closed, either by the
    /// device going away or by [`Connection::close`].
    async fn wait(&self) -> Result<()>;

    fn close(&self);
}

/// Establishes connections. Blocking; call from a blocking context.
pub trait Dialer: Send + Sync {
    fn dial(&self, address: &str) -> Result<Arc<dyn Connection>>;
}

/// Maps a device identifier to a dialable address.
pub trait AddressResolver: Send + Sync {
    fn resolve(&self, dut: &str) -> Result<String>;
}

/// Uses the device identifier as the address.
#[derive(Debug, Clone, Default)]
pub struct DirectAddress;

impl AddressResolver for DirectAddress {
    fn resolve(&self, dut: &str) -> Result<String> {
        Ok(dut.to_string())
    }
}

/// Looks device names up in a static table.
#[derive(Debug, Clone, Default)]
pub struct HostTable {
    hosts: HashMap<String, String>,
}

impl HostTable {
    pub fn new(hosts: HashMap<String, String>) -> Self {
        Self { hosts }
    }
}

impl AddressResolver for HostTable {
    fn resolve(&self, dut: &str) -> Result<String> {
        self.hosts
            .get(dut)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("address for device {}", dut)))
    }
}

/// Picks the resolver matching the configuration: a lookup table when one is
/// configured, the identifier itself otherwise.
pub fn resolver_for(hosts: &HashMap<String, String>) -> Arc<dyn AddressResolver> {
    if hosts.is_empty() {
        Arc::new(DirectAddress)
    } else {
        Arc::new(HostTable::new(hosts.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_address() {
        assert_eq!(DirectAddress.resolve("10.0.0.2:22").unwrap(), "10.0.0.2:22");
    }

    #[test]
    fn test_host_table_lookup() {
        let mut hosts = HashMap::new();
        hosts.insert("dut1".to_string(), "10.0.0.2:22".to_string());
        let resolver = resolver_for(&hosts);

        assert_eq!(resolver.resolve("dut1").unwrap(), "10.0.0.2:22");
        assert!(matches!(resolver.resolve("dut2"), Err(Error::NotFound(_))));
    }
}

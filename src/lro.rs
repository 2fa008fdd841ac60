//! Long running operations.
//!
//! Entry points that can outlive a caller's deadline (restart, cache fetch,
//! reconnect) register an [`Operation`] and return its name right away. The
//! work reports back through [`OperationManager::set_result`] and callers
//! poll with [`OperationManager::get_operation`] or block on
//! [`OperationManager::wait_operation`].
//!
//! The manager is an ordinary value owned by the service that uses it: it is
//! created at startup and [`closed`](OperationManager::close) at shutdown.

use log::{debug, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{Error, ErrorKind, ProvisionError, Result};

/// Successful payload of a finished operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationResponse {
    Restart { output: String },
    Cache,
    ForceReconnect,
}

/// Structured failure of a finished operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&ProvisionError> for OperationError {
    fn from(err: &ProvisionError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

pub type OperationResult = std::result::Result<OperationResponse, OperationError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub name: String,
    pub done: bool,
    pub result: Option<OperationResult>,
}

struct Registry {
    operations: HashMap<String, Operation>,
    closed: bool,
}

pub struct OperationManager {
    registry: Mutex<Registry>,
    notify: Notify,
}

impl OperationManager {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry {
                operations: HashMap::new(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a new pending operation with a unique name.
    pub fn new_operation(&self) -> Result<Operation> {
        let mut registry = self.registry();
        if registry.closed {
            return Err(Error::Operation("operation manager is closed".to_string()));
        }

        let name = loop {
            let candidate = format!("operations/{}", Uuid::new_v4());
            if !registry.operations.contains_key(&candidate) {
                break candidate;
            }
        };

        let op = Operation {
            name: name.clone(),
            done: false,
            result: None,
        };
        registry.operations.insert(name.clone(), op.clone());
        debug!("Registered {}", name);
        Ok(op)
    }

    /// Completes an operation. Results are write-once: completing an
    /// operation a second time is an error and leaves the first result.
    pub fn set_result(&self, name: &str, result: OperationResult) -> Result<()> {
        {
            let mut registry = self.registry();
            let op = registry
                .operations
                .get_mut(name)
                .ok_or_else(|| Error::NotFound(format!("operation {}", name)))?;

            if op.done {
                warn!("Ignoring second result for {}", name);
                return Err(Error::Operation(format!("{} already has a result", name)));
            }
            op.done = true;
            op.result = Some(result);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    pub fn get_operation(&self, name: &str) -> Result<Operation> {
        self.registry()
            .operations
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("operation {}", name)))
    }

    /// Waits until the operation is done or `timeout` elapses, returning its
    /// latest state either way.
    pub async fn wait_operation(&self, name: &str, timeout: Duration) -> Result<Operation> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            let op = self.get_operation(name)?;
            if op.done {
                return Ok(op);
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => return self.get_operation(name),
            }
        }
    }

    pub fn len(&self) -> usize {
        self.registry().operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Releases every tracked operation. Later registrations fail.
    pub fn close(&self) {
        {
            let mut registry = self.registry();
            let pending = registry.operations.values().filter(|op| !op.done).count();
            if pending > 0 {
                warn!("Closing operation manager with {} pending operations", pending);
            }
            registry.operations.clear();
            registry.closed = true;
        }
        self.notify.notify_waiters();
    }
}

impl Default for OperationManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_names_are_unique() {
        let manager = OperationManager::new();
        let a = manager.new_operation().unwrap();
        let b = manager.new_operation().unwrap();
        assert_ne!(a.name, b.name);
        assert!(a.name.starts_with("operations/"));
        assert!(!a.done);
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn test_set_result_is_write_once() {
        let manager = OperationManager::new();
        let op = manager.new_operation().unwrap();

        manager
            .set_result(&op.name, Ok(OperationResponse::Restart { output: "bye".to_string() }))
            .unwrap();
        let err = manager
            .set_result(&op.name, Ok(OperationResponse::Cache))
            .unwrap_err();
        assert!(matches!(err, Error::Operation(_)));

        let stored = manager.get_operation(&op.name).unwrap();
        assert!(stored.done);
        assert_eq!(
            stored.result,
            Some(Ok(OperationResponse::Restart { output: "bye".to_string() }))
        );
    }

    #[test]
    fn test_error_results_keep_kind() {
        let manager = OperationManager::new();
        let op = manager.new_operation().unwrap();
        let err = Error::RebootTimeout(Duration::from_secs(5));
        manager.set_result(&op.name, Err((&err).into())).unwrap();

        let stored = manager.get_operation(&op.name).unwrap();
        match stored.result {
            Some(Err(e)) => assert_eq!(e.kind, ErrorKind::Fatal),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_unknown_operation() {
        let manager = OperationManager::new();
        assert!(matches!(manager.get_operation("operations/nope"), Err(Error::NotFound(_))));
        assert!(manager.set_result("operations/nope", Ok(OperationResponse::Cache)).is_err());
    }

    #[test]
    fn test_close_releases_everything() {
        let manager = OperationManager::new();
        let op = manager.new_operation().unwrap();
        manager.close();
        assert!(manager.is_empty());
        assert!(manager.get_operation(&op.name).is_err());
        assert!(manager.new_operation().is_err());
    }

    #[tokio::test]
    async fn test_concurrent_set_and_get() {
        let manager = Arc::new(OperationManager::new());
        let names: Vec<String> = (0..16)
            .map(|_| manager.new_operation().unwrap().name)
            .collect();

        let mut handles = Vec::new();
        for name in names.clone() {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                manager.set_result(&name, Ok(OperationResponse::ForceReconnect))
            }));
        }
        for name in names.clone() {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                manager.get_operation(&name).map(|_| ())
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        for name in names {
            assert!(manager.get_operation(&name).unwrap().done);
        }
    }

    #[tokio::test]
    async fn test_wait_operation_wakes_on_result() {
        let manager = Arc::new(OperationManager::new());
        let op = manager.new_operation().unwrap();

        let setter = {
            let manager = Arc::clone(&manager);
            let name = op.name.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                manager.set_result(&name, Ok(OperationResponse::Cache))
            })
        };

        let done = manager
            .wait_operation(&op.name, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(done.done);
        setter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_wait_operation_times_out_with_pending_state() {
        let manager = OperationManager::new();
        let op = manager.new_operation().unwrap();
        let pending = manager
            .wait_operation(&op.name, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(!pending.done);
    }
}

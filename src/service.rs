//! Request-level operations against one device.
//!
//! [`DutService`] owns the adapter and the operation registry. Entry points
//! that may take longer than a caller is willing to block (restart, cache,
//! reconnect) run on a background task and hand back an [`Operation`]
//! immediately. Closing the service aborts those tasks before the
//! connection is released.

use log::{debug, error, info};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::crash::{self, FetchCrashesResponse};
use crate::error::{Error, Result};
use crate::lro::{Operation, OperationManager, OperationResponse, OperationResult};
use crate::remote::cache::download_command;
use crate::remote::session::join_command;
use crate::remote::{CacheDestination, CacheSource, DutAdapter, ExecResult, StderrMode};

/// Identity reported by `crosid`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceConfigId {
    pub platform: String,
    pub model: String,
    pub sku: Option<u32>,
    pub brand: String,
    pub customization: String,
}

pub struct DutService {
    adapter: Arc<DutAdapter>,
    operations: Arc<OperationManager>,
    serializer_path: String,
    proto_chunk_size: u64,
    reboot_timeout: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DutService {
    pub fn new(adapter: Arc<DutAdapter>, config: &Config) -> Self {
        Self {
            adapter,
            operations: Arc::new(OperationManager::new()),
            serializer_path: config.serializer_path.clone(),
            proto_chunk_size: config.proto_chunk_size,
            reboot_timeout: config.reboot_timeout(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(Arc::new(DutAdapter::from_config(config)), config)
    }

    pub fn adapter(&self) -> &Arc<DutAdapter> {
        &self.adapter
    }

    /// Runs a command and reports its raw outcome. Never fails.
    pub async fn exec_command(
        &self,
        command: &str,
        args: &[&str],
        stdin: Option<Vec<u8>>,
        stderr: StderrMode,
    ) -> ExecResult {
        let cmd = join_command(command, args);
        self.adapter.exec(&cmd, stdin, stderr).await
    }

    /// Streams crash reports off the device to `on_message`.
    pub async fn fetch_crashes<F>(&self, fetch_core: bool, on_message: F) -> Result<usize>
    where
        F: FnMut(FetchCrashesResponse) -> Result<()> + Send + 'static,
    {
        crash::fetch_crashes(
            &self.adapter,
            &self.serializer_path,
            self.proto_chunk_size,
            fetch_core,
            on_message,
        )
        .await
    }

    /// Starts a reboot in the background.
    pub fn restart(&self, args: Vec<String>) -> Result<Operation> {
        let adapter = Arc::clone(&self.adapter);
        let timeout = self.reboot_timeout;
        self.spawn_operation("restart", async move {
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            let output = adapter.restart(&args, timeout).await?;
            Ok(OperationResponse::Restart { output })
        })
    }

    /// Starts downloading `source` through the caching proxy onto the device.
    ///
    /// A malformed source is rejected before any operation is registered.
    pub fn cache(&self, source: CacheSource, destination: CacheDestination) -> Result<Operation> {
        let url = self.adapter.copy_data(&source)?;
        let adapter = Arc::clone(&self.adapter);
        self.spawn_operation("cache", async move {
            let command = download_command(&url, &destination);
            adapter.run_cmd(&command, &[]).await?;
            Ok(OperationResponse::Cache)
        })
    }

    /// Starts replacing the current connection in the background.
    pub fn force_reconnect(&self) -> Result<Operation> {
        let adapter = Arc::clone(&self.adapter);
        self.spawn_operation("force_reconnect", async move {
            adapter.force_reconnect().await?;
            Ok(OperationResponse::ForceReconnect)
        })
    }

    fn spawn_operation<F>(&self, label: &'static str, work: F) -> Result<Operation>
    where
        F: std::future::Future<Output = Result<OperationResponse>> + Send + 'static,
    {
        let op = self.operations.new_operation()?;
        let name = op.name.clone();
        let operations = Arc::clone(&self.operations);

        let handle = tokio::spawn(async move {
            let result: OperationResult = match work.await {
                Ok(response) => {
                    info!("{} {} done", label, name);
                    Ok(response)
                }
                Err(e) => {
                    error!("{} {} failed: {}", label, name, e);
                    Err((&e).into())
                }
            };
            if let Err(e) = operations.set_result(&name, result) {
                error!("Could not record result of {}: {}", name, e);
            }
        });

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);

        Ok(op)
    }

    pub fn get_operation(&self, name: &str) -> Result<Operation> {
        self.operations.get_operation(name)
    }

    pub async fn wait_operation(&self, name: &str, timeout: Duration) -> Result<Operation> {
        self.operations.wait_operation(name, timeout).await
    }

    /// Reads the device's config identity with `crosid`.
    pub async fn detect_device_config_id(&self) -> Result<DeviceConfigId> {
        let output = self.adapter.run_cmd("crosid", &[]).await?;
        parse_crosid(&output)
    }

    /// Aborts background operations, then releases them and the connection.
    pub fn close(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            if !task.is_finished() {
                debug!("Aborting background operation");
                task.abort();
            }
        }
        self.operations.close();
        self.adapter.close();
    }
}

/// Parses `KEY='value'` lines as printed by `crosid`.
pub fn parse_crosid(output: &str) -> Result<DeviceConfigId> {
    let values: HashMap<&str, &str> = output
        .lines()
        .filter_map(|line| line.trim().split_once('='))
        .map(|(key, value)| (key.trim(), value.trim().trim_matches('\'')))
        .collect();

    let model = values.get("MODEL").copied().unwrap_or_default();
    if model.is_empty() {
        return Err(Error::Validation(format!(
            "crosid did not report a model: {:?}",
            output.trim()
        )));
    }

    let sku = match values.get("SKU").copied().filter(|v| !v.is_empty()) {
        Some(raw) => Some(
            raw.parse::<u32>()
                .map_err(|e| Error::Validation(format!("invalid SKU {:?}: {}", raw, e)))?,
        ),
        None => None,
    };

    let field = |key: &str| values.get(key).copied().unwrap_or_default().to_string();
    Ok(DeviceConfigId {
        platform: field("PLATFORM_NAME"),
        model: model.to_string(),
        sku,
        brand: field("BRAND_CODE"),
        customization: field("CUSTOMIZATION_ID"),
    })
}

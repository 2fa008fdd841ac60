//! High-level remote execution against the device.
//!
//! [`DutAdapter`] owns the current [`Connection`] and turns intents (run a
//! command, check a path, stream a helper's output, reboot) into sessions.
//!
//! The current connection is a single-writer / multi-reader slot: commands
//! clone the handle under a read lock and run without holding it, so a
//! reconnect only affects sessions opened after the swap. Reconnects are
//! serialized and the old handle stays in place until a new connection has
//! actually been established.
//!
//! [`DutAdapter::close`] is final: dials still in flight when it is called
//! close their result instead of installing it.

use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::remote::cache::{cache_url, CacheSource};
use crate::remote::connection::{resolver_for, AddressResolver, Connection, Dialer};
use crate::remote::session::{join_command, ExecResult, RunningCommand, StderrMode};
use crate::remote::ssh::SshDialer;

pub struct DutAdapter {
    dut: String,
    resolver: Arc<dyn AddressResolver>,
    dialer: Arc<dyn Dialer>,
    cache_address: String,
    connection: RwLock<Option<Arc<dyn Connection>>>,
    reconnect: Mutex<()>,
    closed: AtomicBool,
}

impl DutAdapter {
    pub fn new(
        dut: impl Into<String>,
        resolver: Arc<dyn AddressResolver>,
        dialer: Arc<dyn Dialer>,
        cache_address: impl Into<String>,
    ) -> Self {
        Self {
            dut: dut.into(),
            resolver,
            dialer,
            cache_address: cache_address.into(),
            connection: RwLock::new(None),
            reconnect: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Builds an SSH backed adapter. Nothing is dialed until first use.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.dut.name.clone(),
            resolver_for(&config.hosts),
            Arc::new(SshDialer::new(config.dut.clone(), config.dial_retry.clone())),
            config.cache_address.clone(),
        )
    }

    pub fn dut(&self) -> &str {
        &self.dut
    }

    /// The connection new sessions would be opened on, if any.
    pub fn current_connection(&self) -> Option<Arc<dyn Connection>> {
        self.connection
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn closed_error(&self) -> Error {
        Error::Transport(format!("adapter for {} is closed", self.dut))
    }

    /// Installs `connection` as the current one.
    ///
    /// After [`close`](Self::close) the connection is closed instead.
    fn swap(&self, connection: Arc<dyn Connection>) -> Result<Option<Arc<dyn Connection>>> {
        let mut slot = self.connection.write().unwrap_or_else(|e| e.into_inner());
        // Checked under the write lock so close() cannot slip in between.
        if self.is_closed() {
            drop(slot);
            debug!("Discarding connection to {}, adapter closed", connection.address());
            connection.close();
            return Err(self.closed_error());
        }
        Ok(slot.replace(connection))
    }

    async fn dial(&self) -> Result<Arc<dyn Connection>> {
        let resolver = Arc::clone(&self.resolver);
        let dialer = Arc::clone(&self.dialer);
        let dut = self.dut.clone();

        tokio::task::spawn_blocking(move || {
            let address = resolver.resolve(&dut)?;
            dialer.dial(&address)
        })
        .await
        .map_err(|e| Error::Transport(format!("dial task failed: {}", e)))?
    }

    /// Returns the current connection, dialing on first use.
    async fn connection(&self) -> Result<Arc<dyn Connection>> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        if let Some(conn) = self.current_connection() {
            return Ok(conn);
        }

        let _guard = self.reconnect.lock().await;
        if let Some(conn) = self.current_connection() {
            return Ok(conn);
        }

        let conn = self.dial().await?;
        self.swap(Arc::clone(&conn))?;
        Ok(conn)
    }

    /// Runs `command` and reports everything about how it went.
    ///
    /// Never fails: a command that could not reach the device is reported with
    /// `started == false`.
    pub async fn exec(
        &self,
        command: &str,
        stdin: Option<Vec<u8>>,
        stderr: StderrMode,
    ) -> ExecResult {
        let conn = match self.connection().await {
            Ok(conn) => conn,
            Err(e) => return ExecResult::failed_to_start(&e),
        };

        let owned = command.to_string();
        let outcome = tokio::task::spawn_blocking(move || {
            let session = conn.new_session()?;
            session.run(&owned, stdin.as_deref(), stderr)
        })
        .await;

        match outcome {
            Ok(Ok(output)) => ExecResult::from_output(output),
            Ok(Err(e)) => {
                debug!("Command `{}` did not start: {}", command, e);
                ExecResult::failed_to_start(&e)
            }
            Err(e) => ExecResult::failed_to_start(&Error::Transport(format!(
                "session task failed: {}",
                e
            ))),
        }
    }

    /// Runs `command args...` and returns stdout, failing on non-zero exit.
    pub async fn run_cmd(&self, command: &str, args: &[&str]) -> Result<String> {
        let cmd = join_command(command, args);
        self.exec(&cmd, None, StderrMode::Separate)
            .await
            .into_stdout(&cmd)
    }

    pub async fn run_cmd_with_stdin(
        &self,
        command: &str,
        args: &[&str],
        stdin: Vec<u8>,
    ) -> Result<String> {
        let cmd = join_command(command, args);
        self.exec(&cmd, Some(stdin), StderrMode::Separate)
            .await
            .into_stdout(&cmd)
    }

    /// Like [`run_cmd`](Self::run_cmd) with stderr merged into the output.
    pub async fn run_cmd_combined_output(&self, command: &str, args: &[&str]) -> Result<String> {
        let cmd = join_command(command, args);
        self.exec(&cmd, None, StderrMode::Combined)
            .await
            .into_stdout(&cmd)
    }

    /// Starts `command` and hands its streams to `consume` on a blocking
    /// thread. The session is closed when `consume` returns.
    pub async fn stream_cmd<T, F>(&self, command: &str, consume: F) -> Result<T>
    where
        F: FnOnce(RunningCommand) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.connection().await?;
        let owned = command.to_string();

        tokio::task::spawn_blocking(move || {
            let session = conn.new_session()?;
            let running = session.start(&owned)?;
            consume(running)
        })
        .await
        .map_err(|e| Error::Transport(format!("stream task failed: {}", e)))?
    }

    /// Checks whether `path` exists on the device.
    pub async fn path_exists(&self, path: &str) -> Result<bool> {
        let output = self.run_cmd(&path_exists_command(path), &[]).await?;
        Ok(output.trim() == "1")
    }

    /// Resolves `source` to a URL on the caching proxy.
    pub fn copy_data(&self, source: &CacheSource) -> Result<String> {
        cache_url(&self.cache_address, source)
    }

    /// Re-resolves the device address and replaces the current connection.
    ///
    /// The previous connection is left to the sessions still using it.
    pub async fn force_reconnect(&self) -> Result<()> {
        let _guard = self.reconnect.lock().await;
        let conn = self.dial().await?;
        let address = conn.address().to_string();
        self.swap(conn)?;
        info!("Reconnected to {} at {}", self.dut, address);
        Ok(())
    }

    /// Resolves when the current connection reports closure.
    pub async fn wait(&self) -> Result<()> {
        self.connection().await?.wait().await
    }

    /// Reboots the device and reconnects once it went down.
    ///
    /// Success is only reported after the old connection was observed to drop
    /// and a new one was established, both within `timeout`. On timeout the
    /// old connection handle is left in place.
    pub async fn restart(&self, args: &[&str], timeout: Duration) -> Result<String> {
        let deadline = Instant::now() + timeout;
        let old = self.connection().await?;

        let output = self.run_cmd("reboot", args).await?;
        info!("Reboot issued on {}, waiting for the connection to drop", self.dut);

        // Prefer the close signal when both branches are ready.
        let dropped = tokio::select! {
            biased;
            closed = old.wait() => {
                closed?;
                true
            }
            _ = tokio::time::sleep_until(deadline) => false,
        };
        if !dropped {
            warn!("{} did not go down within {:?}", self.dut, timeout);
            return Err(Error::RebootTimeout(timeout));
        }

        let _guard = self.reconnect.lock().await;
        let conn = match tokio::time::timeout_at(deadline, self.dial()).await {
            Ok(conn) => conn?,
            Err(_) => {
                warn!("{} did not come back within {:?}", self.dut, timeout);
                return Err(Error::RebootTimeout(timeout));
            }
        };
        self.swap(conn)?;
        info!("Reconnected to {} after reboot", self.dut);

        Ok(output)
    }

    /// Closes the current connection and refuses any further use.
    pub fn close(&self) {
        let current = {
            let mut slot = self.connection.write().unwrap_or_else(|e| e.into_inner());
            self.closed.store(true, Ordering::SeqCst);
            slot.take()
        };
        if let Some(conn) = current {
            conn.close();
        }
    }
}

/// Device-side test printing `1` when `path` exists and `0` otherwise.
pub fn path_exists_command(path: &str) -> String {
    format!("[ -e {} ] && echo -n 1 || echo -n 0", path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_exists_command() {
        assert_eq!(
            path_exists_command("/usr/local/sbin/crash_serializer"),
            "[ -e /usr/local/sbin/crash_serializer ] && echo -n 1 || echo -n 0"
        );
    }
}

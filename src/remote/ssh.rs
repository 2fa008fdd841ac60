//! SSH transport backed by libssh2.
//!
//! [`SshDialer`] establishes authenticated sessions to the device and wraps
//! them in an [`SshConnection`]. Every command opens its own channel through
//! an [`SshSession`].
//!
//! Once authenticated the session runs in non-blocking mode. libssh2 holds
//! the session lock for the whole of a blocking call, so a channel waiting
//! for output would stall every other channel on the same connection.
//! Instead each call returns `EAGAIN` and is retried after
//! [`POLL_INTERVAL`], releasing the lock in between.

use async_trait::async_trait;
use log::{debug, info, warn};
use ssh2::{ExtendedData, Session};
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::DutConfig;
use crate::error::{Error, Result};
use crate::remote::connection::{Connection, Dialer};
use crate::remote::retry::{diagnose_ssh_error, retry_with_backoff, RetryConfig};
use crate::remote::session::{RemoteSession, RunningCommand, SessionOutput, StderrMode};

/// How often an idle connection is probed while waiting for it to drop.
const KEEPALIVE_POLL: Duration = Duration::from_secs(1);

/// Interval of libssh2's own keepalive messages, in seconds.
const KEEPALIVE_INTERVAL: u32 = 5;

/// Pause between attempts of a call that would block.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

const LIBSSH2_ERROR_EAGAIN: i32 = -37;

fn would_block(e: &ssh2::Error) -> bool {
    matches!(e.code(), ssh2::ErrorCode::Session(code) if code == LIBSSH2_ERROR_EAGAIN)
}

/// Retries `op` until the non-blocking session lets it complete.
fn nonblocking<T>(
    mut op: impl FnMut() -> std::result::Result<T, ssh2::Error>,
) -> std::result::Result<T, ssh2::Error> {
    loop {
        match op() {
            Err(e) if would_block(&e) => std::thread::sleep(POLL_INTERVAL),
            result => return result,
        }
    }
}

/// Blocking [`Read`] over a stream of a non-blocking channel.
///
/// The session lock is only held for each attempt, so other channels make
/// progress while this one waits for data.
struct PollingStream<R> {
    inner: R,
}

impl<R: Read> Read for PollingStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.inner.read(buf) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(POLL_INTERVAL)
                }
                result => return result,
            }
        }
    }
}

/// Dials the device over SSH.
pub struct SshDialer {
    dut: DutConfig,
    retry_config: RetryConfig,
}

impl SshDialer {
    pub fn new(dut: DutConfig, retry_config: RetryConfig) -> Self {
        Self { dut, retry_config }
    }

    fn connect_once(&self, address: &str) -> Result<Session> {
        debug!("Attempting SSH connection to {}", address);

        let addr = address
            .to_socket_addrs()
            .map_err(|e| Error::Transport(format!("failed to resolve '{}': {}", address, e)))?
            .next()
            .ok_or_else(|| Error::Transport(format!("no addresses found for '{}'", address)))?;

        let timeout = Duration::from_secs(self.dut.timeout);
        let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("failed to connect to {}: {}", address, e),
            ))
        })?;

        let mut sess = Session::new()?;
        sess.set_tcp_stream(tcp);
        sess.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);
        sess.handshake()
            .map_err(|e| Error::Transport(format!("SSH handshake failed: {}", e)))?;

        self.authenticate(&mut sess)?;

        // Image writes and firmware updates run far longer than any sane
        // connect timeout.
        sess.set_timeout(0);
        sess.set_keepalive(true, KEEPALIVE_INTERVAL);
        sess.set_blocking(false);

        debug!("SSH connection attempt successful");
        Ok(sess)
    }

    fn authenticate(&self, sess: &mut Session) -> Result<()> {
        debug!("Authenticating as user: {}", self.dut.user);

        if let Some(key_path) = self.dut.expanded_ssh_key() {
            debug!("Attempting public key authentication with: {:?}", key_path);

            match sess.userauth_pubkey_file(&self.dut.user, None, &key_path, None) {
                Ok(_) => {
                    debug!("Public key authentication successful");
                    return Ok(());
                }
                Err(e) => warn!("Public key authentication failed: {}", e),
            }
        }

        debug!("Attempting agent authentication");
        match sess.userauth_agent(&self.dut.user) {
            Ok(_) => {
                debug!("Agent authentication successful");
                return Ok(());
            }
            Err(e) => warn!("Agent authentication failed: {}", e),
        }

        Err(Error::Transport(format!(
            "SSH authentication failed for user {}. Tried: {}, agent",
            self.dut.user,
            self.dut.ssh_key.as_deref().unwrap_or("no key specified")
        )))
    }
}

impl Dialer for SshDialer {
    fn dial(&self, address: &str) -> Result<Arc<dyn Connection>> {
        let address = with_default_port(address, self.dut.port);
        info!("Connecting to {}", address);

        let session = retry_with_backoff(
            &self.retry_config,
            || self.connect_once(&address),
            &format!("SSH connection to {}", address),
        )
        .map_err(|e| {
            Error::Transport(diagnose_ssh_error(
                &e,
                &address,
                self.dut.ssh_key.as_deref(),
            ))
        })?;

        Ok(Arc::new(SshConnection {
            address,
            session,
            closed: AtomicBool::new(false),
        }))
    }
}

/// Appends `port` unless the address already names one.
fn with_default_port(address: &str, port: u16) -> String {
    match address.rsplit_once(':') {
        Some((_, p)) if p.parse::<u16>().is_ok() => address.to_string(),
        _ => format!("{}:{}", address, port),
    }
}

/// An authenticated SSH session to the device.
pub struct SshConnection {
    address: String,
    session: Session,
    closed: AtomicBool,
}

#[async_trait]
impl Connection for SshConnection {
    fn address(&self) -> &str {
        &self.address
    }

    fn new_session(&self) -> Result<Box<dyn RemoteSession>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Transport(format!(
                "connection to {} is closed",
                self.address
            )));
        }
        Ok(Box::new(SshSession {
            session: self.session.clone(),
        }))
    }

    async fn wait(&self) -> Result<()> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(());
            }

            let session = self.session.clone();
            let alive = tokio::task::spawn_blocking(move || nonblocking(|| session.keepalive_send()))
                .await
                .map_err(|e| Error::Transport(format!("keepalive task failed: {}", e)))?;
            if let Err(e) = alive {
                debug!("Connection to {} dropped: {}", self.address, e);
                return Ok(());
            }

            tokio::time::sleep(KEEPALIVE_POLL).await;
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Closing connection to {}", self.address);
        if let Err(e) = nonblocking(|| self.session.disconnect(None, "closing", None)) {
            debug!("Disconnect from {} failed: {}", self.address, e);
        }
    }
}

/// One channel on an [`SshConnection`].
pub struct SshSession {
    session: Session,
}

impl RemoteSession for SshSession {
    fn run(
        self: Box<Self>,
        command: &str,
        stdin: Option<&[u8]>,
        stderr_mode: StderrMode,
    ) -> Result<SessionOutput> {
        debug!("Executing remote command: {}", command);

        let mut channel = nonblocking(|| self.session.channel_session())?;
        if stderr_mode == StderrMode::Combined {
            nonblocking(|| channel.handle_extended_data(ExtendedData::Merge))?;
        }
        nonblocking(|| channel.exec(command))?;

        let input = stdin.unwrap_or_default();
        let mut written = 0;
        let mut input_done = false;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut stderr_stream = channel.stderr();
        let mut buf = [0u8; 8192];

        // Stdin, stdout and stderr are pumped in one loop so a full window on
        // one of them never stalls the others.
        loop {
            let mut progressed = false;

            if !input_done {
                if written < input.len() {
                    match channel.write(&input[written..]) {
                        Ok(n) => {
                            written += n;
                            progressed |= n > 0;
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                if written == input.len() {
                    nonblocking(|| channel.send_eof())?;
                    input_done = true;
                }
            }

            match channel.read(&mut buf) {
                Ok(n) => {
                    stdout.extend_from_slice(&buf[..n]);
                    progressed |= n > 0;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }

            if stderr_mode == StderrMode::Separate {
                match stderr_stream.read(&mut buf) {
                    Ok(n) => {
                        stderr.extend_from_slice(&buf[..n]);
                        progressed |= n > 0;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e.into()),
                }
            }

            if !progressed {
                if channel.eof() {
                    break;
                }
                std::thread::sleep(POLL_INTERVAL);
            }
        }

        nonblocking(|| channel.wait_close())?;
        let exit_status = channel.exit_status()?;
        debug!("Command exit code: {}", exit_status);

        Ok(SessionOutput {
            stdout,
            stderr,
            exit_status,
        })
    }

    fn start(self: Box<Self>, command: &str) -> Result<RunningCommand> {
        debug!("Starting remote command: {}", command);

        let mut channel = nonblocking(|| self.session.channel_session())?;
        nonblocking(|| channel.exec(command))?;
        nonblocking(|| channel.send_eof())?;

        let stdout = PollingStream {
            inner: channel.stream(0),
        };
        let stderr = PollingStream {
            inner: channel.stderr(),
        };

        Ok(RunningCommand {
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            finish: Box::new(move || {
                nonblocking(|| channel.wait_close())?;
                Ok(channel.exit_status()?)
            }),
        })
    }
}

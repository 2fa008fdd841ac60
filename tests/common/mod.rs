//! Scripted in-memory device for integration tests.
//!
//! Commands are answered from rules registered with [`FakeDevice::on`]; the
//! last matching rule wins and unmatched commands succeed silently. `rootdev`,
//! path checks and `reboot` are built in so provisioning runs behave like a
//! real device without scripting every step.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashSet;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use dut_provision::error::{Error, Result};
use dut_provision::remote::{
    Connection, Dialer, DirectAddress, DutAdapter, RemoteSession, RunningCommand, SessionOutput,
    StderrMode,
};

pub const CACHE: &str = "http://cache:8082";

#[derive(Debug, Clone, Default)]
pub struct Response {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub status: i32,
}

impl Response {
    pub fn ok(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    pub fn fail(status: i32, stderr: &str) -> Self {
        Self {
            stderr: stderr.as_bytes().to_vec(),
            status,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum RebootBehavior {
    /// The connection drops this long after `reboot` returns.
    CloseAfter(Duration),
    /// The device never goes down.
    Hang,
}

struct Rule {
    pattern: String,
    min_boots: usize,
    delay: Duration,
    response: Response,
}

struct DeviceState {
    rules: Vec<Rule>,
    files: HashSet<String>,
    roots: Vec<String>,
    disk: String,
    boots: usize,
    reboot: RebootBehavior,
    failing_dials: usize,
    dials: usize,
    log: Vec<(usize, String)>,
    stdin: Vec<(String, Vec<u8>)>,
}

#[derive(Clone)]
pub struct FakeDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl FakeDevice {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                rules: Vec::new(),
                files: HashSet::new(),
                roots: vec!["/dev/nvme0n1p3".to_string()],
                disk: "/dev/nvme0n1".to_string(),
                boots: 0,
                reboot: RebootBehavior::CloseAfter(Duration::from_millis(20)),
                failing_dials: 0,
                dials: 0,
                log: Vec::new(),
                stdin: Vec::new(),
            })),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap()
    }

    /// Answers commands containing `pattern` with `response`.
    pub fn on(&self, pattern: &str, response: Response) -> &Self {
        self.on_after_boot(pattern, 0, response)
    }

    /// Like [`on`](Self::on), active once the device rebooted `boots` times.
    pub fn on_after_boot(&self, pattern: &str, boots: usize, response: Response) -> &Self {
        self.state().rules.push(Rule {
            pattern: pattern.to_string(),
            min_boots: boots,
            delay: Duration::ZERO,
            response,
        });
        self
    }

    /// Like [`on`](Self::on), the command takes `delay` to finish.
    pub fn on_slow(&self, pattern: &str, delay: Duration, response: Response) -> &Self {
        self.state().rules.push(Rule {
            pattern: pattern.to_string(),
            min_boots: 0,
            delay,
            response,
        });
        self
    }

    pub fn add_file(&self, path: &str) -> &Self {
        self.state().files.insert(path.to_string());
        self
    }

    /// Root reported by `rootdev -s` for each boot, the last one repeating.
    pub fn set_roots(&self, disk: &str, roots: &[&str]) -> &Self {
        let mut state = self.state();
        state.disk = disk.to_string();
        state.roots = roots.iter().map(|r| r.to_string()).collect();
        self
    }

    pub fn set_reboot(&self, behavior: RebootBehavior) -> &Self {
        self.state().reboot = behavior;
        self
    }

    pub fn fail_next_dials(&self, count: usize) -> &Self {
        self.state().failing_dials = count;
        self
    }

    pub fn dials(&self) -> usize {
        self.state().dials
    }

    pub fn boots(&self) -> usize {
        self.state().boots
    }

    /// Every command in execution order.
    pub fn commands(&self) -> Vec<String> {
        self.state().log.iter().map(|(_, c)| c.clone()).collect()
    }

    /// Commands together with the id of the connection they ran on.
    pub fn commands_by_connection(&self) -> Vec<(usize, String)> {
        self.state().log.clone()
    }

    /// Bytes fed to the first command containing `pattern`.
    pub fn stdin_of(&self, pattern: &str) -> Option<Vec<u8>> {
        self.state()
            .stdin
            .iter()
            .find(|(command, _)| command.contains(pattern))
            .map(|(_, data)| data.clone())
    }

    pub fn count(&self, pattern: &str) -> usize {
        self.commands().iter().filter(|c| c.contains(pattern)).count()
    }

    pub fn position(&self, pattern: &str) -> Option<usize> {
        self.commands().iter().position(|c| c.contains(pattern))
    }

    pub fn dialer(&self) -> Arc<FakeDialer> {
        Arc::new(FakeDialer {
            device: self.clone(),
        })
    }

    pub fn adapter(&self) -> DutAdapter {
        DutAdapter::new("dut1", Arc::new(DirectAddress), self.dialer(), CACHE)
    }

    fn respond(&self, connection: usize, command: &str) -> (Response, Option<RebootBehavior>) {
        let mut state = self.state();
        state.log.push((connection, command.to_string()));

        let boots = state.boots;
        if let Some(rule) = state
            .rules
            .iter()
            .rev()
            .find(|rule| boots >= rule.min_boots && command.contains(&rule.pattern))
        {
            let response = rule.response.clone();
            let delay = rule.delay;
            let reboot = command.starts_with("reboot") && response.status == 0;
            if reboot {
                state.boots += 1;
            }
            let behavior = reboot.then_some(state.reboot);
            drop(state);
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
            return (response, behavior);
        }

        if command.starts_with("reboot") {
            state.boots += 1;
            return (Response::default(), Some(state.reboot));
        }
        if command == "rootdev -s -d" {
            return (Response::ok(state.disk.clone()), None);
        }
        if command == "rootdev -s" {
            let index = state.boots.min(state.roots.len().saturating_sub(1));
            let root = state.roots.get(index).cloned().unwrap_or_default();
            return (Response::ok(root), None);
        }
        if let Some(path) = command
            .strip_prefix("[ -e ")
            .and_then(|rest| rest.split_once(" ]"))
            .map(|(path, _)| path)
        {
            let exists = if state.files.contains(path) { "1" } else { "0" };
            return (Response::ok(exists), None);
        }

        (Response::default(), None)
    }
}

impl Default for FakeDevice {
    fn default() -> Self {
        Self::new()
    }
}

pub struct FakeDialer {
    device: FakeDevice,
}

impl Dialer for FakeDialer {
    fn dial(&self, address: &str) -> Result<Arc<dyn Connection>> {
        let mut state = self.device.state();
        if state.failing_dials > 0 {
            state.failing_dials -= 1;
            return Err(Error::Transport(format!("dial {}: connection refused", address)));
        }
        state.dials += 1;
        let (closed, _) = watch::channel(false);
        Ok(Arc::new(FakeConnection {
            id: state.dials,
            address: format!("{}#{}", address, state.dials),
            device: self.device.clone(),
            closed: Arc::new(closed),
        }))
    }
}

pub struct FakeConnection {
    id: usize,
    address: String,
    device: FakeDevice,
    closed: Arc<watch::Sender<bool>>,
}

#[async_trait]
impl Connection for FakeConnection {
    fn address(&self) -> &str {
        &self.address
    }

    fn new_session(&self) -> Result<Box<dyn RemoteSession>> {
        if *self.closed.borrow() {
            return Err(Error::Transport(format!("{} is closed", self.address)));
        }
        Ok(Box::new(FakeSession {
            connection: self.id,
            device: self.device.clone(),
            closed: Arc::clone(&self.closed),
        }))
    }

    async fn wait(&self) -> Result<()> {
        let mut rx = self.closed.subscribe();
        rx.wait_for(|closed| *closed)
            .await
            .map(|_| ())
            .map_err(|e| Error::Transport(e.to_string()))
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }
}

struct FakeSession {
    connection: usize,
    device: FakeDevice,
    closed: Arc<watch::Sender<bool>>,
}

impl FakeSession {
    fn schedule_drop(&self, behavior: RebootBehavior) {
        match behavior {
            RebootBehavior::CloseAfter(delay) if delay.is_zero() => {
                self.closed.send_replace(true);
            }
            RebootBehavior::CloseAfter(delay) => {
                let closed = Arc::clone(&self.closed);
                std::thread::spawn(move || {
                    std::thread::sleep(delay);
                    closed.send_replace(true);
                });
            }
            RebootBehavior::Hang => {}
        }
    }
}

impl RemoteSession for FakeSession {
    fn run(
        self: Box<Self>,
        command: &str,
        stdin: Option<&[u8]>,
        stderr: StderrMode,
    ) -> Result<SessionOutput> {
        if let Some(data) = stdin {
            self.device
                .state()
                .stdin
                .push((command.to_string(), data.to_vec()));
        }
        let (response, reboot) = self.device.respond(self.connection, command);
        if let Some(behavior) = reboot {
            self.schedule_drop(behavior);
        }

        let mut output = SessionOutput {
            stdout: response.stdout,
            stderr: response.stderr,
            exit_status: response.status,
        };
        if stderr == StderrMode::Combined {
            let merged = std::mem::take(&mut output.stderr);
            output.stdout.extend(merged);
        }
        Ok(output)
    }

    fn start(self: Box<Self>, command: &str) -> Result<RunningCommand> {
        let (response, _) = self.device.respond(self.connection, command);
        let status = response.status;
        Ok(RunningCommand {
            stdout: Box::new(Cursor::new(response.stdout)),
            stderr: Box::new(Cursor::new(response.stderr)),
            finish: Box::new(move || Ok(status)),
        })
    }
}

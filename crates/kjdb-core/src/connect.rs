//! Dialing and launching debug targets.
//!
//! Attach connects to a JVM whose debug agent is already listening. Launch
//! spawns a fresh JVM with the agent configured, scrapes the listen address
//! from its output, then attaches to it. Either way the result is a live
//! [`TargetVm`] handle.

use std::io::{BufRead, BufReader};
use std::net::TcpStream;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{DebugError, Result};
use crate::event::OutputCategory;
use crate::vm::wire::JdwpVm;
use crate::vm::TargetVm;

/// How long launch waits for the agent to report its listen address.
const LAUNCH_LISTEN_TIMEOUT: Duration = Duration::from_secs(15);

const LISTEN_PREFIX: &str = "Listening for transport dt_socket at address:";

// ── Attach ───────────────────────────────────────────────────────────────────

/// Connect to a listening debug agent and perform the wire handshake.
pub fn attach(host: &str, port: u16) -> Result<Arc<dyn TargetVm>> {
    let stream = TcpStream::connect((host, port)).map_err(|err| {
        if err.kind() == std::io::ErrorKind::ConnectionRefused {
            DebugError::ConnectRefused {
                host: host.to_string(),
                port,
            }
        } else {
            DebugError::Io(err)
        }
    })?;
    let vm = JdwpVm::handshake(stream)?;
    Ok(Arc::new(vm))
}

// ── Launch ───────────────────────────────────────────────────────────────────

/// Configuration for launching a target JVM under debug.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub main_class: String,
    pub classpath: Vec<String>,
    pub args: Vec<String>,
    /// Keep the target suspended until the debugger resumes it.
    pub suspend_on_start: bool,
    /// `java` executable to use; defaults to the one on PATH.
    pub java_command: Option<String>,
}

impl LaunchConfig {
    pub fn new(main_class: impl Into<String>) -> Self {
        Self {
            main_class: main_class.into(),
            classpath: Vec::new(),
            args: Vec::new(),
            suspend_on_start: true,
            java_command: None,
        }
    }
}

/// A child JVM owned by the session.
///
/// Stdout/stderr are pumped into an output channel by reader threads; the
/// session forwards them as output events.
pub struct LaunchedProcess {
    child: Mutex<Option<Child>>,
    output: Mutex<Option<Receiver<(OutputCategory, String)>>>,
}

impl LaunchedProcess {
    /// Take the output channel. Yields `None` after the first call.
    pub fn take_output(&self) -> Option<Receiver<(OutputCategory, String)>> {
        self.output.lock().expect("launch output poisoned").take()
    }

    /// Wait for the child to exit and return its exit code.
    pub fn wait_exit_code(&self) -> Option<i32> {
        let mut slot = self.child.lock().expect("launch child poisoned");
        let child = slot.as_mut()?;
        match child.wait() {
            Ok(status) => status.code(),
            Err(err) => {
                log::warn!("waiting for launched target: {err}");
                None
            }
        }
    }

    /// Kill the child if it is still running. Idempotent.
    pub fn kill(&self) {
        let mut slot = self.child.lock().expect("launch child poisoned");
        if let Some(child) = slot.as_mut() {
            let _ = child.kill();
            let _ = child.wait();
        }
        slot.take();
    }
}

/// Spawn the target JVM with the debug agent listening, wait for its
/// address, and attach.
pub fn launch(config: &LaunchConfig) -> Result<(Arc<dyn TargetVm>, LaunchedProcess)> {
    let java = config.java_command.as_deref().unwrap_or("java");
    let suspend = if config.suspend_on_start { "y" } else { "n" };
    let agent = format!(
        "-agentlib:jdwp=transport=dt_socket,server=y,suspend={suspend},address=127.0.0.1:0"
    );

    let mut command = Command::new(java);
    command.arg(agent);
    if !config.classpath.is_empty() {
        command.arg("-cp").arg(config.classpath.join(":"));
    }
    command.arg(&config.main_class);
    command.args(&config.args);
    command.stdout(Stdio::piped()).stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .map_err(|err| DebugError::LaunchFailed(format!("spawning {java}: {err}")))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| DebugError::LaunchFailed("no stdout pipe".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| DebugError::LaunchFailed("no stderr pipe".into()))?;

    let (tx, rx) = mpsc::channel();
    let mut reader = BufReader::new(stdout);
    let port = match scrape_listen_port(&mut reader, &mut child) {
        Ok(port) => port,
        Err(err) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(err);
        }
    };

    spawn_forwarder(reader, OutputCategory::Stdout, tx.clone());
    spawn_forwarder(BufReader::new(stderr), OutputCategory::Stderr, tx);

    let vm = attach("127.0.0.1", port)?;
    let process = LaunchedProcess {
        child: Mutex::new(Some(child)),
        output: Mutex::new(Some(rx)),
    };
    Ok((vm, process))
}

/// Read child stdout until the agent prints its listen address.
fn scrape_listen_port<R: BufRead>(reader: &mut R, child: &mut Child) -> Result<u16> {
    let deadline = Instant::now() + LAUNCH_LISTEN_TIMEOUT;
    let mut line = String::new();
    loop {
        if Instant::now() > deadline {
            return Err(DebugError::LaunchFailed(
                "timed out waiting for the debug agent to listen".into(),
            ));
        }
        line.clear();
        let read = reader.read_line(&mut line)?;
        if read == 0 {
            let status = child
                .try_wait()
                .ok()
                .flatten()
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown".into());
            return Err(DebugError::LaunchFailed(format!(
                "target exited before accepting a connection (status: {status})"
            )));
        }
        if let Some(port) = parse_listen_line(&line) {
            return Ok(port);
        }
    }
}

fn parse_listen_line(line: &str) -> Option<u16> {
    let rest = line.trim().strip_prefix(LISTEN_PREFIX)?;
    rest.trim().parse().ok()
}

fn spawn_forwarder<R: BufRead + Send + 'static>(
    reader: R,
    category: OutputCategory,
    tx: Sender<(OutputCategory, String)>,
) {
    std::thread::Builder::new()
        .name("kjdb-output-forwarder".into())
        .spawn(move || {
            for line in reader.lines() {
                match line {
                    Ok(text) => {
                        if tx.send((category, text)).is_err() {
                            return;
                        }
                    }
                    Err(_) => return,
                }
            }
        })
        .expect("failed to spawn output forwarder");
}

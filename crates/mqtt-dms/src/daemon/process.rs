//! OS process capabilities used by the supervisor.
//!
//! Everything the supervisor needs from the operating system goes through the
//! [`Launcher`] and [`ProcessHandle`] traits so the slot logic can be tested
//! without spawning real programs.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::{Child, Command};

/// Shell used to interpret configured commands
pub const SHELL: &str = "bash";

/// Operating system process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(pub u32);

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Result of probing a process handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    /// Exited with the given code (`None` when killed by a signal or unknown)
    Exited(Option<i32>),
}

impl Liveness {
    pub fn is_alive(&self) -> bool {
        matches!(self, Liveness::Alive)
    }
}

/// A spawned child the caller may keep an eye on.
#[async_trait]
pub trait ProcessHandle: Send {
    /// Best-effort process id. Absence is a normal outcome.
    fn pid(&self) -> Option<ProcessId>;

    /// Non-blocking liveness probe.
    fn probe(&mut self) -> Liveness;

    /// Forcefully terminate the process and reap it.
    async fn terminate(&mut self) -> std::io::Result<()>;
}

/// Spawns shell commands.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Spawn `command` without waiting for it to exit.
    fn spawn(&self, command: &str) -> std::io::Result<Box<dyn ProcessHandle>>;

    /// Run `command` and wait for it to exit, returning the exit code.
    ///
    /// Dropping the returned future must stop the command.
    async fn run(&self, command: &str) -> std::io::Result<Option<i32>>;
}

/// Launches commands through `bash -c`, inheriting stdio.
#[derive(Debug, Clone, Default)]
pub struct ShellLauncher {
    display: Option<String>,
}

impl ShellLauncher {
    /// Create a launcher forwarding the current `DISPLAY`, if any.
    pub fn new() -> Self {
        Self {
            display: std::env::var("DISPLAY").ok().filter(|d| !d.is_empty()),
        }
    }

    pub fn with_display(display: Option<String>) -> Self {
        Self { display }
    }

    fn command(&self, command: &str) -> Command {
        let mut cmd = Command::new(SHELL);
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        // GUI programs (browsers, players) need the X display
        if let Some(display) = &self.display {
            cmd.env("DISPLAY", display);
        }

        cmd
    }
}

#[async_trait]
impl Launcher for ShellLauncher {
    fn spawn(&self, command: &str) -> std::io::Result<Box<dyn ProcessHandle>> {
        log::debug!("Going to start command: {} -c {}", SHELL, command);
        let child = self.command(command).spawn()?;
        Ok(Box::new(ChildHandle { child }))
    }

    async fn run(&self, command: &str) -> std::io::Result<Option<i32>> {
        log::debug!("Going to run command: {} -c {}", SHELL, command);
        let mut child = self
            .command(command)
            .kill_on_drop(true) // Kill child process if future is dropped (e.g., on timeout)
            .spawn()?;
        let status = child.wait().await?;
        Ok(status.code())
    }
}

/// [`ProcessHandle`] backed by a tokio child process.
pub struct ChildHandle {
    child: Child,
}

#[async_trait]
impl ProcessHandle for ChildHandle {
    fn pid(&self) -> Option<ProcessId> {
        // None once the child has been reaped
        self.child.id().map(ProcessId)
    }

    fn probe(&mut self) -> Liveness {
        match self.child.try_wait() {
            Ok(None) => Liveness::Alive,
            Ok(Some(status)) => Liveness::Exited(status.code()),
            Err(e) => {
                log::debug!("Unable to probe child process: {}", e);
                Liveness::Exited(None)
            }
        }
    }

    async fn terminate(&mut self) -> std::io::Result<()> {
        if !self.probe().is_alive() {
            return Ok(());
        }
        self.child.kill().await
    }
}

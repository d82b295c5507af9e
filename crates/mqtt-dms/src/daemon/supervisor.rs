//! Single-slot process supervisor
//!
//! Owns the one long-running program the daemon manages and turns resolved
//! [`ActionSpec`]s into start, kill and exec actions.

use crate::daemon::process::{Launcher, Liveness, ProcessHandle, ProcessId, ShellLauncher};
use crate::daemon::util::now_ms;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Unable to start process with '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process '{0}' is still running and has no kill command")]
    SlotOccupied(String),

    #[error("No .cmd or .exec configured for {0}")]
    NotConfigured(String),

    #[error("Page-open requested but browser.start is not configured")]
    BrowserNotConfigured,
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Commands resolved for one action key
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionSpec {
    pub start_command: String,
    pub kill_command: String,
    pub exec_command: String,
}

/// Browser launch/kill commands for page-open requests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrowserCommands {
    pub start: String,
    pub kill: String,
}

/// Derived state of the managed slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Inactive,
    Running,
    Defective,
}

impl ProcessState {
    /// Combine the intended-running flag with a liveness probe.
    ///
    /// A missing probe (no handle) counts as dead.
    pub fn derive(intended_running: bool, liveness: Option<Liveness>) -> Self {
        match (intended_running, liveness) {
            (false, _) => ProcessState::Inactive,
            (true, Some(Liveness::Alive)) => ProcessState::Running,
            (true, _) => ProcessState::Defective,
        }
    }
}

/// Read-only view of the managed slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedSnapshot {
    pub pid: Option<ProcessId>,
    pub start_command: String,
    pub kill_command: String,
}

struct ManagedProcess {
    handle: Box<dyn ProcessHandle>,
    pid: Option<ProcessId>,
    start_command: String,
    kill_command: String,
}

#[derive(Default)]
struct Slot {
    process: Option<ManagedProcess>,
    intended_running: bool,
}

impl Slot {
    fn state(&mut self) -> ProcessState {
        let liveness = self.process.as_mut().map(|p| p.handle.probe());
        ProcessState::derive(self.intended_running, liveness)
    }

    fn clear(&mut self) {
        self.process = None;
        self.intended_running = false;
    }
}

/// Returns true if the start command is a web page to open in the browser.
pub fn is_page_url(command: &str) -> bool {
    command.starts_with("http://") || command.starts_with("https://")
}

/// Append `cache_buster=<millis>` so the browser never shows a stale page.
pub fn with_cache_buster(url: &str, millis: i64) -> String {
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{url}{sep}cache_buster={millis}")
}

/// Supervisor guaranteeing at most one managed process.
pub struct ProcessSupervisor {
    launcher: Arc<dyn Launcher>,
    browser: BrowserCommands,
    kill_timeout: Duration,
    slot: Mutex<Slot>,
}

impl ProcessSupervisor {
    pub fn new(launcher: Arc<dyn Launcher>, browser: BrowserCommands, kill_timeout: Duration) -> Self {
        log::info!("Create ProcessSupervisor ...");
        Self {
            launcher,
            browser,
            kill_timeout,
            slot: Mutex::new(Slot::default()),
        }
    }

    /// Supervisor spawning commands through `bash -c`
    pub fn with_shell(browser: BrowserCommands, kill_timeout: Duration) -> Self {
        Self::new(Arc::new(ShellLauncher::new()), browser, kill_timeout)
    }

    /// Execute the action resolved for `action_key`.
    ///
    /// Failures are logged here and reported as `false`.
    pub async fn execute_action(&self, action_key: &str, spec: &ActionSpec) -> bool {
        match self.apply(action_key, spec).await {
            Ok(()) => true,
            Err(e @ (SupervisorError::NotConfigured(_) | SupervisorError::BrowserNotConfigured)) => {
                log::warn!("{}", e);
                false
            }
            Err(e @ SupervisorError::SlotOccupied(_)) => {
                log::warn!("Refusing to start process for {}: {}", action_key, e);
                false
            }
            Err(e) => {
                log::error!("Action for {} failed: {}", action_key, e);
                false
            }
        }
    }

    async fn apply(&self, action_key: &str, spec: &ActionSpec) -> Result<()> {
        let mut slot = self.slot.lock().await;

        let already_running = spec.exec_command.is_empty()
            && slot
                .process
                .as_ref()
                .is_some_and(|p| p.start_command == spec.start_command)
            && slot.state() == ProcessState::Running;
        if already_running {
            log::debug!("Command {} already running.", spec.start_command);
            return Ok(());
        }

        if !spec.start_command.is_empty() {
            let (command, kill_command) = self.effective_start(spec)?;

            self.make_room(&mut slot).await?;

            log::debug!("Going to execute {} for {}", command, action_key);
            let handle = self
                .launcher
                .spawn(&command)
                .map_err(|source| SupervisorError::Spawn {
                    command: command.clone(),
                    source,
                })?;
            let pid = handle.pid();
            match pid {
                Some(pid) => log::info!("Started process PID={}, cmd={}", pid, command),
                None => log::info!("Started process, cmd={}", command),
            }

            slot.process = Some(ManagedProcess {
                handle,
                pid,
                start_command: spec.start_command.clone(),
                kill_command,
            });
            slot.intended_running = true;
            Ok(())
        } else if !spec.exec_command.is_empty() {
            drop(slot);
            log::debug!("Going to exec {} for {}", spec.exec_command, action_key);
            // Untracked: the handle is dropped and the child runs on its own
            self.launcher
                .spawn(&spec.exec_command)
                .map(drop)
                .map_err(|source| SupervisorError::Spawn {
                    command: spec.exec_command.clone(),
                    source,
                })
        } else {
            Err(SupervisorError::NotConfigured(action_key.to_string()))
        }
    }

    /// Actual command line and kill command for a start request.
    fn effective_start(&self, spec: &ActionSpec) -> Result<(String, String)> {
        if !is_page_url(&spec.start_command) {
            return Ok((spec.start_command.clone(), spec.kill_command.clone()));
        }
        if self.browser.start.is_empty() {
            return Err(SupervisorError::BrowserNotConfigured);
        }
        let url = with_cache_buster(&spec.start_command, now_ms());
        Ok((format!("{} {}", self.browser.start, url), self.browser.kill.clone()))
    }

    /// Empty the slot before a start, killing the current process if it has
    /// a kill command.
    async fn make_room(&self, slot: &mut Slot) -> Result<()> {
        let Some(current) = slot.process.as_mut() else {
            return Ok(());
        };

        if !current.kill_command.is_empty() {
            let kill_command = current.kill_command.clone();
            self.kill_current(slot, &kill_command).await;
            return Ok(());
        }

        if current.handle.probe().is_alive() {
            return Err(SupervisorError::SlotOccupied(current.start_command.clone()));
        }

        log::warn!(
            "Managed process '{}' has exited, clearing slot",
            current.start_command
        );
        slot.clear();
        Ok(())
    }

    /// Run the kill command and wait for it. Never fails; the slot is
    /// always cleared afterwards.
    async fn kill_current(&self, slot: &mut Slot, kill_command: &str) {
        log::debug!("Stop process with: {}", kill_command);

        let force = match tokio::time::timeout(self.kill_timeout, self.launcher.run(kill_command))
            .await
        {
            Ok(Ok(Some(0))) => {
                log::info!("Exec of {} returned 0", kill_command);
                false
            }
            Ok(Ok(code)) => {
                log::warn!("Exec of {} failed with code {:?}", kill_command, code);
                false
            }
            Ok(Err(e)) => {
                log::error!("Failed to stop process with {}: {}", kill_command, e);
                true
            }
            Err(_) => {
                log::error!(
                    "Kill command {} did not finish within {:?}",
                    kill_command,
                    self.kill_timeout
                );
                true
            }
        };

        if force {
            if let Some(process) = slot.process.as_mut() {
                if let Err(e) = process.handle.terminate().await {
                    log::warn!("Forced termination failed: {}", e);
                }
            }
        }

        slot.clear();
    }

    pub async fn current_state(&self) -> ProcessState {
        self.slot.lock().await.state()
    }

    pub async fn managed(&self) -> Option<ManagedSnapshot> {
        let slot = self.slot.lock().await;
        slot.process.as_ref().map(|p| ManagedSnapshot {
            pid: p.pid,
            start_command: p.start_command.clone(),
            kill_command: p.kill_command.clone(),
        })
    }

    /// Hard stop of the managed process. Does not run the kill command.
    pub async fn shutdown(&self) {
        log::info!("Shutdown ProcessSupervisor");
        let mut slot = self.slot.lock().await;
        if let Some(mut process) = slot.process.take() {
            if let Err(e) = process.handle.terminate().await {
                log::warn!("Failed to terminate '{}': {}", process.start_command, e);
            }
        }
        slot.intended_running = false;
    }
}

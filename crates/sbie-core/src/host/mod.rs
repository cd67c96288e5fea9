//! Host primitive seams: service-manager queries and elevated execution.
//!
//! Production implementations live in [`system`]; tests use
//! [`crate::fakes::SimulatedHost`].

pub mod system;

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ExecError, SystemError};

pub use system::{ScmServiceControl, ShellElevatedRunner};

/// Service-manager state of a registered service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceState {
    Stopped,
    StartPending,
    StopPending,
    Running,
    ContinuePending,
    PausePending,
    Paused,
}

impl ServiceState {
    /// Parse the numeric code reported by the service manager.
    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            1 => ServiceState::Stopped,
            2 => ServiceState::StartPending,
            3 => ServiceState::StopPending,
            4 => ServiceState::Running,
            5 => ServiceState::ContinuePending,
            6 => ServiceState::PausePending,
            7 => ServiceState::Paused,
            _ => return None,
        })
    }
}

/// Read-only queries against the OS driver registry and service manager.
pub trait ServiceControl: Send + Sync {
    /// Whether a kernel driver service key exists for `name`.
    fn driver_registered(&self, name: &str) -> Result<bool, SystemError>;

    /// Current state of service `name`, `None` if it is not registered.
    fn service_state(&self, name: &str) -> Result<Option<ServiceState>, SystemError>;
}

/// A program to run elevated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElevatedCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl ElevatedCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.working_dir = Some(dir.to_path_buf());
        self
    }

    /// First argument, the helper verb for privileged-helper commands.
    pub fn verb(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }

    /// Argument string with whitespace-containing arguments quoted.
    pub fn command_line(&self) -> String {
        self.args
            .iter()
            .map(|arg| {
                if arg.contains(char::is_whitespace) {
                    format!("\"{arg}\"")
                } else {
                    arg.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for ElevatedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.program.display(), self.command_line())
    }
}

/// Runs a process elevated and blocks until it exits.
///
/// A launch failure is always an error, never a silent success. The exit
/// code is returned as data; callers decide what it means.
#[async_trait]
pub trait PrivilegedRunner: Send + Sync {
    async fn run(
        &self,
        command: &ElevatedCommand,
        timeout: Option<Duration>,
    ) -> Result<i32, ExecError>;
}

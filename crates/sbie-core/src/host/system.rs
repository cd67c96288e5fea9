//! Production host primitives built on the Windows command-line tools.
//!
//! `reg.exe` and `sc.exe` answer presence queries; elevated processes are
//! started through PowerShell's `Start-Process -Verb RunAs -Wait`.

use std::process::{Command, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{ElevatedCommand, PrivilegedRunner, ServiceControl, ServiceState};
use crate::error::{ExecError, SystemError};

const SERVICES_KEY: &str = r"HKLM\SYSTEM\CurrentControlSet\Services";
/// `sc.exe` error for an unknown service.
const SERVICE_DOES_NOT_EXIST: &str = "1060";
const ACCESS_DENIED: &str = "Access is denied";

/// Queries the service manager through `sc.exe` and the registry through
/// `reg.exe`.
#[derive(Debug, Default, Clone)]
pub struct ScmServiceControl;

impl ScmServiceControl {
    pub fn new() -> Self {
        Self
    }
}

impl ServiceControl for ScmServiceControl {
    fn driver_registered(&self, name: &str) -> Result<bool, SystemError> {
        let key = format!(r"{SERVICES_KEY}\{name}");
        let output = Command::new("reg").args(["query", &key]).output()?;
        if output.status.success() {
            return Ok(true);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains(ACCESS_DENIED) {
            return Err(SystemError::AccessDenied(key));
        }
        debug!(key = %key, "driver key not present");
        Ok(false)
    }

    fn service_state(&self, name: &str) -> Result<Option<ServiceState>, SystemError> {
        let output = Command::new("sc").args(["query", name]).output()?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            if stdout.contains(SERVICE_DOES_NOT_EXIST) {
                return Ok(None);
            }
            if stdout.contains(ACCESS_DENIED) {
                return Err(SystemError::AccessDenied(name.to_string()));
            }
            return Err(SystemError::Parse(stdout.trim().to_string()));
        }
        parse_sc_state(&stdout)
            .map(Some)
            .ok_or_else(|| SystemError::Parse(stdout.trim().to_string()))
    }
}

/// Extract the state from `sc query` output (`STATE : 4  RUNNING`).
fn parse_sc_state(output: &str) -> Option<ServiceState> {
    output
        .lines()
        .find(|line| line.trim_start().starts_with("STATE"))
        .and_then(|line| line.split(':').nth(1))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|code| code.parse().ok())
        .and_then(ServiceState::from_code)
}

/// Runs commands elevated via PowerShell and reports the child's exit code.
#[derive(Debug, Clone)]
pub struct ShellElevatedRunner {
    shell: String,
}

impl Default for ShellElevatedRunner {
    fn default() -> Self {
        Self {
            shell: "powershell".to_string(),
        }
    }
}

impl ShellElevatedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(command: &ElevatedCommand) -> String {
        let mut start = format!(
            "Start-Process -FilePath {} -Verb RunAs -Wait -PassThru -WindowStyle Hidden",
            ps_quote(&command.program.to_string_lossy())
        );
        if !command.args.is_empty() {
            start.push_str(" -ArgumentList ");
            start.push_str(&ps_quote(&command.command_line()));
        }
        if let Some(dir) = &command.working_dir {
            start.push_str(" -WorkingDirectory ");
            start.push_str(&ps_quote(&dir.to_string_lossy()));
        }
        format!(
            "try {{ $p = {start}; Write-Output $p.ExitCode }} \
             catch {{ [Console]::Error.WriteLine($_.Exception.Message); exit 1 }}"
        )
    }
}

/// Single-quote a PowerShell string literal.
fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[async_trait]
impl PrivilegedRunner for ShellElevatedRunner {
    async fn run(
        &self,
        command: &ElevatedCommand,
        timeout: Option<Duration>,
    ) -> Result<i32, ExecError> {
        let program = command.program.display().to_string();
        let launch = |reason: String| ExecError::Launch {
            program: program.clone(),
            reason,
        };

        let child = tokio::process::Command::new(&self.shell)
            .args(["-NoProfile", "-NonInteractive", "-Command"])
            .arg(Self::script(command))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| launch(e.to_string()))?;

        let output = match timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| ExecError::Timeout {
                    program: program.clone(),
                    timeout: limit,
                })?,
            None => child.wait_with_output().await,
        }
        .map_err(|e| launch(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(launch(stderr.trim().to_string()));
        }

        String::from_utf8_lossy(&output.stdout)
            .lines()
            .rev()
            .find_map(|line| line.trim().parse::<i32>().ok())
            .ok_or(ExecError::NoExitCode { program })
    }
}

//! In-memory host and release fakes (testing only)
//!
//! `SimulatedHost` plays the OS side of every seam at once: the native
//! control interface (delegating to [`MemorySbieApi`]), the driver registry
//! and service manager, and the elevated runner. Helper verbs change the
//! simulated driver and service state; running any other program emulates
//! the installer by writing an install tree. `StaticRelease` hands out a
//! fixed installer file.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use sbie_native::{
    BoxPaths, HomePath, MemorySbieApi, NativeResult, ProcessInfo, SbieApi,
};

use crate::error::{ExecError, SystemError};
use crate::host::{ElevatedCommand, PrivilegedRunner, ServiceControl, ServiceState};
use crate::outcome::{Outcome, StatusCode};
use crate::release::ReleaseSource;
use crate::settings::SbieSettings;

#[derive(Debug, Default)]
struct HostState {
    driver_registered: bool,
    service: Option<ServiceState>,
    helper_calls: Vec<Vec<String>>,
    installer_runs: Vec<PathBuf>,
    ignored_verbs: BTreeSet<String>,
    launch_fails: bool,
    installer_fails: bool,
    installer_writes_nothing: bool,
    driver_access_denied: bool,
    service_access_denied: bool,
}

/// Simulated Windows host.
pub struct SimulatedHost {
    settings: SbieSettings,
    api: MemorySbieApi,
    state: Mutex<HostState>,
}

impl SimulatedHost {
    pub fn new(settings: &SbieSettings) -> Self {
        Self {
            settings: settings.clone(),
            api: MemorySbieApi::new(),
            state: Mutex::new(HostState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// The underlying native fake, for seeding and inspection.
    pub fn api(&self) -> &MemorySbieApi {
        &self.api
    }

    /// Write the files an unpacked installation contains.
    pub fn write_install_tree(&self) -> io::Result<()> {
        let dir = self.settings.install_dir();
        fs::create_dir_all(&dir)?;
        let components = &self.settings.components;
        for file in [
            self.settings.marker_executable.as_str(),
            self.settings.legacy_control_executable.as_str(),
            components.library.as_str(),
            components.service.as_str(),
            components.message_catalog.as_str(),
            components.driver.as_str(),
            components.helper.as_str(),
        ] {
            fs::write(dir.join(file), b"MZ")?;
        }
        Ok(())
    }

    pub fn set_driver_registered(&self, registered: bool) {
        self.lock().driver_registered = registered;
    }

    pub fn set_service_state(&self, state: Option<ServiceState>) {
        self.lock().service = state;
    }

    pub fn service_state_now(&self) -> Option<ServiceState> {
        self.lock().service
    }

    pub fn driver_registered_now(&self) -> bool {
        self.lock().driver_registered
    }

    /// Helper runs with `verb` exit 0 but change nothing.
    pub fn ignore_helper_verb(&self, verb: &str) {
        self.lock().ignored_verbs.insert(verb.to_string());
    }

    /// Every elevated launch fails.
    pub fn fail_launch(&self, fail: bool) {
        self.lock().launch_fails = fail;
    }

    /// The installer cannot be launched.
    pub fn fail_installer(&self, fail: bool) {
        self.lock().installer_fails = fail;
    }

    /// The installer exits without unpacking anything.
    pub fn installer_writes_nothing(&self, nothing: bool) {
        self.lock().installer_writes_nothing = nothing;
    }

    pub fn deny_driver_access(&self, deny: bool) {
        self.lock().driver_access_denied = deny;
    }

    pub fn deny_service_access(&self, deny: bool) {
        self.lock().service_access_denied = deny;
    }

    /// Argument lists of every privileged-helper run.
    pub fn helper_calls(&self) -> Vec<Vec<String>> {
        self.lock().helper_calls.clone()
    }

    /// Programs run as installers.
    pub fn installer_runs(&self) -> Vec<PathBuf> {
        self.lock().installer_runs.clone()
    }

    fn is_helper(&self, program: &Path) -> bool {
        program.file_name().and_then(|n| n.to_str()) == Some(self.settings.components.helper.as_str())
    }

    fn run_helper(&self, args: &[String]) {
        let mut state = self.lock();
        state.helper_calls.push(args.to_vec());

        let (Some(verb), Some(name)) = (args.first(), args.get(1)) else {
            return;
        };
        if state.ignored_verbs.contains(verb) {
            return;
        }
        let is_driver = *name == self.settings.driver().name;
        match (verb.as_str(), is_driver) {
            ("install", true) => state.driver_registered = true,
            ("install", false) => {
                if state.service.is_none() {
                    state.service = Some(ServiceState::Stopped);
                }
            }
            ("stop", false) => {
                if state.service.is_some() {
                    state.service = Some(ServiceState::Stopped);
                }
            }
            ("delete", true) => state.driver_registered = false,
            ("delete", false) => state.service = None,
            _ => {}
        }
    }
}

impl ServiceControl for SimulatedHost {
    fn driver_registered(&self, _name: &str) -> Result<bool, SystemError> {
        let state = self.lock();
        if state.driver_access_denied {
            return Err(SystemError::AccessDenied("driver key".to_string()));
        }
        Ok(state.driver_registered)
    }

    fn service_state(&self, _name: &str) -> Result<Option<ServiceState>, SystemError> {
        let state = self.lock();
        if state.service_access_denied {
            return Err(SystemError::AccessDenied("service key".to_string()));
        }
        Ok(state.service)
    }
}

#[async_trait]
impl PrivilegedRunner for SimulatedHost {
    async fn run(
        &self,
        command: &ElevatedCommand,
        _timeout: Option<Duration>,
    ) -> Result<i32, ExecError> {
        let program = command.program.display().to_string();
        if self.lock().launch_fails {
            return Err(ExecError::Launch {
                program,
                reason: "elevation refused".to_string(),
            });
        }

        if self.is_helper(&command.program) {
            self.run_helper(&command.args);
            return Ok(0);
        }

        let (fails, writes_nothing) = {
            let mut state = self.lock();
            state.installer_runs.push(command.program.clone());
            (state.installer_fails, state.installer_writes_nothing)
        };
        if fails {
            return Err(ExecError::NoExitCode { program });
        }
        if !writes_nothing {
            self.write_install_tree().map_err(|e| ExecError::Launch {
                program,
                reason: e.to_string(),
            })?;
        }
        Ok(0)
    }
}

impl SbieApi for SimulatedHost {
    /// Succeeds only for a registered service, which then runs.
    fn start_service(&self, retry: bool) -> NativeResult<bool> {
        let started = self.api.start_service(retry)?;
        let mut state = self.lock();
        if !started || state.service.is_none() {
            return Ok(false);
        }
        state.service = Some(ServiceState::Running);
        Ok(true)
    }

    fn enum_boxes(&self, index: i32) -> NativeResult<Option<(i32, String)>> {
        self.api.enum_boxes(index)
    }

    fn query_box_path(&self, box_name: &str) -> NativeResult<BoxPaths> {
        self.api.query_box_path(box_name)
    }

    fn query_process_path(&self, pid: u32) -> NativeResult<BoxPaths> {
        self.api.query_process_path(pid)
    }

    fn count_processes(&self, box_name: &str, all_sessions: bool, session: u32) -> NativeResult<u32> {
        self.api.count_processes(box_name, all_sessions, session)
    }

    fn enum_processes(
        &self,
        box_name: &str,
        all_sessions: bool,
        session: u32,
        capacity: u32,
    ) -> NativeResult<Vec<u32>> {
        self.api
            .enum_processes(box_name, all_sessions, session, capacity)
    }

    fn query_process(&self, pid: u32) -> NativeResult<ProcessInfo> {
        self.api.query_process(pid)
    }

    fn query_conf(&self, section: &str, setting: &str, index_word: u32) -> NativeResult<String> {
        self.api.query_conf(section, setting, index_word)
    }

    fn update_conf(
        &self,
        operation: char,
        password: &str,
        section: &str,
        setting: &str,
        value: &str,
    ) -> NativeResult<()> {
        self.api
            .update_conf(operation, password, section, setting, value)
    }

    fn reload_conf(&self, session_id: u32) -> NativeResult<()> {
        self.api.reload_conf(session_id)
    }

    fn get_home_path(&self) -> NativeResult<HomePath> {
        self.api.get_home_path()
    }

    fn run_sandboxed(
        &self,
        box_name: &str,
        command: &str,
        directory: &str,
        creation_flags: u32,
    ) -> NativeResult<u32> {
        self.api
            .run_sandboxed(box_name, command, directory, creation_flags)
    }

    fn kill_one(&self, pid: u32) -> NativeResult<bool> {
        self.api.kill_one(pid)
    }

    fn kill_all(&self, session_id: u32, box_name: &str) -> NativeResult<bool> {
        self.api.kill_all(session_id, box_name)
    }

    fn query_dos_device(&self, drive: &str) -> NativeResult<String> {
        self.api.query_dos_device(drive)
    }
}

/// Release source that writes a fixed installer or fails with a fixed status.
pub struct StaticRelease {
    file_name: String,
    failure: Mutex<Option<(StatusCode, String)>>,
    calls: Mutex<Vec<bool>>,
}

impl StaticRelease {
    pub fn new(file_name: &str) -> Self {
        Self {
            file_name: file_name.to_string(),
            failure: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn arc(file_name: &str) -> Arc<Self> {
        Arc::new(Self::new(file_name))
    }

    /// Fail every download with `status`.
    pub fn fail_with(&self, status: StatusCode, message: &str) {
        *self.failure.lock().unwrap_or_else(|p| p.into_inner()) =
            Some((status, message.to_string()));
    }

    /// `retry` flag of every download request.
    pub fn calls(&self) -> Vec<bool> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl ReleaseSource for StaticRelease {
    async fn download_installer(&self, dest_dir: &Path, retry: bool) -> Outcome<PathBuf> {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(retry);
        let failure = self
            .failure
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        if let Some((status, message)) = failure {
            return Outcome::fail(status, message);
        }

        let path = dest_dir.join(&self.file_name);
        match fs::write(&path, b"MZ") {
            Ok(()) => Outcome::ok(path),
            Err(err) => Outcome::fail(StatusCode::DownloadFailed, err.to_string()),
        }
    }
}

//! Box entity: a named configuration section plus the processes isolated
//! under it.
//!
//! A box has no state of its own. Existence, enabled flag, activity,
//! configuration and path are re-read from the native layer on every access.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use sbie_native::{SbieApi, ALL_SESSIONS, CURRENT_SESSION};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{ConfigKey, ConfigOperation, ConfigStore, QueryOptions};
use crate::executable;
use crate::outcome::{Outcome, StatusCode};
use crate::probe::check_install_path;
use crate::settings::SbieSettings;

/// Extra slots requested beyond the reported process count.
const PID_HEADROOM: u32 = 1024;

/// Snapshot of a box's own key/values (template values excluded).
pub type BoxConfiguration = BTreeMap<ConfigKey, Vec<String>>;

/// A process currently isolated in a box.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoxedProcess {
    pub pid: u32,
    pub box_name: String,
    pub image_name: String,
    pub session_id: u32,
}

/// Enumerate the processes of `box_name`: count first, then fetch with
/// headroom, dropping empty slots. No processes is a success without data.
pub fn boxed_processes(api: &dyn SbieApi, box_name: &str) -> Outcome<Vec<BoxedProcess>> {
    let pids_error = |err: sbie_native::NativeError| {
        Outcome::fail(
            StatusCode::GetBoxedPidsError,
            format!("process enumeration for {box_name} failed: {err}"),
        )
    };

    let count = match api.count_processes(box_name, false, ALL_SESSIONS) {
        Ok(count) => count,
        Err(err) => return pids_error(err),
    };
    let pids: Vec<u32> =
        match api.enum_processes(box_name, false, ALL_SESSIONS, count.saturating_add(PID_HEADROOM)) {
            Ok(pids) => pids.into_iter().filter(|pid| *pid != 0).collect(),
            Err(err) => return pids_error(err),
        };

    let processes: Vec<BoxedProcess> = pids
        .into_iter()
        .filter_map(|pid| match api.query_process(pid) {
            Ok(info) => Some(BoxedProcess {
                pid,
                box_name: info.box_name,
                image_name: info.image_name,
                session_id: info.session_id,
            }),
            Err(err) => {
                debug!(pid, error = %err, "boxed process vanished");
                None
            }
        })
        .collect();

    if processes.is_empty() {
        Outcome::ok_empty()
    } else {
        Outcome::ok(processes)
    }
}

/// Map `\Device\<volume>\rest` to `X:\rest` by asking every drive letter for
/// its device.
pub fn resolve_dos_path(api: &dyn SbieApi, nt_path: &str) -> Option<String> {
    let mut parts = nt_path.splitn(4, '\\');
    let (_, root, volume) = (parts.next()?, parts.next()?, parts.next()?);
    if root.is_empty() || volume.is_empty() {
        return None;
    }
    let device = format!("\\{root}\\{volume}");
    let rest = &nt_path[device.len()..];

    ('A'..='Z')
        .map(|letter| format!("{letter}:"))
        .find(|drive| {
            api.query_dos_device(drive)
                .is_ok_and(|target| target.eq_ignore_ascii_case(&device))
        })
        .map(|drive| {
            if rest.is_empty() {
                format!("{drive}\\")
            } else {
                format!("{drive}{rest}")
            }
        })
}

/// Start `file` inside `box_name` with the install dir as working directory.
pub fn run_boxed(
    api: &dyn SbieApi,
    settings: &SbieSettings,
    file: &Path,
    box_name: &str,
) -> Outcome<u32> {
    let installed = check_install_path(settings);
    if !installed.is_ok() {
        return Outcome::<u32>::fail(
            StatusCode::RunBoxedError,
            "cannot run boxed: install path does not exist",
        )
        .caused_by(&installed);
    }
    let target = match executable::resolve(file) {
        Ok(Some(target)) => target,
        Ok(None) | Err(_) => {
            return Outcome::fail(
                StatusCode::RunBoxedNotExists,
                format!("{} does not exist", file.display()),
            )
        }
    };

    let command = target.display().to_string();
    let directory = settings.install_dir().display().to_string();
    match api.run_sandboxed(box_name, &command, &directory, 0) {
        Ok(pid) => {
            info!(box_name = %box_name, pid, command = %command, "started boxed process");
            Outcome::ok(pid)
        }
        Err(err) => Outcome::fail(
            StatusCode::RunBoxedError,
            format!("failed to start {command} in {box_name}: {err}"),
        ),
    }
}

/// Names of every configured box, in configuration order.
pub fn list_boxes(api: &dyn SbieApi) -> Outcome<Vec<String>> {
    let mut names = Vec::new();
    let mut index = -1;
    loop {
        match api.enum_boxes(index) {
            Ok(Some((next, name))) => {
                names.push(name);
                index = next;
            }
            Ok(None) => return Outcome::ok(names),
            Err(err) => {
                return Outcome::fail(
                    StatusCode::GetConfigValueError,
                    format!("box enumeration failed: {err}"),
                )
            }
        }
    }
}

/// Read/write facade for one box.
#[derive(Clone)]
pub struct SandboxBox {
    name: String,
    api: Arc<dyn SbieApi>,
    store: ConfigStore,
    settings: Arc<SbieSettings>,
}

impl SandboxBox {
    pub fn new(
        name: &str,
        api: Arc<dyn SbieApi>,
        store: ConfigStore,
        settings: Arc<SbieSettings>,
    ) -> Self {
        Self {
            name: name.to_string(),
            api,
            store,
            settings,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn enabled_value(&self) -> Outcome<String> {
        self.store.get(
            &self.name,
            ConfigKey::Enabled,
            0,
            QueryOptions::SKIP_GLOBAL_SETTINGS | QueryOptions::IGNORE_TEMPLATE_SETTINGS,
        )
    }

    /// The section declares `Enabled`.
    pub fn exists(&self) -> bool {
        self.enabled_value().is_ok()
    }

    /// `Enabled` starts with `y`.
    pub fn enabled(&self) -> bool {
        self.enabled_value()
            .data()
            .is_some_and(|value| value.starts_with('y'))
    }

    pub fn processes(&self) -> Outcome<Vec<BoxedProcess>> {
        boxed_processes(self.api.as_ref(), &self.name)
    }

    /// At least one process runs in the box.
    pub fn active(&self) -> Outcome<bool> {
        let processes = self.processes();
        if !processes.is_ok() {
            return Outcome::<bool>::fail(
                StatusCode::BoxIsActiveError,
                format!("activity of {} could not be determined", self.name),
            )
            .caused_by(&processes);
        }
        Outcome::ok(processes.data().is_some_and(|p| !p.is_empty()))
    }

    /// Every key the section itself declares, `None` when the box does not
    /// exist or declares nothing.
    pub fn configuration(&self) -> Option<BoxConfiguration> {
        if !self.exists() {
            return None;
        }
        let configuration: BoxConfiguration = ConfigKey::ALL
            .iter()
            .filter_map(|key| {
                self.store
                    .get_all(&self.name, *key, QueryOptions::IGNORE_TEMPLATE_SETTINGS)
                    .into_data()
                    .map(|values| (*key, values))
            })
            .collect();
        (!configuration.is_empty()).then_some(configuration)
    }

    /// Host filesystem root of the box.
    pub fn path(&self) -> Outcome<String> {
        let paths = match self.api.query_box_path(&self.name) {
            Ok(paths) => paths,
            Err(err) => {
                return Outcome::fail(
                    StatusCode::GetBoxPathError,
                    format!("box path query for {} failed: {err}", self.name),
                )
            }
        };
        match resolve_dos_path(self.api.as_ref(), &paths.file) {
            Some(path) => Outcome::ok(path),
            None => Outcome::fail(
                StatusCode::GetBoxPathError,
                format!("no drive maps {}", paths.file),
            ),
        }
    }

    /// Start `file` in this box. Refused when the box has neither
    /// configuration nor an enabled flag.
    pub fn run(&self, file: &Path) -> Outcome<u32> {
        if self.configuration().is_none() && !self.enabled() {
            return Outcome::fail(
                StatusCode::BoxNoAnyConfiguration,
                format!("{} has no configuration and is not enabled", self.name),
            );
        }
        run_boxed(self.api.as_ref(), &self.settings, file, &self.name)
    }

    /// Seed a new box with the box defaults.
    pub fn create(&self) -> Outcome<bool> {
        if self.exists() {
            return Outcome::fail(
                StatusCode::BoxAlreadyExists,
                format!("{} already exists, load defaults instead", self.name),
            );
        }
        self.store.seed(&self.name, &self.settings.box_defaults)
    }

    /// Reset an existing box to the box defaults.
    pub fn load_defaults(&self) -> Outcome<bool> {
        if !self.exists() {
            return Outcome::fail(
                StatusCode::BoxNotExists,
                format!("{} does not exist, create it instead", self.name),
            );
        }
        self.store.seed(&self.name, &self.settings.box_defaults)
    }

    /// Delete the box section. Refused while any process runs in the box or
    /// when that cannot be determined.
    pub fn remove(&self) -> Outcome<bool> {
        let active = self.active();
        if !active.is_ok() {
            return active;
        }
        if active.data() == Some(&true) {
            return Outcome::fail(
                StatusCode::BoxRemoveBoxIsActive,
                format!("{} has running processes", self.name),
            );
        }

        let deleted = self.store.edit(
            ConfigOperation::Overwrite,
            &self.name,
            ConfigKey::Wildcard,
            "",
            None,
        );
        if !deleted.is_ok() {
            return Outcome::<bool>::fail(
                StatusCode::BoxRemoveError,
                format!("{} could not be deleted", self.name),
            )
            .caused_by(&deleted);
        }
        info!(box_name = %self.name, "box removed");
        Outcome::ok(true)
    }

    /// Terminate every process in the box.
    pub fn kill_all(&self) -> Outcome<bool> {
        match self.api.kill_all(CURRENT_SESSION, &self.name) {
            Ok(true) => Outcome::ok(true),
            Ok(false) => Outcome::fail(
                StatusCode::BoxKillError,
                format!("processes in {} were not terminated", self.name),
            ),
            Err(err) => Outcome::fail(StatusCode::BoxKillError, err.to_string()),
        }
    }

    /// Terminate one process of the box.
    pub fn kill(&self, pid: u32) -> Outcome<bool> {
        match self.api.kill_one(pid) {
            Ok(true) => Outcome::ok(true),
            Ok(false) => Outcome::fail(
                StatusCode::BoxKillError,
                format!("process {pid} was not terminated"),
            ),
            Err(err) => Outcome::fail(StatusCode::BoxKillError, err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sbie_native::MemorySbieApi;

    #[test]
    fn test_boxed_processes_empty_is_success_without_data() {
        let api = MemorySbieApi::new();
        let outcome = boxed_processes(&api, "Empty");
        assert!(outcome.is_ok());
        assert!(outcome.data().is_none());
    }

    #[test]
    fn test_boxed_processes_decorated() {
        let api = MemorySbieApi::new();
        let pid = api.spawn_in_box("Work", "notepad.exe");
        api.spawn_in_box("Other", "calc.exe");
        let processes = boxed_processes(&api, "Work").into_data().unwrap();
        assert_eq!(processes.len(), 1);
        assert_eq!(processes[0].pid, pid);
        assert_eq!(processes[0].image_name, "notepad.exe");
    }

    #[test]
    fn test_boxed_processes_failure() {
        let api = MemorySbieApi::new();
        api.fail_process_enum(true);
        assert_eq!(
            boxed_processes(&api, "Work").status(),
            StatusCode::GetBoxedPidsError
        );
    }

    #[test]
    fn test_resolve_dos_path() {
        let api = MemorySbieApi::new();
        api.map_dos_device("D:", r"\Device\HarddiskVolume5");
        assert_eq!(
            resolve_dos_path(&api, r"\Device\HarddiskVolume5\Sandbox\Work").as_deref(),
            Some(r"D:\Sandbox\Work")
        );
        assert_eq!(
            resolve_dos_path(&api, r"\Device\HarddiskVolume3").as_deref(),
            Some(r"C:\")
        );
        assert_eq!(resolve_dos_path(&api, r"\Device\Unmapped\x"), None);
        assert_eq!(resolve_dos_path(&api, "relative"), None);
    }

    #[test]
    fn test_list_boxes() {
        let api = MemorySbieApi::new();
        api.update_conf('a', "", "DefaultBox", "Enabled", "y").unwrap();
        api.update_conf('a', "", "GlobalSettings", "FileRootPath", "x").unwrap();
        api.update_conf('a', "", "Work", "Enabled", "y").unwrap();
        assert_eq!(
            list_boxes(&api).into_data().unwrap(),
            vec!["DefaultBox", "Work"]
        );
    }
}

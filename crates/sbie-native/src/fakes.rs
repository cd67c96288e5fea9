//! In-memory fake of the native control interface (testing only)
//!
//! `MemorySbieApi` keeps configuration sections in insertion order and
//! implements the update-conf operation codes (`s`, `a`, `i`, `d`), the
//! wildcard section delete, occurrence indices and the query option flags
//! (global fallthrough, template inheritance, `%SANDBOX%` expansion). Failures
//! can be scripted per call so callers can exercise every error path.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use crate::api::{
    BoxPaths, HomePath, ProcessInfo, SbieApi, STATUS_INVALID_PARAMETER,
    STATUS_OBJECT_NAME_NOT_FOUND, STATUS_RESOURCE_NAME_NOT_FOUND, STATUS_WRONG_PASSWORD,
};
use crate::error::{NativeError, NativeResult};

const GLOBAL_SECTION: &str = "GlobalSettings";
const TEMPLATE_PREFIX: &str = "Template_";
const FLAG_SKIP_GLOBAL: u32 = 0x4000_0000;
const FLAG_SKIP_EXPANSION: u32 = 0x2000_0000;
const FLAG_IGNORE_TEMPLATES: u32 = 0x1000_0000;
const INDEX_MASK: u32 = 0x0FFF_FFFF;
const FIRST_PID: u32 = 4100;

#[derive(Debug, Clone)]
struct Section {
    name: String,
    entries: Vec<(String, String)>,
}

impl Section {
    fn values(&self, key: &str) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.clone())
            .collect()
    }
}

#[derive(Debug, Clone)]
struct FakeProcess {
    box_name: String,
    image_name: String,
    session_id: u32,
}

#[derive(Debug)]
struct FakeState {
    sections: Vec<Section>,
    processes: BTreeMap<u32, FakeProcess>,
    next_pid: u32,
    password: Option<String>,
    home: HomePath,
    box_root_nt: String,
    dos_devices: BTreeMap<String, String>,
    failing_keys: BTreeSet<String>,
    fail_all_updates: bool,
    fail_reload: bool,
    fail_process_enum: bool,
    fail_box_path: bool,
    fail_run: bool,
    fail_kill: bool,
    start_service_result: bool,
    calls: BTreeMap<&'static str, usize>,
}

impl Default for FakeState {
    fn default() -> Self {
        let mut dos_devices = BTreeMap::new();
        dos_devices.insert("C:".to_string(), r"\Device\HarddiskVolume3".to_string());
        FakeState {
            sections: Vec::new(),
            processes: BTreeMap::new(),
            next_pid: FIRST_PID,
            password: None,
            home: HomePath {
                nt: r"\Device\HarddiskVolume3\Sandboxie-Plus".to_string(),
                dos: r"C:\Sandboxie-Plus".to_string(),
            },
            box_root_nt: r"\Device\HarddiskVolume3\Sandbox\%SANDBOX%".to_string(),
            dos_devices,
            failing_keys: BTreeSet::new(),
            fail_all_updates: false,
            fail_reload: false,
            fail_process_enum: false,
            fail_box_path: false,
            fail_run: false,
            fail_kill: false,
            start_service_result: true,
            calls: BTreeMap::new(),
        }
    }
}

impl FakeState {
    fn section(&self, name: &str) -> Option<&Section> {
        self.sections
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))
    }

    fn section_mut(&mut self, name: &str) -> &mut Section {
        let pos = self
            .sections
            .iter()
            .position(|s| s.name.eq_ignore_ascii_case(name));
        match pos {
            Some(pos) => &mut self.sections[pos],
            None => {
                self.sections.push(Section {
                    name: name.to_string(),
                    entries: Vec::new(),
                });
                let last = self.sections.len() - 1;
                &mut self.sections[last]
            }
        }
    }

    fn remove_section(&mut self, name: &str) {
        self.sections.retain(|s| !s.name.eq_ignore_ascii_case(name));
    }

    fn lookup(&self, section: &str, setting: &str, flags: u32) -> Vec<String> {
        let own = self
            .section(section)
            .map(|s| s.values(setting))
            .unwrap_or_default();
        if !own.is_empty() {
            return own;
        }

        if flags & FLAG_IGNORE_TEMPLATES == 0 {
            if let Some(s) = self.section(section) {
                for template in s.values("Template") {
                    let inherited = self
                        .section(&format!("{TEMPLATE_PREFIX}{template}"))
                        .map(|t| t.values(setting))
                        .unwrap_or_default();
                    if !inherited.is_empty() {
                        return inherited;
                    }
                }
            }
        }

        if flags & FLAG_SKIP_GLOBAL == 0 && !section.eq_ignore_ascii_case(GLOBAL_SECTION) {
            return self
                .section(GLOBAL_SECTION)
                .map(|s| s.values(setting))
                .unwrap_or_default();
        }

        Vec::new()
    }

    fn box_names(&self) -> Vec<String> {
        self.sections
            .iter()
            .filter(|s| {
                !s.name.eq_ignore_ascii_case(GLOBAL_SECTION)
                    && !s.name.starts_with(TEMPLATE_PREFIX)
                    && !s.name.starts_with("UserSettings_")
            })
            .map(|s| s.name.clone())
            .collect()
    }
}

/// In-memory `SbieApi`.
#[derive(Debug, Default)]
pub struct MemorySbieApi {
    state: Mutex<FakeState>,
}

impl MemorySbieApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn record(&self, call: &'static str) -> MutexGuard<'_, FakeState> {
        let mut state = self.lock();
        *state.calls.entry(call).or_insert(0) += 1;
        state
    }

    /// Number of times the named native call was made.
    pub fn call_count(&self, call: &str) -> usize {
        self.lock().calls.get(call).copied().unwrap_or(0)
    }

    /// Raw stored values of `key` in `section`, in file order.
    pub fn stored_values(&self, section: &str, key: &str) -> Vec<String> {
        self.lock()
            .section(section)
            .map(|s| s.values(key))
            .unwrap_or_default()
    }

    /// Whether the section exists at all.
    pub fn has_section(&self, section: &str) -> bool {
        self.lock().section(section).is_some()
    }

    /// Number of stored entries in `section`.
    pub fn entry_count(&self, section: &str) -> usize {
        self.lock()
            .section(section)
            .map(|s| s.entries.len())
            .unwrap_or(0)
    }

    /// Require `password` for every update.
    pub fn set_password(&self, password: &str) {
        self.lock().password = Some(password.to_string());
    }

    /// Make every update touching `key` fail.
    pub fn fail_updates_for(&self, key: &str) {
        self.lock().failing_keys.insert(key.to_ascii_lowercase());
    }

    pub fn fail_all_updates(&self, fail: bool) {
        self.lock().fail_all_updates = fail;
    }

    pub fn fail_reload(&self, fail: bool) {
        self.lock().fail_reload = fail;
    }

    pub fn fail_process_enum(&self, fail: bool) {
        self.lock().fail_process_enum = fail;
    }

    pub fn fail_box_path(&self, fail: bool) {
        self.lock().fail_box_path = fail;
    }

    pub fn fail_run(&self, fail: bool) {
        self.lock().fail_run = fail;
    }

    pub fn fail_kill(&self, fail: bool) {
        self.lock().fail_kill = fail;
    }

    /// Value returned by `start_service`.
    pub fn set_start_service_result(&self, result: bool) {
        self.lock().start_service_result = result;
    }

    /// Map a drive (e.g. `D:`) to an NT device path.
    pub fn map_dos_device(&self, drive: &str, device: &str) {
        self.lock()
            .dos_devices
            .insert(drive.to_ascii_uppercase(), device.to_string());
    }

    /// NT file root of boxes; `%SANDBOX%` is replaced by the box name.
    pub fn set_box_root(&self, nt_template: &str) {
        self.lock().box_root_nt = nt_template.to_string();
    }

    /// Place a process inside `box_name` and return its PID.
    pub fn spawn_in_box(&self, box_name: &str, image_name: &str) -> u32 {
        let mut state = self.lock();
        let pid = state.next_pid;
        state.next_pid += 4;
        state.processes.insert(
            pid,
            FakeProcess {
                box_name: box_name.to_string(),
                image_name: image_name.to_string(),
                session_id: 1,
            },
        );
        pid
    }

    fn pids_in(state: &FakeState, box_name: &str, all_sessions: bool, session: u32) -> Vec<u32> {
        state
            .processes
            .iter()
            .filter(|(_, p)| p.box_name.eq_ignore_ascii_case(box_name))
            .filter(|(_, p)| all_sessions || session == u32::MAX || p.session_id == session)
            .map(|(pid, _)| *pid)
            .collect()
    }
}

impl SbieApi for MemorySbieApi {
    fn start_service(&self, _retry: bool) -> NativeResult<bool> {
        Ok(self.record("start_service").start_service_result)
    }

    fn enum_boxes(&self, index: i32) -> NativeResult<Option<(i32, String)>> {
        let state = self.record("enum_boxes");
        let next = index.saturating_add(1).max(0);
        Ok(state
            .box_names()
            .get(next as usize)
            .map(|name| (next, name.clone())))
    }

    fn query_box_path(&self, box_name: &str) -> NativeResult<BoxPaths> {
        let state = self.record("query_box_path");
        if state.fail_box_path {
            return Err(NativeError::Status {
                call: "SbieApi_QueryBoxPath",
                code: STATUS_OBJECT_NAME_NOT_FOUND,
            });
        }
        Ok(BoxPaths {
            file: state.box_root_nt.replace("%SANDBOX%", box_name),
            key: format!(r"\REGISTRY\USER\Sandbox_{box_name}"),
            ipc: format!(r"\Sandbox\{box_name}\Session_1"),
        })
    }

    fn query_process_path(&self, pid: u32) -> NativeResult<BoxPaths> {
        let state = self.record("query_process_path");
        let process = state.processes.get(&pid).ok_or(NativeError::Status {
            call: "SbieApi_QueryProcessPath",
            code: STATUS_OBJECT_NAME_NOT_FOUND,
        })?;
        Ok(BoxPaths {
            file: state.box_root_nt.replace("%SANDBOX%", &process.box_name),
            key: format!(r"\REGISTRY\USER\Sandbox_{}", process.box_name),
            ipc: format!(r"\Sandbox\{}\Session_{}", process.box_name, process.session_id),
        })
    }

    fn count_processes(
        &self,
        box_name: &str,
        all_sessions: bool,
        session: u32,
    ) -> NativeResult<u32> {
        let state = self.record("count_processes");
        if state.fail_process_enum {
            return Err(NativeError::Status {
                call: "SbieApi_EnumProcessEx",
                code: STATUS_INVALID_PARAMETER,
            });
        }
        Ok(Self::pids_in(&state, box_name, all_sessions, session).len() as u32)
    }

    fn enum_processes(
        &self,
        box_name: &str,
        all_sessions: bool,
        session: u32,
        capacity: u32,
    ) -> NativeResult<Vec<u32>> {
        let state = self.record("enum_processes");
        if state.fail_process_enum {
            return Err(NativeError::Status {
                call: "SbieApi_EnumProcessEx",
                code: STATUS_INVALID_PARAMETER,
            });
        }
        let mut buffer = vec![0u32; capacity as usize];
        for (slot, pid) in buffer
            .iter_mut()
            .zip(Self::pids_in(&state, box_name, all_sessions, session))
        {
            *slot = pid;
        }
        Ok(buffer)
    }

    fn query_process(&self, pid: u32) -> NativeResult<ProcessInfo> {
        let state = self.record("query_process");
        let process = state.processes.get(&pid).ok_or(NativeError::Status {
            call: "SbieApi_QueryProcess",
            code: STATUS_OBJECT_NAME_NOT_FOUND,
        })?;
        Ok(ProcessInfo {
            box_name: process.box_name.clone(),
            image_name: process.image_name.clone(),
            sid: "S-1-5-21-1000".to_string(),
            session_id: process.session_id,
        })
    }

    fn query_conf(&self, section: &str, setting: &str, index_word: u32) -> NativeResult<String> {
        let state = self.record("query_conf");
        let index = (index_word & INDEX_MASK) as usize;
        let values = state.lookup(section, setting, index_word);
        let value = values.get(index).ok_or(NativeError::Status {
            call: "SbieApi_QueryConf",
            code: STATUS_RESOURCE_NAME_NOT_FOUND,
        })?;
        if index_word & FLAG_SKIP_EXPANSION == 0 {
            Ok(value.replace("%SANDBOX%", section))
        } else {
            Ok(value.clone())
        }
    }

    fn update_conf(
        &self,
        operation: char,
        password: &str,
        section: &str,
        setting: &str,
        value: &str,
    ) -> NativeResult<()> {
        let mut state = self.record("update_conf");
        let fail = |code| NativeError::Status {
            call: "SbieDll_UpdateConf",
            code,
        };

        if let Some(expected) = &state.password {
            if expected != password {
                return Err(fail(STATUS_WRONG_PASSWORD));
            }
        }
        if state.fail_all_updates || state.failing_keys.contains(&setting.to_ascii_lowercase()) {
            return Err(fail(STATUS_INVALID_PARAMETER));
        }

        if setting == "*" {
            return match (operation, value.is_empty()) {
                ('s', true) => {
                    state.remove_section(section);
                    Ok(())
                }
                _ => Err(fail(STATUS_INVALID_PARAMETER)),
            };
        }

        let matches = |k: &String| k.eq_ignore_ascii_case(setting);
        match operation {
            's' => {
                let entries = &mut state.section_mut(section).entries;
                let first = entries.iter().position(|(k, _)| matches(k));
                entries.retain(|(k, _)| !matches(k));
                if !value.is_empty() {
                    let at = first.unwrap_or(entries.len()).min(entries.len());
                    entries.insert(at, (setting.to_string(), value.to_string()));
                }
            }
            'a' => {
                let entries = &mut state.section_mut(section).entries;
                let at = entries
                    .iter()
                    .rposition(|(k, _)| matches(k))
                    .map(|p| p + 1)
                    .unwrap_or(entries.len());
                entries.insert(at, (setting.to_string(), value.to_string()));
            }
            'i' => {
                let entries = &mut state.section_mut(section).entries;
                let at = entries.iter().position(|(k, _)| matches(k)).unwrap_or(0);
                entries.insert(at, (setting.to_string(), value.to_string()));
            }
            'd' => {
                let entries = &mut state.section_mut(section).entries;
                entries.retain(|(k, v)| !(matches(k) && v == value));
            }
            _ => return Err(fail(STATUS_INVALID_PARAMETER)),
        }
        Ok(())
    }

    fn reload_conf(&self, _session_id: u32) -> NativeResult<()> {
        let state = self.record("reload_conf");
        if state.fail_reload {
            return Err(NativeError::Status {
                call: "SbieApi_ReloadConf",
                code: STATUS_INVALID_PARAMETER,
            });
        }
        Ok(())
    }

    fn get_home_path(&self) -> NativeResult<HomePath> {
        Ok(self.record("get_home_path").home.clone())
    }

    fn run_sandboxed(
        &self,
        box_name: &str,
        command: &str,
        _directory: &str,
        _creation_flags: u32,
    ) -> NativeResult<u32> {
        if self.record("run_sandboxed").fail_run {
            return Err(NativeError::Failed {
                call: "SbieDll_RunSandboxed",
            });
        }
        let image = command
            .rsplit(['\\', '/'])
            .next()
            .unwrap_or(command)
            .to_string();
        Ok(self.spawn_in_box(box_name, &image))
    }

    fn kill_one(&self, pid: u32) -> NativeResult<bool> {
        let mut state = self.record("kill_one");
        if state.fail_kill {
            return Ok(false);
        }
        Ok(state.processes.remove(&pid).is_some())
    }

    fn kill_all(&self, _session_id: u32, box_name: &str) -> NativeResult<bool> {
        let mut state = self.record("kill_all");
        if state.fail_kill {
            return Ok(false);
        }
        state
            .processes
            .retain(|_, p| !p.box_name.eq_ignore_ascii_case(box_name));
        Ok(true)
    }

    fn query_dos_device(&self, drive: &str) -> NativeResult<String> {
        let state = self.record("query_dos_device");
        state
            .dos_devices
            .get(&drive.to_ascii_uppercase())
            .cloned()
            .ok_or(NativeError::Failed {
                call: "QueryDosDeviceW",
            })
    }
}

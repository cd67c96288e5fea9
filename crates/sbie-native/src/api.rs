//! The `SbieApi` trait: typed surface of the SbieDll function table
//!
//! Every method maps to exactly one exported function. String outputs use
//! fixed-capacity buffers on the native side; implementations hide that and
//! hand back owned `String`s. A zero return code means success, anything else
//! is surfaced as [`NativeError::Status`].

use crate::error::NativeResult;

/// Session selector meaning "all sessions" for process enumeration
pub const ALL_SESSIONS: u32 = u32::MAX;

/// Session id meaning "current logon session" (`-1` on the wire)
pub const CURRENT_SESSION: u32 = u32::MAX;

/// Capacity (in UTF-16 units) of a configuration value buffer
pub const CONF_VALUE_CAPACITY: usize = 1024;

/// Capacity (in UTF-16 units) of a box name buffer
pub const BOX_NAME_CAPACITY: usize = 34;

/// Returned by query-conf when the setting does not exist
pub const STATUS_RESOURCE_NAME_NOT_FOUND: u32 = 0xC000_008B;

/// Returned when a box or process is unknown to the driver
pub const STATUS_OBJECT_NAME_NOT_FOUND: u32 = 0xC000_0034;

/// Returned for malformed arguments (e.g. an unknown edit operation)
pub const STATUS_INVALID_PARAMETER: u32 = 0xC000_000D;

/// Returned by update-conf when the configuration password does not match
pub const STATUS_WRONG_PASSWORD: u32 = 0xC000_006A;

/// Filesystem, registry and IPC roots of a box or a boxed process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoxPaths {
    /// NT path of the file root (e.g. `\Device\HarddiskVolume3\Sandbox\DefaultBox`)
    pub file: String,
    /// Registry root
    pub key: String,
    /// IPC object root
    pub ipc: String,
}

/// Identity of a process running inside a box
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessInfo {
    pub box_name: String,
    pub image_name: String,
    pub sid: String,
    pub session_id: u32,
}

/// Installation directory of the product in both notations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HomePath {
    pub nt: String,
    pub dos: String,
}

/// Typed call surface of the native control interface.
///
/// Implementations must be safe to share between threads, but callers are
/// expected to serialise mutating operations themselves: the underlying
/// configuration store is not transactional.
pub trait SbieApi: Send + Sync {
    /// `SbieDll_StartSbieSvc`: ask the service control manager to start the service.
    fn start_service(&self, retry: bool) -> NativeResult<bool>;

    /// `SbieApi_EnumBoxes`: starting from `index` (use `-1` for the first call),
    /// return the next index and box name, or `None` when exhausted.
    fn enum_boxes(&self, index: i32) -> NativeResult<Option<(i32, String)>>;

    /// `SbieApi_QueryBoxPath`
    fn query_box_path(&self, box_name: &str) -> NativeResult<BoxPaths>;

    /// `SbieApi_QueryProcessPath`
    fn query_process_path(&self, pid: u32) -> NativeResult<BoxPaths>;

    /// `SbieApi_EnumProcessEx` with a null buffer: number of boxed processes.
    fn count_processes(&self, box_name: &str, all_sessions: bool, session: u32)
        -> NativeResult<u32>;

    /// `SbieApi_EnumProcessEx` with a buffer of `capacity` PIDs.
    ///
    /// Unused slots come back as zero; callers filter them.
    fn enum_processes(
        &self,
        box_name: &str,
        all_sessions: bool,
        session: u32,
        capacity: u32,
    ) -> NativeResult<Vec<u32>>;

    /// `SbieApi_QueryProcess`
    fn query_process(&self, pid: u32) -> NativeResult<ProcessInfo>;

    /// `SbieApi_QueryConf`. `index_word` is the occurrence index OR'ed with
    /// query option flags, exactly as the native call expects it.
    fn query_conf(&self, section: &str, setting: &str, index_word: u32) -> NativeResult<String>;

    /// `SbieDll_UpdateConf`. `operation` is the single-character edit code.
    fn update_conf(
        &self,
        operation: char,
        password: &str,
        section: &str,
        setting: &str,
        value: &str,
    ) -> NativeResult<()>;

    /// `SbieApi_ReloadConf`
    fn reload_conf(&self, session_id: u32) -> NativeResult<()>;

    /// `SbieApi_GetHomePath`
    fn get_home_path(&self) -> NativeResult<HomePath>;

    /// `SbieDll_RunSandboxed`: start `command` inside `box_name`, return its PID.
    fn run_sandboxed(
        &self,
        box_name: &str,
        command: &str,
        directory: &str,
        creation_flags: u32,
    ) -> NativeResult<u32>;

    /// `SbieDll_KillOne`
    fn kill_one(&self, pid: u32) -> NativeResult<bool>;

    /// `SbieDll_KillAll`
    fn kill_all(&self, session_id: u32, box_name: &str) -> NativeResult<bool>;

    /// `QueryDosDeviceW` (kernel32): NT device behind a drive such as `C:`.
    fn query_dos_device(&self, drive: &str) -> NativeResult<String>;
}

/// Decode a NUL-terminated UTF-16 buffer.
pub fn wide_to_string(buffer: &[u16]) -> String {
    let end = buffer.iter().position(|&c| c == 0).unwrap_or(buffer.len());
    String::from_utf16_lossy(&buffer[..end])
}

//! Dynamic binding of `SbieDll.dll`
//!
//! The function table is resolved by symbol name the first time any call is
//! made and then cached for the lifetime of the [`DynamicSbieApi`]. A failed
//! load is not cached, so the same instance starts working once the product
//! has been installed.

pub use imp::DynamicSbieApi;

/// Encode a Rust string as a NUL-terminated UTF-16 buffer.
#[cfg_attr(not(windows), allow(dead_code))]
fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

#[cfg(windows)]
mod imp {
    use std::path::{Path, PathBuf};
    use std::ptr::{null_mut, null};
    use std::sync::{Arc, Mutex};

    use libloading::Library;
    use tracing::debug;

    use super::to_wide;
    use crate::api::{
        wide_to_string, BoxPaths, HomePath, ProcessInfo, SbieApi, BOX_NAME_CAPACITY,
        CONF_VALUE_CAPACITY,
    };
    use crate::error::{NativeError, NativeResult};

    const PATH_CAPACITY: usize = 1024;
    const IMAGE_NAME_CAPACITY: usize = 96;
    const SID_CAPACITY: usize = 96;
    const DEVICE_CAPACITY: usize = 260;

    type StartSbieSvcFn = unsafe extern "system" fn(retry: i32) -> i32;
    type EnumBoxesFn = unsafe extern "system" fn(index: i32, box_name: *mut u16) -> i32;
    type QueryPathFn<Id> = unsafe extern "system" fn(
        id: Id,
        file_path: *mut u16,
        key_path: *mut u16,
        ipc_path: *mut u16,
        file_path_len: *mut u32,
        key_path_len: *mut u32,
        ipc_path_len: *mut u32,
    ) -> i32;
    type EnumProcessExFn = unsafe extern "system" fn(
        box_name: *const u16,
        all_sessions: u8,
        which_session: u32,
        boxed_pids: *mut u32,
        boxed_count: *mut u32,
    ) -> i32;
    type QueryProcessFn = unsafe extern "system" fn(
        pid: usize,
        box_name: *mut u16,
        image_name: *mut u16,
        sid: *mut u16,
        session_id: *mut u32,
    ) -> i32;
    type QueryConfFn = unsafe extern "system" fn(
        section: *const u16,
        setting: *const u16,
        index: u32,
        value: *mut u16,
        value_len: u32,
    ) -> i32;
    type UpdateConfFn = unsafe extern "system" fn(
        operation: u16,
        password: *const u16,
        section: *const u16,
        setting: *const u16,
        value: *const u16,
    ) -> i32;
    type ReloadConfFn = unsafe extern "system" fn(session_id: u32) -> i32;
    type GetHomePathFn =
        unsafe extern "system" fn(nt: *mut u16, nt_max: u32, dos: *mut u16, dos_max: u32) -> i32;
    type RunSandboxedFn = unsafe extern "system" fn(
        box_name: *const u16,
        cmd: *const u16,
        dir: *const u16,
        creation_flags: u32,
        startup_info: *mut StartupInfoW,
        process_info: *mut ProcessInformation,
    ) -> i32;
    type KillOneFn = unsafe extern "system" fn(pid: u32) -> i32;
    type KillAllFn = unsafe extern "system" fn(session_id: u32, box_name: *const u16) -> i32;
    type QueryDosDeviceFn =
        unsafe extern "system" fn(device: *const u16, target: *mut u16, max: u32) -> u32;
    type CloseHandleFn = unsafe extern "system" fn(handle: isize) -> i32;

    #[repr(C)]
    struct StartupInfoW {
        cb: u32,
        reserved: *mut u16,
        desktop: *mut u16,
        title: *mut u16,
        x: u32,
        y: u32,
        x_size: u32,
        y_size: u32,
        x_count_chars: u32,
        y_count_chars: u32,
        fill_attribute: u32,
        flags: u32,
        show_window: u16,
        cb_reserved2: u16,
        reserved2: *mut u8,
        std_input: isize,
        std_output: isize,
        std_error: isize,
    }

    impl StartupInfoW {
        fn new() -> Self {
            StartupInfoW {
                cb: std::mem::size_of::<StartupInfoW>() as u32,
                reserved: null_mut(),
                desktop: null_mut(),
                title: null_mut(),
                x: 0,
                y: 0,
                x_size: 0,
                y_size: 0,
                x_count_chars: 0,
                y_count_chars: 0,
                fill_attribute: 0,
                flags: 0,
                show_window: 0,
                cb_reserved2: 0,
                reserved2: null_mut(),
                std_input: 0,
                std_output: 0,
                std_error: 0,
            }
        }
    }

    #[repr(C)]
    #[derive(Default)]
    struct ProcessInformation {
        process: isize,
        thread: isize,
        process_id: u32,
        thread_id: u32,
    }

    /// Resolved exports. The libraries are kept alive alongside the pointers.
    struct FunctionTable {
        start_sbie_svc: StartSbieSvcFn,
        enum_boxes: EnumBoxesFn,
        query_box_path: QueryPathFn<*const u16>,
        query_process_path: QueryPathFn<usize>,
        enum_process_ex: EnumProcessExFn,
        query_process: QueryProcessFn,
        query_conf: QueryConfFn,
        update_conf: UpdateConfFn,
        reload_conf: ReloadConfFn,
        get_home_path: GetHomePathFn,
        run_sandboxed: RunSandboxedFn,
        kill_one: KillOneFn,
        kill_all: KillAllFn,
        query_dos_device: QueryDosDeviceFn,
        close_handle: CloseHandleFn,
        _sbie: Library,
        _kernel32: Library,
    }

    fn resolve<T: Copy>(library: &Library, symbol: &'static str) -> NativeResult<T> {
        let name = format!("{symbol}\0");
        // SAFETY: every `T` used with this helper is the documented signature
        // of the named export.
        unsafe { library.get::<T>(name.as_bytes()) }
            .map(|s| *s)
            .map_err(|e| NativeError::Symbol {
                symbol,
                reason: e.to_string(),
            })
    }

    impl FunctionTable {
        fn load(path: &Path) -> NativeResult<Self> {
            let load = |p: &Path| {
                // SAFETY: loading runs the library's DllMain; both libraries are
                // system/product components with no unusual initialisers.
                unsafe { Library::new(p) }.map_err(|e| NativeError::Load {
                    path: p.display().to_string(),
                    reason: e.to_string(),
                })
            };
            let sbie = load(path)?;
            let kernel32 = load(Path::new("kernel32.dll"))?;

            Ok(FunctionTable {
                start_sbie_svc: resolve(&sbie, "SbieDll_StartSbieSvc")?,
                enum_boxes: resolve(&sbie, "SbieApi_EnumBoxes")?,
                query_box_path: resolve(&sbie, "SbieApi_QueryBoxPath")?,
                query_process_path: resolve(&sbie, "SbieApi_QueryProcessPath")?,
                enum_process_ex: resolve(&sbie, "SbieApi_EnumProcessEx")?,
                query_process: resolve(&sbie, "SbieApi_QueryProcess")?,
                query_conf: resolve(&sbie, "SbieApi_QueryConf")?,
                update_conf: resolve(&sbie, "SbieDll_UpdateConf")?,
                reload_conf: resolve(&sbie, "SbieApi_ReloadConf")?,
                get_home_path: resolve(&sbie, "SbieApi_GetHomePath")?,
                run_sandboxed: resolve(&sbie, "SbieDll_RunSandboxed")?,
                kill_one: resolve(&sbie, "SbieDll_KillOne")?,
                kill_all: resolve(&sbie, "SbieDll_KillAll")?,
                query_dos_device: resolve(&kernel32, "QueryDosDeviceW")?,
                close_handle: resolve(&kernel32, "CloseHandle")?,
                _sbie: sbie,
                _kernel32: kernel32,
            })
        }
    }

    fn check(call: &'static str, code: i32) -> NativeResult<()> {
        if code == 0 {
            Ok(())
        } else {
            Err(NativeError::Status {
                call,
                code: code as u32,
            })
        }
    }

    fn byte_len(buffer: &[u16]) -> u32 {
        (buffer.len() * 2) as u32
    }

    /// `SbieApi` implementation backed by the real shared library.
    pub struct DynamicSbieApi {
        path: PathBuf,
        table: Mutex<Option<Arc<FunctionTable>>>,
    }

    impl DynamicSbieApi {
        /// Bind to the library at `path`. Nothing is loaded until the first call.
        pub fn new(path: impl Into<PathBuf>) -> Self {
            DynamicSbieApi {
                path: path.into(),
                table: Mutex::new(None),
            }
        }

        pub fn path(&self) -> &Path {
            &self.path
        }

        fn table(&self) -> NativeResult<Arc<FunctionTable>> {
            let mut slot = self.table.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(table) = slot.as_ref() {
                return Ok(Arc::clone(table));
            }
            let table = Arc::new(FunctionTable::load(&self.path)?);
            debug!(path = %self.path.display(), "loaded native control interface");
            *slot = Some(Arc::clone(&table));
            Ok(table)
        }

        fn query_path<Id: Copy>(
            call: &'static str,
            f: QueryPathFn<Id>,
            id: Id,
        ) -> NativeResult<BoxPaths> {
            let mut file = vec![0u16; PATH_CAPACITY];
            let mut key = vec![0u16; PATH_CAPACITY];
            let mut ipc = vec![0u16; PATH_CAPACITY];
            let (mut file_len, mut key_len, mut ipc_len) =
                (byte_len(&file), byte_len(&key), byte_len(&ipc));
            // SAFETY: buffers are live for the call and their byte lengths are passed.
            let code = unsafe {
                f(
                    id,
                    file.as_mut_ptr(),
                    key.as_mut_ptr(),
                    ipc.as_mut_ptr(),
                    &mut file_len,
                    &mut key_len,
                    &mut ipc_len,
                )
            };
            check(call, code)?;
            Ok(BoxPaths {
                file: wide_to_string(&file),
                key: wide_to_string(&key),
                ipc: wide_to_string(&ipc),
            })
        }
    }

    impl SbieApi for DynamicSbieApi {
        fn start_service(&self, retry: bool) -> NativeResult<bool> {
            let t = self.table()?;
            // SAFETY: plain value argument.
            Ok(unsafe { (t.start_sbie_svc)(retry as i32) } != 0)
        }

        fn enum_boxes(&self, index: i32) -> NativeResult<Option<(i32, String)>> {
            let t = self.table()?;
            let mut name = vec![0u16; BOX_NAME_CAPACITY];
            // SAFETY: `name` holds BOX_NAME_CAPACITY units as the API requires.
            let next = unsafe { (t.enum_boxes)(index, name.as_mut_ptr()) };
            if next < 0 {
                return Ok(None);
            }
            Ok(Some((next, wide_to_string(&name))))
        }

        fn query_box_path(&self, box_name: &str) -> NativeResult<BoxPaths> {
            let t = self.table()?;
            let name = to_wide(box_name);
            Self::query_path("SbieApi_QueryBoxPath", t.query_box_path, name.as_ptr())
        }

        fn query_process_path(&self, pid: u32) -> NativeResult<BoxPaths> {
            let t = self.table()?;
            Self::query_path("SbieApi_QueryProcessPath", t.query_process_path, pid as usize)
        }

        fn count_processes(
            &self,
            box_name: &str,
            all_sessions: bool,
            session: u32,
        ) -> NativeResult<u32> {
            let t = self.table()?;
            let name = to_wide(box_name);
            let mut count = 0u32;
            // SAFETY: a null PID buffer asks only for the count.
            let code = unsafe {
                (t.enum_process_ex)(
                    name.as_ptr(),
                    all_sessions as u8,
                    session,
                    null_mut(),
                    &mut count,
                )
            };
            check("SbieApi_EnumProcessEx", code)?;
            Ok(count)
        }

        fn enum_processes(
            &self,
            box_name: &str,
            all_sessions: bool,
            session: u32,
            capacity: u32,
        ) -> NativeResult<Vec<u32>> {
            let t = self.table()?;
            let name = to_wide(box_name);
            let mut pids = vec![0u32; capacity as usize];
            let mut count = capacity;
            // SAFETY: `pids` holds `capacity` slots and `count` says so.
            let code = unsafe {
                (t.enum_process_ex)(
                    name.as_ptr(),
                    all_sessions as u8,
                    session,
                    pids.as_mut_ptr(),
                    &mut count,
                )
            };
            check("SbieApi_EnumProcessEx", code)?;
            Ok(pids)
        }

        fn query_process(&self, pid: u32) -> NativeResult<ProcessInfo> {
            let t = self.table()?;
            let mut box_name = vec![0u16; BOX_NAME_CAPACITY];
            let mut image = vec![0u16; IMAGE_NAME_CAPACITY];
            let mut sid = vec![0u16; SID_CAPACITY];
            let mut session_id = 0u32;
            // SAFETY: buffer sizes match the documented fixed capacities.
            let code = unsafe {
                (t.query_process)(
                    pid as usize,
                    box_name.as_mut_ptr(),
                    image.as_mut_ptr(),
                    sid.as_mut_ptr(),
                    &mut session_id,
                )
            };
            check("SbieApi_QueryProcess", code)?;
            Ok(ProcessInfo {
                box_name: wide_to_string(&box_name),
                image_name: wide_to_string(&image),
                sid: wide_to_string(&sid),
                session_id,
            })
        }

        fn query_conf(
            &self,
            section: &str,
            setting: &str,
            index_word: u32,
        ) -> NativeResult<String> {
            let t = self.table()?;
            let section = to_wide(section);
            let setting = to_wide(setting);
            let mut value = vec![0u16; CONF_VALUE_CAPACITY];
            // SAFETY: value buffer length is passed in bytes.
            let code = unsafe {
                (t.query_conf)(
                    section.as_ptr(),
                    setting.as_ptr(),
                    index_word,
                    value.as_mut_ptr(),
                    byte_len(&value),
                )
            };
            check("SbieApi_QueryConf", code)?;
            Ok(wide_to_string(&value))
        }

        fn update_conf(
            &self,
            operation: char,
            password: &str,
            section: &str,
            setting: &str,
            value: &str,
        ) -> NativeResult<()> {
            let t = self.table()?;
            let password = to_wide(password);
            let section = to_wide(section);
            let setting = to_wide(setting);
            let value = to_wide(value);
            // SAFETY: all strings are NUL-terminated and outlive the call.
            let code = unsafe {
                (t.update_conf)(
                    operation as u16,
                    password.as_ptr(),
                    section.as_ptr(),
                    setting.as_ptr(),
                    value.as_ptr(),
                )
            };
            check("SbieDll_UpdateConf", code)
        }

        fn reload_conf(&self, session_id: u32) -> NativeResult<()> {
            let t = self.table()?;
            // SAFETY: plain value argument.
            check("SbieApi_ReloadConf", unsafe { (t.reload_conf)(session_id) })
        }

        fn get_home_path(&self) -> NativeResult<HomePath> {
            let t = self.table()?;
            let mut nt = vec![0u16; PATH_CAPACITY];
            let mut dos = vec![0u16; PATH_CAPACITY];
            // SAFETY: capacities are passed in UTF-16 units.
            let code = unsafe {
                (t.get_home_path)(
                    nt.as_mut_ptr(),
                    PATH_CAPACITY as u32,
                    dos.as_mut_ptr(),
                    PATH_CAPACITY as u32,
                )
            };
            check("SbieApi_GetHomePath", code)?;
            Ok(HomePath {
                nt: wide_to_string(&nt),
                dos: wide_to_string(&dos),
            })
        }

        fn run_sandboxed(
            &self,
            box_name: &str,
            command: &str,
            directory: &str,
            creation_flags: u32,
        ) -> NativeResult<u32> {
            let t = self.table()?;
            let box_name = to_wide(box_name);
            let command = to_wide(command);
            let directory = to_wide(directory);
            let mut startup = StartupInfoW::new();
            let mut info = ProcessInformation::default();
            // SAFETY: structs are repr(C) and initialised; strings are terminated.
            let ok = unsafe {
                (t.run_sandboxed)(
                    box_name.as_ptr(),
                    command.as_ptr(),
                    directory.as_ptr(),
                    creation_flags,
                    &mut startup,
                    &mut info,
                )
            };
            if ok == 0 {
                return Err(NativeError::Failed {
                    call: "SbieDll_RunSandboxed",
                });
            }
            // SAFETY: both handles were returned open by the call above.
            unsafe {
                (t.close_handle)(info.thread);
                (t.close_handle)(info.process);
            }
            Ok(info.process_id)
        }

        fn kill_one(&self, pid: u32) -> NativeResult<bool> {
            let t = self.table()?;
            // SAFETY: plain value argument.
            Ok(unsafe { (t.kill_one)(pid) } != 0)
        }

        fn kill_all(&self, session_id: u32, box_name: &str) -> NativeResult<bool> {
            let t = self.table()?;
            let box_name = to_wide(box_name);
            // SAFETY: terminated string outlives the call.
            Ok(unsafe { (t.kill_all)(session_id, box_name.as_ptr()) } != 0)
        }

        fn query_dos_device(&self, drive: &str) -> NativeResult<String> {
            let t = self.table()?;
            let device = if drive.is_empty() { None } else { Some(to_wide(drive)) };
            let mut target = vec![0u16; DEVICE_CAPACITY];
            // SAFETY: capacity is passed in UTF-16 units.
            let written = unsafe {
                (t.query_dos_device)(
                    device.as_ref().map_or(null(), |d| d.as_ptr()),
                    target.as_mut_ptr(),
                    DEVICE_CAPACITY as u32,
                )
            };
            if written == 0 {
                return Err(NativeError::Failed {
                    call: "QueryDosDeviceW",
                });
            }
            Ok(wide_to_string(&target))
        }
    }
}

#[cfg(not(windows))]
mod imp {
    use std::path::{Path, PathBuf};

    use crate::api::{BoxPaths, HomePath, ProcessInfo, SbieApi};
    use crate::error::{NativeError, NativeResult};

    /// `SbieApi` implementation backed by the real shared library.
    ///
    /// Off Windows there is nothing to bind; every call fails with
    /// [`NativeError::Unsupported`].
    pub struct DynamicSbieApi {
        path: PathBuf,
    }

    impl DynamicSbieApi {
        pub fn new(path: impl Into<PathBuf>) -> Self {
            DynamicSbieApi { path: path.into() }
        }

        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    impl SbieApi for DynamicSbieApi {
        fn start_service(&self, _retry: bool) -> NativeResult<bool> {
            Err(NativeError::Unsupported)
        }

        fn enum_boxes(&self, _index: i32) -> NativeResult<Option<(i32, String)>> {
            Err(NativeError::Unsupported)
        }

        fn query_box_path(&self, _box_name: &str) -> NativeResult<BoxPaths> {
            Err(NativeError::Unsupported)
        }

        fn query_process_path(&self, _pid: u32) -> NativeResult<BoxPaths> {
            Err(NativeError::Unsupported)
        }

        fn count_processes(&self, _box: &str, _all: bool, _session: u32) -> NativeResult<u32> {
            Err(NativeError::Unsupported)
        }

        fn enum_processes(
            &self,
            _box_name: &str,
            _all_sessions: bool,
            _session: u32,
            _capacity: u32,
        ) -> NativeResult<Vec<u32>> {
            Err(NativeError::Unsupported)
        }

        fn query_process(&self, _pid: u32) -> NativeResult<ProcessInfo> {
            Err(NativeError::Unsupported)
        }

        fn query_conf(&self, _section: &str, _setting: &str, _index: u32) -> NativeResult<String> {
            Err(NativeError::Unsupported)
        }

        fn update_conf(
            &self,
            _operation: char,
            _password: &str,
            _section: &str,
            _setting: &str,
            _value: &str,
        ) -> NativeResult<()> {
            Err(NativeError::Unsupported)
        }

        fn reload_conf(&self, _session_id: u32) -> NativeResult<()> {
            Err(NativeError::Unsupported)
        }

        fn get_home_path(&self) -> NativeResult<HomePath> {
            Err(NativeError::Unsupported)
        }

        fn run_sandboxed(
            &self,
            _box_name: &str,
            _command: &str,
            _directory: &str,
            _creation_flags: u32,
        ) -> NativeResult<u32> {
            Err(NativeError::Unsupported)
        }

        fn kill_one(&self, _pid: u32) -> NativeResult<bool> {
            Err(NativeError::Unsupported)
        }

        fn kill_all(&self, _session_id: u32, _box_name: &str) -> NativeResult<bool> {
            Err(NativeError::Unsupported)
        }

        fn query_dos_device(&self, _drive: &str) -> NativeResult<String> {
            Err(NativeError::Unsupported)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::SbieApi;

    #[test]
    fn test_to_wide_is_nul_terminated() {
        let wide = to_wide("Box");
        assert_eq!(wide, vec![b'B' as u16, b'o' as u16, b'x' as u16, 0]);
    }

    #[test]
    fn test_missing_library_reports_error_without_panicking() {
        let api = DynamicSbieApi::new("definitely-missing/SbieDll.dll");
        assert!(api.query_conf("GlobalSettings", "FileRootPath", 0).is_err());
        assert!(api.path().ends_with("SbieDll.dll"));
    }
}

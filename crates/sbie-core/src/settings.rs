//! Immutable runtime settings.
//!
//! Fixed file names, default tables and timeouts live here rather than in
//! globals so tests can point everything at a temporary base directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::defaults::{self, DefaultEntry};

/// Placeholder the native layer replaces with the box name.
pub const SANDBOX_PLACEHOLDER: &str = "%SANDBOX%";

const DEFAULT_RELEASES_URL: &str = "https://api.github.com/repos/sandboxie-plus/Sandboxie/releases";
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/117.0.0.0 Safari/537.36 Edg/117.0.2045.60";

/// File names of the installed components, relative to the install dir.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentFiles {
    pub library: String,
    pub service: String,
    pub message_catalog: String,
    pub driver: String,
    pub helper: String,
}

impl Default for ComponentFiles {
    fn default() -> Self {
        ComponentFiles {
            library: "SbieDll.dll".to_string(),
            service: "SbieSvc.exe".to_string(),
            message_catalog: "SbieMsg.dll".to_string(),
            driver: "SbieDrv.sys".to_string(),
            helper: "KmdUtil.exe".to_string(),
        }
    }
}

/// Name, binary and message catalog of the driver or the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentDescriptor {
    pub name: String,
    pub file_path: PathBuf,
    pub message_catalog_path: PathBuf,
}

/// Settings shared by every component of the crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SbieSettings {
    /// Directory holding the install dir and downloaded installers
    pub base_dir: PathBuf,
    pub install_dir_name: String,
    /// File whose presence marks a complete installation
    pub marker_executable: String,
    /// Bundled legacy control panel, deleted after unpacking
    pub legacy_control_executable: String,
    pub components: ComponentFiles,
    pub releases_url: String,
    pub user_agent: String,
    /// Every fragment must appear in the release asset name
    pub asset_name_fragments: Vec<String>,
    pub installer_args: Vec<String>,
    pub download_timeout: Duration,
    /// Per-attempt wait for the service to reach `Stopped`
    pub service_stop_wait: Duration,
    pub service_poll_interval: Duration,
    pub driver_altitude: String,
    pub service_display_name: String,
    pub service_group: String,
    /// Password for configuration edits, if the installation uses one
    pub config_password: Option<String>,
    pub box_defaults: Vec<DefaultEntry>,
}

impl SbieSettings {
    /// Settings rooted at `base_dir`, everything else at its default.
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        SbieSettings {
            base_dir: base_dir.into(),
            install_dir_name: "Sandboxie-Plus".to_string(),
            marker_executable: "SandMan.exe".to_string(),
            legacy_control_executable: "SbieCtrl.exe".to_string(),
            components: ComponentFiles::default(),
            releases_url: DEFAULT_RELEASES_URL.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            asset_name_fragments: vec!["x64".to_string(), "Plus".to_string()],
            installer_args: vec!["/VERYSILENT".to_string(), "/PORTABLE=1".to_string()],
            download_timeout: Duration::from_secs(20),
            service_stop_wait: Duration::from_secs(15),
            service_poll_interval: Duration::from_millis(250),
            driver_altitude: "86900".to_string(),
            service_display_name: "Sandboxie Service".to_string(),
            service_group: "UIGroup".to_string(),
            config_password: None,
            box_defaults: defaults::box_defaults(),
        }
    }

    /// Settings from `SBIE_BASE_DIR`, `SBIE_RELEASES_URL` and
    /// `SBIE_CONFIG_PASSWORD`. The base dir defaults to the directory of the
    /// running executable.
    pub fn from_env() -> Self {
        let base_dir = std::env::var_os("SBIE_BASE_DIR")
            .map(PathBuf::from)
            .or_else(|| {
                std::env::current_exe()
                    .ok()
                    .and_then(|exe| exe.parent().map(Path::to_path_buf))
            })
            .unwrap_or_else(|| PathBuf::from("."));

        let mut settings = Self::with_base_dir(base_dir);
        if let Ok(url) = std::env::var("SBIE_RELEASES_URL") {
            settings.releases_url = url;
        }
        settings.config_password = std::env::var("SBIE_CONFIG_PASSWORD").ok();
        settings
    }

    pub fn with_releases_url(mut self, url: &str) -> Self {
        self.releases_url = url.to_string();
        self
    }

    pub fn with_config_password(mut self, password: &str) -> Self {
        self.config_password = Some(password.to_string());
        self
    }

    pub fn with_service_stop_wait(mut self, wait: Duration) -> Self {
        self.service_stop_wait = wait;
        self
    }

    pub fn install_dir(&self) -> PathBuf {
        self.base_dir.join(&self.install_dir_name)
    }

    pub fn component_path(&self, file: &str) -> PathBuf {
        self.install_dir().join(file)
    }

    pub fn library_path(&self) -> PathBuf {
        self.component_path(&self.components.library)
    }

    pub fn helper_path(&self) -> PathBuf {
        self.component_path(&self.components.helper)
    }

    /// `<install>\boxes\%SANDBOX%`
    pub fn box_root_template(&self) -> String {
        format!(
            "{}\\boxes\\{}",
            self.install_dir().display(),
            SANDBOX_PLACEHOLDER
        )
    }

    pub fn global_defaults(&self) -> Vec<DefaultEntry> {
        defaults::global_defaults(&self.box_root_template())
    }

    pub fn driver(&self) -> ComponentDescriptor {
        self.descriptor(&self.components.driver)
    }

    pub fn service(&self) -> ComponentDescriptor {
        self.descriptor(&self.components.service)
    }

    fn descriptor(&self, file: &str) -> ComponentDescriptor {
        let name = Path::new(file)
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| file.to_string());
        ComponentDescriptor {
            name,
            file_path: self.component_path(file),
            message_catalog_path: self.component_path(&self.components.message_catalog),
        }
    }
}

impl Default for SbieSettings {
    fn default() -> Self {
        Self::from_env()
    }
}

//! Top-level install, remove and start flows.
//!
//! No state is persisted between runs: every flow starts from what the host
//! currently reports. A failed step stops the flow (except remove, which
//! always attempts both components) and the aggregate error chain names
//! every failed sub-step.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use sbie_native::{DynamicSbieApi, HomePath, SbieApi};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::ConfigStore;
use crate::error::DownloadError;
use crate::executable;
use crate::host::{
    ElevatedCommand, PrivilegedRunner, ScmServiceControl, ServiceControl, ShellElevatedRunner,
};
use crate::installer::ComponentInstaller;
use crate::obs::{self, OperationSpan};
use crate::outcome::{Outcome, StatusCode};
use crate::probe::PresenceProbe;
use crate::release::{GithubReleases, ReleaseSource};
use crate::sandbox::{self, SandboxBox};
use crate::settings::SbieSettings;

/// Presence of each component, as reported by the probes.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentStatus {
    pub install_path: Outcome<bool>,
    pub driver: Outcome<bool>,
    pub service: Outcome<bool>,
}

/// Entry point composing the probe, installer, store and boxes.
pub struct Orchestrator {
    settings: Arc<SbieSettings>,
    api: Arc<dyn SbieApi>,
    runner: Arc<dyn PrivilegedRunner>,
    releases: Arc<dyn ReleaseSource>,
    probe: PresenceProbe,
    installer: ComponentInstaller,
    store: ConfigStore,
}

impl Orchestrator {
    pub fn new(
        settings: SbieSettings,
        api: Arc<dyn SbieApi>,
        services: Arc<dyn ServiceControl>,
        runner: Arc<dyn PrivilegedRunner>,
        releases: Arc<dyn ReleaseSource>,
    ) -> Self {
        let settings = Arc::new(settings);
        let probe = PresenceProbe::new(settings.clone(), services);
        let installer =
            ComponentInstaller::new(settings.clone(), probe.clone(), api.clone(), runner.clone());
        let store = ConfigStore::new(api.clone(), settings.clone());
        Self {
            settings,
            api,
            runner,
            releases,
            probe,
            installer,
            store,
        }
    }

    /// Wire the production host primitives.
    pub fn system(settings: SbieSettings) -> Result<Self, DownloadError> {
        let shared = Arc::new(settings.clone());
        let releases = Arc::new(GithubReleases::new(shared)?);
        let api = Arc::new(DynamicSbieApi::new(settings.library_path()));
        Ok(Self::new(
            settings,
            api,
            Arc::new(ScmServiceControl::new()),
            Arc::new(ShellElevatedRunner::new()),
            releases,
        ))
    }

    pub fn settings(&self) -> &SbieSettings {
        &self.settings
    }

    pub fn probe(&self) -> &PresenceProbe {
        &self.probe
    }

    pub fn installer(&self) -> &ComponentInstaller {
        &self.installer
    }

    pub fn config(&self) -> &ConfigStore {
        &self.store
    }

    pub fn status(&self) -> ComponentStatus {
        ComponentStatus {
            install_path: self.probe.install_path(),
            driver: self.probe.driver(),
            service: self.probe.service(),
        }
    }

    /// Download, unpack and register everything, or resume component
    /// registration when the install directory is already there.
    pub async fn install(&self, retry: bool) -> Outcome<bool> {
        let _span = OperationSpan::enter("install");
        let install_dir = self.settings.install_dir();

        if install_dir.is_dir() {
            info!(path = %install_dir.display(), "install directory present, resuming");
            let driver = self.installer.install_driver().await;
            obs::emit_step_finished("install_driver", driver.status());
            let service = self.installer.install_service().await;
            obs::emit_step_finished("install_service", service.status());
            if driver.is_ok() && service.is_ok() {
                return Outcome::ok(true);
            }
            return Outcome::<bool>::fail(
                StatusCode::InstallComponentsError,
                "components were not installed",
            )
            .caused_by(&driver)
            .caused_by(&service);
        }

        let downloaded = self
            .releases
            .download_installer(&self.settings.base_dir, retry)
            .await;
        obs::emit_step_finished("download", downloaded.status());
        let Some(installer) = downloaded.data().cloned() else {
            return downloaded.context(
                StatusCode::InstallDownloadError,
                "install stopped: installer was not downloaded",
            );
        };

        let command = ElevatedCommand::new(&installer)
            .args(self.settings.installer_args.iter().cloned())
            .current_dir(&self.settings.base_dir);
        match self.runner.run(&command, None).await {
            Ok(code) => obs::emit_helper_exited(&command.to_string(), code),
            Err(err) => {
                return Outcome::fail(
                    StatusCode::InstallUnpackingError,
                    format!("installer failed to run: {err}"),
                )
            }
        }

        if !install_dir.is_dir() {
            return Outcome::fail(
                StatusCode::InstallFileNotFound,
                format!("{} missing after unpacking", install_dir.display()),
            );
        }

        remove_best_effort(&installer);
        remove_best_effort(&install_dir.join(&self.settings.legacy_control_executable));

        let driver = self.installer.install_driver().await;
        obs::emit_step_finished("install_driver", driver.status());
        let service = self.installer.install_service().await;
        obs::emit_step_finished("install_service", service.status());
        let started = self.installer.start_service(false);
        obs::emit_step_finished("start_service", started.status());
        let defaults = self.store.load_global_defaults();
        obs::emit_step_finished("load_global_defaults", defaults.status());

        if driver.is_ok() && service.is_ok() && started.is_ok() && defaults.is_ok() {
            info!("installation complete");
            return Outcome::ok(true);
        }
        Outcome::<bool>::fail(
            StatusCode::InstallComponentsError,
            "components were not installed",
        )
        .caused_by(&driver)
        .caused_by(&service)
        .caused_by(&started)
        .caused_by(&defaults)
    }

    /// Unregister service and driver, then delete the install directory.
    pub async fn remove(&self) -> Outcome<bool> {
        let _span = OperationSpan::enter("remove");
        let install_dir = self.settings.install_dir();
        if !install_dir.exists() {
            return Outcome::ok(true);
        }

        let service = self.installer.remove_service().await;
        obs::emit_step_finished("remove_service", service.status());
        let driver = self.installer.remove_driver().await;
        obs::emit_step_finished("remove_driver", driver.status());

        if let Err(err) = fs::remove_dir_all(&install_dir) {
            let status = match err.kind() {
                io::ErrorKind::PermissionDenied => StatusCode::NoAccess,
                io::ErrorKind::NotFound => StatusCode::PathNotExists,
                _ => StatusCode::Unknown,
            };
            obs::emit_step_finished("remove_directory", status);
            return Outcome::<bool>::fail(
                status,
                format!("{} could not be deleted: {err}", install_dir.display()),
            )
            .caused_by(&service)
            .caused_by(&driver);
        }

        if service.is_ok() && driver.is_ok() && !install_dir.exists() {
            info!("removal complete");
            return Outcome::ok(true);
        }
        Outcome::<bool>::fail(
            StatusCode::RemoveComponentsError,
            "components were not removed",
        )
        .caused_by(&service)
        .caused_by(&driver)
    }

    /// Start the service through the native interface.
    pub fn start_service(&self, retry: bool) -> Outcome<bool> {
        let _span = OperationSpan::enter("start_service");
        self.installer.start_service(retry)
    }

    /// Installation root as reported by the native layer.
    pub fn home_path(&self) -> Outcome<HomePath> {
        match self.api.get_home_path() {
            Ok(home) => Outcome::ok(home),
            Err(err) => Outcome::fail(
                StatusCode::GetHomePathDllError,
                format!("home path query failed: {err}"),
            ),
        }
    }

    pub fn sandbox(&self, name: &str) -> SandboxBox {
        SandboxBox::new(name, self.api.clone(), self.store.clone(), self.settings.clone())
    }

    pub fn list_boxes(&self) -> Outcome<Vec<String>> {
        sandbox::list_boxes(self.api.as_ref())
    }

    /// Start `file` in `box_name` without the box configuration check.
    pub fn run_boxed(&self, file: &Path, box_name: &str) -> Outcome<u32> {
        sandbox::run_boxed(self.api.as_ref(), &self.settings, file, box_name)
    }

    pub fn can_execute(&self, file: &Path) -> Outcome<bool> {
        executable::can_execute(file)
    }

    pub fn is_64bit(&self, file: &Path) -> Outcome<bool> {
        executable::is_64bit(file)
    }
}

fn remove_best_effort(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            warn!(path = %path.display(), "cleanup skipped");
            obs::emit_cleanup_failed(&path.display().to_string(), &err);
        }
    }
}

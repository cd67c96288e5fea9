//! Read-only presence checks for the install path, driver and service.
//!
//! Each check maps access faults and not-found faults to different
//! statuses so callers can tell "absent" from "inaccessible".

use std::fs;
use std::io;
use std::sync::Arc;

use tracing::debug;

use crate::error::SystemError;
use crate::host::{ServiceControl, ServiceState};
use crate::outcome::{Outcome, StatusCode};
use crate::settings::SbieSettings;

/// Check that the install directory exists and contains the marker
/// executable.
pub fn check_install_path(settings: &SbieSettings) -> Outcome<bool> {
    let dir = settings.install_dir();
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) => {
            let status = match err.kind() {
                io::ErrorKind::PermissionDenied => StatusCode::NoAccess,
                io::ErrorKind::NotFound => StatusCode::PathNotExists,
                _ => StatusCode::Unknown,
            };
            debug!(path = %dir.display(), error = %err, "install path not readable");
            return Outcome::fail(status, format!("{}: {err}", dir.display()));
        }
    };

    let found = entries
        .filter_map(Result::ok)
        .any(|entry| entry.file_name() == settings.marker_executable.as_str());

    if found {
        Outcome::ok(true)
    } else {
        Outcome::fail(
            StatusCode::NotExists,
            format!(
                "{} not found in {}",
                settings.marker_executable,
                dir.display()
            ),
        )
    }
}

/// Presence checks bound to a settings instance and a service manager.
#[derive(Clone)]
pub struct PresenceProbe {
    settings: Arc<SbieSettings>,
    services: Arc<dyn ServiceControl>,
}

impl PresenceProbe {
    pub fn new(settings: Arc<SbieSettings>, services: Arc<dyn ServiceControl>) -> Self {
        Self { settings, services }
    }

    pub fn install_path(&self) -> Outcome<bool> {
        check_install_path(&self.settings)
    }

    /// The driver is present when its service key is registered.
    pub fn driver(&self) -> Outcome<bool> {
        let name = self.settings.driver().name;
        match self.services.driver_registered(&name) {
            Ok(true) => Outcome::ok(true),
            Ok(false) => Outcome::fail(
                StatusCode::DriverNotFound,
                format!("driver {name} is not registered"),
            ),
            Err(SystemError::AccessDenied(msg)) => Outcome::fail(StatusCode::NoAccess, msg),
            Err(err) => Outcome::fail(StatusCode::Unknown, err.to_string()),
        }
    }

    /// The service is present only when it is running.
    pub fn service(&self) -> Outcome<bool> {
        let name = self.settings.service().name;
        match self.services.service_state(&name) {
            Ok(Some(ServiceState::Running)) => Outcome::ok(true),
            Ok(Some(state)) => Outcome::fail(
                StatusCode::ServiceNotStarted,
                format!("service {name} is {state:?}"),
            ),
            Ok(None) => Outcome::fail(
                StatusCode::ServiceNotFound,
                format!("service {name} is not installed"),
            ),
            Err(SystemError::AccessDenied(msg)) => Outcome::fail(StatusCode::NoAccess, msg),
            Err(err) => Outcome::fail(StatusCode::ServiceNotFound, err.to_string()),
        }
    }

    /// Whether the service is registered in any state. Inaccessible counts
    /// as registered.
    pub fn service_registered(&self) -> bool {
        self.service().status() != StatusCode::ServiceNotFound
    }

    /// Raw service state, `None` when unknown or not installed.
    pub fn service_state(&self) -> Option<ServiceState> {
        let name = self.settings.service().name;
        self.services.service_state(&name).ok().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::SimulatedHost;

    fn fixture() -> (tempfile::TempDir, Arc<SbieSettings>) {
        let dir = tempfile::tempdir().unwrap();
        let settings = Arc::new(SbieSettings::with_base_dir(dir.path()));
        (dir, settings)
    }

    #[test]
    fn test_missing_install_dir() {
        let (_dir, settings) = fixture();
        let outcome = check_install_path(&settings);
        assert_eq!(outcome.status(), StatusCode::PathNotExists);
        assert!(!outcome.errors().is_empty());
    }

    #[test]
    fn test_install_dir_without_marker() {
        let (_dir, settings) = fixture();
        fs::create_dir_all(settings.install_dir()).unwrap();
        assert_eq!(check_install_path(&settings).status(), StatusCode::NotExists);

        fs::write(settings.install_dir().join("SandMan.exe"), b"MZ").unwrap();
        assert!(check_install_path(&settings).is_ok());
    }

    #[test]
    fn test_service_must_be_running() {
        let (_dir, settings) = fixture();
        let host = Arc::new(SimulatedHost::new(&settings));
        let probe = PresenceProbe::new(settings, host.clone());

        assert_eq!(probe.service().status(), StatusCode::ServiceNotFound);
        host.set_service_state(Some(ServiceState::Stopped));
        assert_eq!(probe.service().status(), StatusCode::ServiceNotStarted);
        host.set_service_state(Some(ServiceState::Running));
        assert!(probe.service().is_ok());
    }

    #[test]
    fn test_driver_access_denied() {
        let (_dir, settings) = fixture();
        let host = Arc::new(SimulatedHost::new(&settings));
        let probe = PresenceProbe::new(settings, host.clone());

        assert_eq!(probe.driver().status(), StatusCode::DriverNotFound);
        host.deny_driver_access(true);
        assert_eq!(probe.driver().status(), StatusCode::NoAccess);
    }

    #[test]
    fn test_service_access_denied() {
        let (_dir, settings) = fixture();
        let host = Arc::new(SimulatedHost::new(&settings));
        let probe = PresenceProbe::new(settings, host.clone());

        assert!(!probe.service_registered());
        host.deny_service_access(true);
        assert_eq!(probe.service().status(), StatusCode::NoAccess);
        assert!(probe.service_registered());
        assert_eq!(probe.service_state(), None);
    }
}

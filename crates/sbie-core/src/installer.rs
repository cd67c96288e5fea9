//! Idempotent install/remove/start/stop of the driver and the service.
//!
//! Every state change goes through the elevated privileged helper and is
//! confirmed by re-probing presence; the helper's exit code is logged but
//! never trusted on its own.

use std::sync::Arc;
use std::time::Duration;

use sbie_native::SbieApi;
use tracing::{debug, info};

use crate::host::{ElevatedCommand, PrivilegedRunner, ServiceState};
use crate::obs;
use crate::outcome::{Outcome, StatusCode};
use crate::probe::PresenceProbe;
use crate::retry::RetryPolicy;
use crate::settings::SbieSettings;

/// Installs and removes the driver and service components.
#[derive(Clone)]
pub struct ComponentInstaller {
    settings: Arc<SbieSettings>,
    probe: PresenceProbe,
    api: Arc<dyn SbieApi>,
    runner: Arc<dyn PrivilegedRunner>,
}

impl ComponentInstaller {
    pub fn new(
        settings: Arc<SbieSettings>,
        probe: PresenceProbe,
        api: Arc<dyn SbieApi>,
        runner: Arc<dyn PrivilegedRunner>,
    ) -> Self {
        Self {
            settings,
            probe,
            api,
            runner,
        }
    }

    /// Run the privileged helper with `args` and wait for it to exit.
    ///
    /// Succeeds whenever the helper ran; the exit code is carried as data.
    pub async fn exec<I, S>(&self, args: I) -> Outcome<i32>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let command = ElevatedCommand::new(self.settings.helper_path())
            .args(args)
            .current_dir(&self.settings.install_dir());
        let line = command.command_line();
        debug!(command = %line, "running privileged helper");

        match self.runner.run(&command, None).await {
            Ok(code) => {
                obs::emit_helper_exited(&line, code);
                Outcome::ok(code)
            }
            Err(err) => Outcome::fail(StatusCode::KmdUtilExecError, err.to_string()),
        }
    }

    /// Register the service, start it and confirm it is running.
    pub async fn install_service(&self) -> Outcome<bool> {
        let installed = self.probe.install_path();
        if !installed.is_ok() {
            return Outcome::<bool>::fail(
                StatusCode::KmdUtilInstallServiceNotExists,
                "cannot install service: install path does not exist",
            )
            .caused_by(&installed);
        }
        if self.probe.service().is_ok() {
            debug!("service already running");
            return Outcome::ok(true);
        }

        let service = self.settings.service();
        let exec = self
            .exec([
                "install".to_string(),
                service.name.clone(),
                service.file_path.display().to_string(),
                "type=own".to_string(),
                "start=auto".to_string(),
                format!("display={}", self.settings.service_display_name),
                format!("group={}", self.settings.service_group),
                format!("msgfile={}", service.message_catalog_path.display()),
            ])
            .await;
        let started = self.start_service(false);
        let present = self.probe.service();

        if exec.is_ok() && started.is_ok() && present.is_ok() {
            info!(service = %service.name, "service installed");
            return Outcome::ok(true);
        }

        Outcome::<bool>::fail(
            StatusCode::KmdUtilInstallServiceError,
            format!("service {} was not installed", service.name),
        )
        .caused_by(&exec)
        .caused_by(&started)
        .caused_by(&present)
    }

    /// Stop (if needed) and unregister the service.
    pub async fn remove_service(&self) -> Outcome<bool> {
        let installed = self.probe.install_path();
        if !installed.is_ok() {
            return Outcome::<bool>::fail(
                StatusCode::RemovePathNotExists,
                "cannot remove service: install path does not exist",
            )
            .caused_by(&installed);
        }
        if !self.probe.service_registered() {
            return Outcome::ok(true);
        }

        if self.probe.service().is_ok() {
            let stopped = self.stop_service(false).await;
            if !stopped.is_ok() {
                return Outcome::<bool>::fail(
                    StatusCode::RemoveServiceError,
                    "cannot remove service: it could not be stopped",
                )
                .caused_by(&stopped);
            }
        }

        let service = self.settings.service();
        let deleted = self.exec(["delete".to_string(), service.name.clone()]).await;
        if !deleted.is_ok() {
            return Outcome::<bool>::fail(
                StatusCode::RemoveServiceError,
                "cannot remove service: helper did not run",
            )
            .caused_by(&deleted);
        }

        if self.probe.service_registered() {
            return Outcome::<bool>::fail(
                StatusCode::RemoveServiceError,
                format!("service {} is still registered after delete", service.name),
            )
            .caused_by(&self.probe.service());
        }
        info!(service = %service.name, "service removed");
        Outcome::ok(true)
    }

    /// Ask the helper to stop the service, then wait for `Stopped`, up to
    /// one wait window per attempt.
    pub async fn stop_service(&self, retry: bool) -> Outcome<bool> {
        let installed = self.probe.install_path();
        if !installed.is_ok() {
            return Outcome::<bool>::fail(
                StatusCode::KmdUtilStopServiceError,
                "cannot stop service: install path does not exist",
            )
            .caused_by(&installed);
        }
        let present = self.probe.service();
        if !present.is_ok() {
            return Outcome::<bool>::fail(
                StatusCode::KmdUtilStopServiceNotExists,
                "cannot stop service: it is not installed or already stopped",
            )
            .caused_by(&present);
        }

        let service = self.settings.service();
        let exec = self.exec(["stop".to_string(), service.name.clone()]).await;
        if !exec.is_ok() {
            return Outcome::<bool>::fail(
                StatusCode::KmdUtilStopServiceExecError,
                "cannot stop service: helper did not run",
            )
            .caused_by(&exec);
        }

        let policy = RetryPolicy::from_flag(retry);
        for attempt in policy.iter() {
            if self.wait_for_stopped(self.settings.service_stop_wait).await {
                info!(service = %service.name, attempt, "service stopped");
                return Outcome::ok(true);
            }
            if !policy.is_final(attempt) {
                obs::emit_attempt_failed(
                    "stop_service",
                    attempt,
                    policy.attempts(),
                    "service did not reach Stopped",
                );
            }
        }

        Outcome::fail(
            StatusCode::KmdUtilStopServiceError,
            format!(
                "service {} was not stopped {}",
                service.name,
                policy.describe()
            ),
        )
    }

    async fn wait_for_stopped(&self, wait: Duration) -> bool {
        let interval = self.settings.service_poll_interval;
        let poll = async {
            loop {
                if self.probe.service_state() == Some(ServiceState::Stopped) {
                    return;
                }
                tokio::time::sleep(interval).await;
            }
        };
        tokio::time::timeout(wait, poll).await.is_ok()
    }

    /// Start the service through the native interface.
    ///
    /// Allowed when the service is running or registered but stopped;
    /// retries happen here, the native retry flag is never set.
    pub fn start_service(&self, retry: bool) -> Outcome<bool> {
        let installed = self.probe.install_path();
        if !installed.is_ok() {
            return Outcome::<bool>::fail(
                StatusCode::ServiceStartNotExists,
                "cannot start service: install path does not exist",
            )
            .caused_by(&installed);
        }
        let present = self.probe.service();
        if !present.is_ok() && present.status() != StatusCode::ServiceNotStarted {
            return Outcome::<bool>::fail(
                StatusCode::ServiceStartDllError,
                "cannot start service: it is not installed",
            )
            .caused_by(&present);
        }

        let policy = RetryPolicy::from_flag(retry);
        let mut last_reason = String::new();
        for attempt in policy.iter() {
            match self.api.start_service(false) {
                Ok(true) => return Outcome::ok(true),
                Ok(false) => last_reason = "native start returned false".to_string(),
                Err(err) => last_reason = err.to_string(),
            }
            if !policy.is_final(attempt) {
                obs::emit_attempt_failed("start_service", attempt, policy.attempts(), &last_reason);
            }
        }

        Outcome::fail(
            StatusCode::ServiceStartDllError,
            format!("service was not started {}: {last_reason}", policy.describe()),
        )
    }

    /// Register the kernel driver and confirm its registry key exists.
    pub async fn install_driver(&self) -> Outcome<bool> {
        let installed = self.probe.install_path();
        if !installed.is_ok() {
            return Outcome::<bool>::fail(
                StatusCode::KmdUtilInstallDriverNotExists,
                "cannot install driver: install path does not exist",
            )
            .caused_by(&installed);
        }
        if self.probe.driver().is_ok() {
            debug!("driver already registered");
            return Outcome::ok(true);
        }

        let driver = self.settings.driver();
        let exec = self
            .exec([
                "install".to_string(),
                driver.name.clone(),
                driver.file_path.display().to_string(),
                "type=kernel".to_string(),
                "start=demand".to_string(),
                format!("msgfile={}", driver.message_catalog_path.display()),
                format!("altitude={}", self.settings.driver_altitude),
            ])
            .await;
        if !exec.is_ok() {
            return Outcome::<bool>::fail(
                StatusCode::KmdUtilInstallDriverError,
                "cannot install driver: helper did not run",
            )
            .caused_by(&exec);
        }

        let present = self.probe.driver();
        if !present.is_ok() {
            return Outcome::<bool>::fail(
                StatusCode::KmdUtilInstallDriverError,
                format!("driver {} not found after install", driver.name),
            )
            .caused_by(&present);
        }
        info!(driver = %driver.name, "driver installed");
        Outcome::ok(true)
    }

    /// Stop and unregister the kernel driver.
    pub async fn remove_driver(&self) -> Outcome<bool> {
        let installed = self.probe.install_path();
        if !installed.is_ok() {
            return Outcome::<bool>::fail(
                StatusCode::KmdUtilRemoveDriverNotExists,
                "cannot remove driver: install path does not exist",
            )
            .caused_by(&installed);
        }
        if !self.probe.driver().is_ok() {
            return Outcome::ok(true);
        }

        let driver = self.settings.driver();
        // A driver that is not running refuses to stop; only delete matters.
        let _ = self.exec(["stop".to_string(), driver.name.clone()]).await;
        let deleted = self.exec(["delete".to_string(), driver.name.clone()]).await;
        if !deleted.is_ok() {
            return Outcome::<bool>::fail(
                StatusCode::KmdUtilRemoveDriverError,
                "cannot remove driver: helper did not run",
            )
            .caused_by(&deleted);
        }

        if self.probe.driver().is_ok() {
            return Outcome::fail(
                StatusCode::KmdUtilRemoveDriverError,
                format!("driver {} still registered after delete", driver.name),
            );
        }
        info!(driver = %driver.name, "driver removed");
        Outcome::ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::SimulatedHost;

    struct Fixture {
        _dir: tempfile::TempDir,
        host: Arc<SimulatedHost>,
        installer: ComponentInstaller,
    }

    fn fixture(installed: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let settings = Arc::new(SbieSettings::with_base_dir(dir.path()));
        let host = Arc::new(SimulatedHost::new(&settings));
        if installed {
            host.write_install_tree().unwrap();
        }
        let probe = PresenceProbe::new(settings.clone(), host.clone());
        let installer = ComponentInstaller::new(settings, probe, host.clone(), host.clone());
        Fixture {
            _dir: dir,
            host,
            installer,
        }
    }

    #[tokio::test]
    async fn test_install_driver_builds_helper_command() {
        let fx = fixture(true);
        assert!(fx.installer.install_driver().await.is_ok());
        let calls = fx.host.helper_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0][0], "install");
        assert_eq!(calls[0][1], "SbieDrv");
        assert!(calls[0].contains(&"type=kernel".to_string()));
        assert!(calls[0].contains(&"altitude=86900".to_string()));
    }

    #[tokio::test]
    async fn test_install_service_runs_and_starts() {
        let fx = fixture(true);
        assert!(fx.installer.install_service().await.is_ok());
        assert_eq!(fx.host.service_state_now(), Some(ServiceState::Running));
        let calls = fx.host.helper_calls();
        assert!(calls[0].contains(&"display=Sandboxie Service".to_string()));
        assert!(calls[0].contains(&"group=UIGroup".to_string()));
    }

    #[tokio::test]
    async fn test_install_service_aggregates_distinct_causes() {
        let fx = fixture(true);
        fx.host.fail_launch(true);
        let outcome = fx.installer.install_service().await;
        assert_eq!(outcome.status(), StatusCode::KmdUtilInstallServiceError);
        let statuses: Vec<_> = outcome.errors().iter().map(|e| e.status()).collect();
        assert!(statuses.contains(&StatusCode::KmdUtilExecError));
        assert!(statuses.contains(&StatusCode::ServiceStartDllError));
        assert!(statuses.contains(&StatusCode::ServiceNotFound));
    }

    #[tokio::test]
    async fn test_install_driver_without_install_path() {
        let fx = fixture(false);
        let outcome = fx.installer.install_driver().await;
        assert_eq!(outcome.status(), StatusCode::KmdUtilInstallDriverNotExists);
        assert!(fx.host.helper_calls().is_empty());
    }

    #[tokio::test]
    async fn test_helper_exit_code_does_not_decide_success() {
        let fx = fixture(true);
        fx.host.ignore_helper_verb("install");
        let outcome = fx.installer.install_driver().await;
        assert_eq!(outcome.status(), StatusCode::KmdUtilInstallDriverError);
        assert_eq!(outcome.errors()[1].status(), StatusCode::DriverNotFound);
    }

    #[tokio::test]
    async fn test_remove_driver_stops_then_deletes() {
        let fx = fixture(true);
        fx.host.set_driver_registered(true);
        assert!(fx.installer.remove_driver().await.is_ok());
        let verbs: Vec<_> = fx.host.helper_calls().iter().map(|c| c[0].clone()).collect();
        assert_eq!(verbs, vec!["stop", "delete"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_service_single_attempt() {
        let fx = fixture(true);
        fx.host.set_service_state(Some(ServiceState::Running));
        fx.host.ignore_helper_verb("stop");
        let outcome = fx.installer.stop_service(false).await;
        assert_eq!(outcome.status(), StatusCode::KmdUtilStopServiceError);
        assert!(outcome.errors()[0].message().contains("after 1 attempt"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_service_three_attempts() {
        let fx = fixture(true);
        fx.host.set_service_state(Some(ServiceState::Running));
        fx.host.ignore_helper_verb("stop");
        let started = tokio::time::Instant::now();
        let outcome = fx.installer.stop_service(true).await;
        assert_eq!(outcome.status(), StatusCode::KmdUtilStopServiceError);
        assert!(outcome.errors()[0].message().contains("after 3 attempts"));
        assert!(started.elapsed() >= Duration::from_secs(45));
    }

    #[tokio::test]
    async fn test_stop_service_not_running() {
        let fx = fixture(true);
        let outcome = fx.installer.stop_service(false).await;
        assert_eq!(outcome.status(), StatusCode::KmdUtilStopServiceNotExists);
        assert!(fx.host.helper_calls().is_empty());
    }

    #[test]
    fn test_start_service_retry_bound() {
        let fx = fixture(true);
        fx.host.set_service_state(Some(ServiceState::Stopped));
        fx.host.api().set_start_service_result(false);

        let once = fx.installer.start_service(false);
        assert_eq!(once.status(), StatusCode::ServiceStartDllError);
        assert_eq!(fx.host.api().call_count("start_service"), 1);

        let thrice = fx.installer.start_service(true);
        assert!(thrice.errors()[0].message().contains("after 3 attempts"));
        assert_eq!(fx.host.api().call_count("start_service"), 4);
    }

    #[tokio::test]
    async fn test_remove_service_when_absent_is_noop() {
        let fx = fixture(true);
        assert!(fx.installer.remove_service().await.is_ok());
        assert!(fx.host.helper_calls().is_empty());
    }

    #[tokio::test]
    async fn test_remove_stopped_service_skips_stop() {
        let fx = fixture(true);
        fx.host.set_service_state(Some(ServiceState::Stopped));
        assert!(fx.installer.remove_service().await.is_ok());
        let verbs: Vec<_> = fx.host.helper_calls().iter().map(|c| c[0].clone()).collect();
        assert_eq!(verbs, vec!["delete"]);
        assert_eq!(fx.host.service_state_now(), None);
    }

    #[tokio::test]
    async fn test_remove_service_detects_ignored_delete() {
        let fx = fixture(true);
        fx.host.set_service_state(Some(ServiceState::Running));
        fx.host.ignore_helper_verb("delete");
        let outcome = fx.installer.remove_service().await;
        assert_eq!(outcome.status(), StatusCode::RemoveServiceError);
        assert_eq!(outcome.errors()[1].status(), StatusCode::ServiceNotStarted);
        assert_eq!(fx.host.service_state_now(), Some(ServiceState::Stopped));
    }
}

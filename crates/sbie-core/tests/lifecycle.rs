use std::sync::Arc;
use std::time::Duration;

use sbie_core::fakes::{SimulatedHost, StaticRelease};
use sbie_core::{Orchestrator, SbieSettings, ServiceState, StatusCode};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Harness {
    _dir: tempfile::TempDir,
    host: Arc<SimulatedHost>,
    releases: Arc<StaticRelease>,
    orchestrator: Orchestrator,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let settings = SbieSettings::with_base_dir(dir.path())
        .with_service_stop_wait(Duration::from_secs(2));
    let host = Arc::new(SimulatedHost::new(&settings));
    let releases = StaticRelease::arc("Sandboxie-Plus-x64-v1.14.0.exe");
    let orchestrator = Orchestrator::new(
        settings,
        host.clone(),
        host.clone(),
        host.clone(),
        releases.clone(),
    );
    Harness {
        _dir: dir,
        host,
        releases,
        orchestrator,
    }
}

fn unpacked() -> Harness {
    let h = harness();
    h.host.write_install_tree().expect("install tree");
    h
}

// ---------------------------------------------------------------------------
// Install / remove flows
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fresh_install_registers_everything() {
    let h = harness();
    let outcome = h.orchestrator.install(false).await;
    assert!(outcome.is_ok(), "{outcome}");
    assert!(outcome.errors().is_empty());

    let status = h.orchestrator.status();
    assert!(status.install_path.is_ok());
    assert!(status.driver.is_ok());
    assert!(status.service.is_ok());

    let global = h
        .host
        .api()
        .stored_values("GlobalSettings", "FileRootPath");
    assert_eq!(global.len(), 1);
    assert!(global[0].ends_with(r"\boxes\%SANDBOX%"));
}

#[tokio::test]
async fn install_twice_is_a_no_op_the_second_time() {
    let h = harness();
    assert!(h.orchestrator.install(false).await.is_ok());
    let helper_runs = h.host.helper_calls().len();

    let again = h.orchestrator.install(false).await;
    assert!(again.is_ok(), "{again}");
    assert_eq!(h.host.helper_calls().len(), helper_runs);
    assert_eq!(h.host.installer_runs().len(), 1);
    assert_eq!(h.releases.calls().len(), 1);
}

#[tokio::test]
async fn install_download_failure_stops_the_flow() {
    let h = harness();
    h.releases
        .fail_with(StatusCode::WebNoReleases, "release list is empty");

    let outcome = h.orchestrator.install(true).await;
    assert_eq!(outcome.status(), StatusCode::InstallDownloadError);
    let chain: Vec<StatusCode> = outcome.errors().iter().map(|e| e.status()).collect();
    assert_eq!(
        chain,
        vec![StatusCode::InstallDownloadError, StatusCode::WebNoReleases]
    );
    assert!(h.host.installer_runs().is_empty());
    assert_eq!(h.releases.calls(), vec![true]);
}

#[tokio::test]
async fn install_components_failure_aggregates_chains() {
    let h = unpacked();
    h.host.ignore_helper_verb("install");

    let outcome = h.orchestrator.install(false).await;
    assert_eq!(outcome.status(), StatusCode::InstallComponentsError);
    let chain: Vec<StatusCode> = outcome.errors().iter().map(|e| e.status()).collect();
    assert_eq!(chain[0], StatusCode::InstallComponentsError);
    assert!(chain.contains(&StatusCode::KmdUtilInstallDriverError));
    assert!(chain.contains(&StatusCode::KmdUtilInstallServiceError));
}

#[tokio::test]
async fn remove_after_install_clears_host() {
    let h = harness();
    assert!(h.orchestrator.install(false).await.is_ok());

    let outcome = h.orchestrator.remove().await;
    assert!(outcome.is_ok(), "{outcome}");
    assert!(!h.orchestrator.settings().install_dir().exists());
    assert!(!h.host.driver_registered_now());
    assert_eq!(h.host.service_state_now(), None);

    let again = h.orchestrator.remove().await;
    assert!(again.is_ok());
}

#[tokio::test]
async fn remove_reports_component_failures_after_deleting() {
    let h = harness();
    assert!(h.orchestrator.install(false).await.is_ok());
    h.host.ignore_helper_verb("delete");

    let outcome = h.orchestrator.remove().await;
    assert_eq!(outcome.status(), StatusCode::RemoveComponentsError);
    assert!(outcome
        .errors()
        .iter()
        .any(|e| e.status() == StatusCode::KmdUtilRemoveDriverError));
    assert!(!h.orchestrator.settings().install_dir().exists());
}

// ---------------------------------------------------------------------------
// Component idempotence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn driver_install_and_remove_are_idempotent() {
    let h = unpacked();
    let installer = h.orchestrator.installer();

    assert!(installer.install_driver().await.is_ok());
    let runs = h.host.helper_calls().len();
    assert!(installer.install_driver().await.is_ok());
    assert_eq!(h.host.helper_calls().len(), runs);

    assert!(installer.remove_driver().await.is_ok());
    let runs = h.host.helper_calls().len();
    assert!(installer.remove_driver().await.is_ok());
    assert_eq!(h.host.helper_calls().len(), runs);
    assert!(!h.host.driver_registered_now());
}

#[tokio::test]
async fn service_install_and_remove_are_idempotent() {
    let h = unpacked();
    let installer = h.orchestrator.installer();

    assert!(installer.install_service().await.is_ok());
    assert_eq!(h.host.service_state_now(), Some(ServiceState::Running));
    let runs = h.host.helper_calls().len();
    assert!(installer.install_service().await.is_ok());
    assert_eq!(h.host.helper_calls().len(), runs);

    assert!(installer.remove_service().await.is_ok());
    assert_eq!(h.host.service_state_now(), None);
    let runs = h.host.helper_calls().len();
    assert!(installer.remove_service().await.is_ok());
    assert_eq!(h.host.helper_calls().len(), runs);
}

#[tokio::test]
async fn driver_access_denied_is_reported() {
    let h = unpacked();
    h.host.deny_driver_access(true);
    assert_eq!(h.orchestrator.probe().driver().status(), StatusCode::NoAccess);
}

#[tokio::test]
async fn service_access_denied_is_reported() {
    let h = unpacked();
    h.host.set_service_state(Some(ServiceState::Running));
    h.host.deny_service_access(true);
    assert_eq!(h.orchestrator.probe().service().status(), StatusCode::NoAccess);
    assert_eq!(h.orchestrator.status().service.status(), StatusCode::NoAccess);

    let removed = h.orchestrator.installer().remove_service().await;
    assert_eq!(removed.status(), StatusCode::RemoveServiceError);
    assert_eq!(removed.errors()[1].status(), StatusCode::NoAccess);
}

// ---------------------------------------------------------------------------
// Start service
// ---------------------------------------------------------------------------

#[test]
fn start_service_without_install_path() {
    let h = harness();
    let outcome = h.orchestrator.start_service(true);

    assert_eq!(outcome.status(), StatusCode::ServiceStartNotExists);
    assert!(outcome.errors().len() >= 2);
    assert_eq!(outcome.errors()[1].status(), StatusCode::PathNotExists);
    assert_eq!(h.host.api().call_count("start_service"), 0);
}

#[test]
fn start_service_retry_bound() {
    let h = unpacked();
    h.host.set_service_state(Some(ServiceState::Stopped));
    h.host.api().set_start_service_result(false);

    let once = h.orchestrator.start_service(false);
    assert_eq!(once.status(), StatusCode::ServiceStartDllError);
    assert_eq!(h.host.api().call_count("start_service"), 1);

    let thrice = h.orchestrator.start_service(true);
    assert_eq!(thrice.status(), StatusCode::ServiceStartDllError);
    assert_eq!(h.host.api().call_count("start_service"), 4);
}

#[test]
fn start_service_of_unregistered_service() {
    let h = unpacked();
    let outcome = h.orchestrator.start_service(false);
    assert_eq!(outcome.status(), StatusCode::ServiceStartDllError);
    assert_eq!(h.host.api().call_count("start_service"), 0);
}

#[tokio::test(start_paused = true)]
async fn stop_service_waits_one_window_per_attempt() {
    let h = unpacked();
    h.host.set_service_state(Some(ServiceState::Running));
    h.host.ignore_helper_verb("stop");
    let installer = h.orchestrator.installer();

    let started = tokio::time::Instant::now();
    let once = installer.stop_service(false).await;
    assert_eq!(once.status(), StatusCode::KmdUtilStopServiceError);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(2) && elapsed < Duration::from_secs(4));

    let started = tokio::time::Instant::now();
    let thrice = installer.stop_service(true).await;
    assert_eq!(thrice.status(), StatusCode::KmdUtilStopServiceError);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(6) && elapsed < Duration::from_secs(8));
}

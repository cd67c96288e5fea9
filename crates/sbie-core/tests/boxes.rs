use std::path::Path;
use std::sync::Arc;

use sbie_core::fakes::{SimulatedHost, StaticRelease};
use sbie_core::{
    ConfigKey, ConfigOperation, Orchestrator, QueryOptions, SbieSettings, StatusCode,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn installed() -> (tempfile::TempDir, Arc<SimulatedHost>, Orchestrator) {
    let dir = tempfile::tempdir().expect("tempdir");
    let settings = SbieSettings::with_base_dir(dir.path());
    let host = Arc::new(SimulatedHost::new(&settings));
    host.write_install_tree().expect("install tree");
    let orchestrator = Orchestrator::new(
        settings,
        host.clone(),
        host.clone(),
        host.clone(),
        StaticRelease::arc("unused.exe"),
    );
    (dir, host, orchestrator)
}

const OWN_VALUES: QueryOptions = QueryOptions::IGNORE_TEMPLATE_SETTINGS;

// ---------------------------------------------------------------------------
// Create / seed
// ---------------------------------------------------------------------------

#[test]
fn create_seeds_box_defaults() {
    let (_dir, host, orchestrator) = installed();
    let test1 = orchestrator.sandbox("Test1");
    assert!(!test1.exists());

    let created = test1.create();
    assert!(created.is_ok(), "{created}");
    assert!(test1.exists());
    assert!(test1.enabled());

    let store = orchestrator.config();
    let recover = store.get_all("Test1", ConfigKey::RecoverFolder, OWN_VALUES);
    assert_eq!(
        recover.data(),
        Some(&vec!["%Personal%".to_string(), "%Desktop%".to_string()])
    );

    let templates = host.api().stored_values("Test1", "Template");
    assert_eq!(
        templates,
        vec![
            "AutoRecoverIgnore",
            "LingerPrograms",
            "BlockPorts",
            "qWave",
            "SkipHook",
            "OpenBluetooth"
        ]
    );
    assert_eq!(
        orchestrator.list_boxes().into_data(),
        Some(vec!["Test1".to_string()])
    );
}

#[test]
fn create_refuses_existing_box() {
    let (_dir, _host, orchestrator) = installed();
    assert!(orchestrator.sandbox("Test1").create().is_ok());
    assert_eq!(
        orchestrator.sandbox("test1").create().status(),
        StatusCode::BoxAlreadyExists
    );
}

#[test]
fn load_defaults_is_deterministic() {
    let (_dir, host, orchestrator) = installed();
    let test1 = orchestrator.sandbox("Test1");
    assert!(test1.create().is_ok());
    let first = host.api().stored_values("Test1", "Template");
    let entries = host.api().entry_count("Test1");

    let store = orchestrator.config();
    assert!(store
        .edit(ConfigOperation::Append, "Test1", ConfigKey::Template, "Extra", None)
        .is_ok());
    assert!(test1.load_defaults().is_ok());

    assert_eq!(host.api().stored_values("Test1", "Template"), first);
    assert_eq!(host.api().entry_count("Test1"), entries);
}

#[test]
fn load_defaults_requires_existing_box() {
    let (_dir, _host, orchestrator) = installed();
    let outcome = orchestrator.sandbox("Ghost").load_defaults();
    assert_eq!(outcome.status(), StatusCode::BoxNotExists);
}

#[test]
fn seed_failure_lists_every_failed_edit() {
    let (_dir, host, orchestrator) = installed();
    host.api().fail_updates_for("Template");

    let outcome = orchestrator.sandbox("Test1").create();
    assert_eq!(outcome.status(), StatusCode::BoxLoadDefaultsError);
    let failed_edits = outcome
        .errors()
        .iter()
        .filter(|e| e.status() == StatusCode::ConfigEditDllError)
        .count();
    assert_eq!(failed_edits, 6);
    // Partial writes stay in place.
    assert_eq!(
        host.api().stored_values("Test1", "Enabled"),
        vec!["y".to_string()]
    );
}

// ---------------------------------------------------------------------------
// Edits and queries
// ---------------------------------------------------------------------------

#[test]
fn wildcard_overwrite_deletes_section() {
    let (_dir, host, orchestrator) = installed();
    assert!(orchestrator.sandbox("Test1").create().is_ok());

    let store = orchestrator.config();
    let deleted = store.edit(ConfigOperation::Overwrite, "Test1", ConfigKey::Wildcard, "", None);
    assert!(deleted.is_ok());
    assert!(!host.api().has_section("Test1"));
    assert!(!orchestrator.sandbox("Test1").exists());
}

#[test]
fn edit_without_install_path_skips_native_call() {
    let dir = tempfile::tempdir().expect("tempdir");
    let settings = SbieSettings::with_base_dir(dir.path());
    let host = Arc::new(SimulatedHost::new(&settings));
    let orchestrator = Orchestrator::new(
        settings,
        host.clone(),
        host.clone(),
        host.clone(),
        StaticRelease::arc("unused.exe"),
    );

    let store = orchestrator.config();
    let outcome = store.edit(ConfigOperation::Append, "Test1", ConfigKey::Enabled, "y", None);
    assert_eq!(outcome.status(), StatusCode::ConfigEditNotExists);
    assert_eq!(host.api().call_count("update_conf"), 0);
    assert_eq!(
        store.reload(None).status(),
        StatusCode::ConfigReloadNotExists
    );
}

#[test]
fn configured_password_is_sent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let settings = SbieSettings::with_base_dir(dir.path()).with_config_password("hunter2");
    let host = Arc::new(SimulatedHost::new(&settings));
    host.write_install_tree().expect("install tree");
    host.api().set_password("hunter2");
    let orchestrator = Orchestrator::new(
        settings,
        host.clone(),
        host.clone(),
        host.clone(),
        StaticRelease::arc("unused.exe"),
    );

    let store = orchestrator.config();
    assert!(store
        .edit(ConfigOperation::Append, "Test1", ConfigKey::Enabled, "y", None)
        .is_ok());
    let wrong = store.edit(
        ConfigOperation::Append,
        "Test1",
        ConfigKey::Enabled,
        "y",
        Some("letmein"),
    );
    assert_eq!(wrong.status(), StatusCode::ConfigEditDllError);
}

#[test]
fn values_follow_templates_unless_ignored() {
    let (_dir, _host, orchestrator) = installed();
    let store = orchestrator.config();
    for (section, key, value) in [
        ("Template_Web", ConfigKey::OpenFilePath, r"C:\Downloads"),
        ("Test1", ConfigKey::Enabled, "y"),
        ("Test1", ConfigKey::Template, "Web"),
    ] {
        assert!(store
            .edit(ConfigOperation::Append, section, key, value, None)
            .is_ok());
    }

    let inherited = store.get("Test1", ConfigKey::OpenFilePath, 0, QueryOptions::empty());
    assert_eq!(inherited.data().map(String::as_str), Some(r"C:\Downloads"));

    let own = store.get("Test1", ConfigKey::OpenFilePath, 0, OWN_VALUES);
    assert_eq!(own.status(), StatusCode::GetConfigValueError);
}

// ---------------------------------------------------------------------------
// Processes and removal
// ---------------------------------------------------------------------------

#[test]
fn remove_refused_while_box_is_active() {
    let (_dir, host, orchestrator) = installed();
    let test1 = orchestrator.sandbox("Test1");
    assert!(test1.create().is_ok());
    host.api().spawn_in_box("Test1", "notepad.exe");
    let entries = host.api().entry_count("Test1");

    let outcome = test1.remove();
    assert_eq!(outcome.status(), StatusCode::BoxRemoveBoxIsActive);
    assert_eq!(host.api().entry_count("Test1"), entries);

    assert!(test1.kill_all().is_ok());
    assert!(test1.remove().is_ok());
    assert!(!host.api().has_section("Test1"));
}

#[test]
fn remove_refused_when_activity_unknown() {
    let (_dir, host, orchestrator) = installed();
    let test1 = orchestrator.sandbox("Test1");
    assert!(test1.create().is_ok());
    host.api().fail_process_enum(true);

    let outcome = test1.remove();
    assert_eq!(outcome.status(), StatusCode::BoxIsActiveError);
    assert!(host.api().has_section("Test1"));
}

#[test]
fn run_starts_process_in_configured_box() {
    let (dir, host, orchestrator) = installed();
    let tool = dir.path().join("tool.exe");
    std::fs::write(&tool, b"MZ").expect("write tool");

    let unconfigured = orchestrator.sandbox("Empty").run(&tool);
    assert_eq!(unconfigured.status(), StatusCode::BoxNoAnyConfiguration);

    let test1 = orchestrator.sandbox("Test1");
    assert!(test1.create().is_ok());
    let pid = test1.run(&tool).into_data().expect("pid");

    let processes = test1.processes().into_data().expect("processes");
    assert_eq!(processes.len(), 1);
    assert_eq!(processes[0].pid, pid);
    assert_eq!(processes[0].image_name, "tool.exe");
    assert!(test1.active().data() == Some(&true));

    host.api().fail_kill(true);
    assert_eq!(test1.kill(pid).status(), StatusCode::BoxKillError);
}

#[test]
fn run_boxed_of_missing_file() {
    let (dir, _host, orchestrator) = installed();
    let outcome = orchestrator.run_boxed(&dir.path().join("missing.exe"), "DefaultBox");
    assert_eq!(outcome.status(), StatusCode::RunBoxedNotExists);

    let relative = orchestrator.run_boxed(Path::new("no-such-tool-5c1e.exe"), "DefaultBox");
    assert_eq!(relative.status(), StatusCode::RunBoxedNotExists);
}

#[test]
fn box_path_translates_device_prefix() {
    let (_dir, host, orchestrator) = installed();
    let path = orchestrator.sandbox("Test1").path();
    assert_eq!(path.data().map(String::as_str), Some(r"C:\Sandbox\Test1"));

    host.api().fail_box_path(true);
    assert_eq!(
        orchestrator.sandbox("Test1").path().status(),
        StatusCode::GetBoxPathError
    );
}

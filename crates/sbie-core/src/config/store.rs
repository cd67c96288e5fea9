//! Key/section/value access over the native query, update and reload calls.

use std::sync::Arc;

use sbie_native::{SbieApi, CURRENT_SESSION};
use tracing::{debug, info};

use super::defaults::{DefaultEntry, GLOBAL_SECTION};
use super::keys::ConfigKey;
use super::options::{ConfigOperation, QueryOptions};
use crate::outcome::{Outcome, StatusCode};
use crate::probe::check_install_path;
use crate::settings::SbieSettings;

/// Stateless facade over the native configuration calls. Every read goes to
/// the native layer; nothing is cached.
#[derive(Clone)]
pub struct ConfigStore {
    api: Arc<dyn SbieApi>,
    settings: Arc<SbieSettings>,
}

impl ConfigStore {
    pub fn new(api: Arc<dyn SbieApi>, settings: Arc<SbieSettings>) -> Self {
        Self { api, settings }
    }

    /// Issue one update. `password` falls back to the configured one.
    ///
    /// `Overwrite` of [`ConfigKey::Wildcard`] with an empty value deletes the
    /// whole section.
    pub fn edit(
        &self,
        operation: ConfigOperation,
        section: &str,
        key: ConfigKey,
        value: &str,
        password: Option<&str>,
    ) -> Outcome<bool> {
        let installed = check_install_path(&self.settings);
        if !installed.is_ok() {
            return Outcome::<bool>::fail(
                StatusCode::ConfigEditNotExists,
                "configuration edit skipped: install path does not exist",
            )
            .caused_by(&installed);
        }

        let password = password
            .or(self.settings.config_password.as_deref())
            .unwrap_or("");
        debug!(op = %operation, section = %section, key = %key, "config edit");

        match self
            .api
            .update_conf(operation.code(), password, section, key.as_str(), value)
        {
            Ok(()) => Outcome::ok(true),
            Err(err) => Outcome::fail(
                StatusCode::ConfigEditDllError,
                format!("{operation} {section}/{key} rejected: {err}"),
            ),
        }
    }

    /// Point query of occurrence `index` of `key`.
    pub fn get(
        &self,
        section: &str,
        key: ConfigKey,
        index: u32,
        options: QueryOptions,
    ) -> Outcome<String> {
        let Some(word) = options.query_word(index) else {
            return Outcome::fail(
                StatusCode::GetConfigValueError,
                format!("occurrence index {index:#x} collides with query flags"),
            );
        };
        match self.api.query_conf(section, key.as_str(), word) {
            Ok(value) => Outcome::ok(value),
            Err(err) => Outcome::fail(
                StatusCode::GetConfigValueError,
                format!("{section}/{key}[{index}] not readable: {err}"),
            ),
        }
    }

    /// Lazy sequence of every value of `key`, index 0 upwards, without
    /// variable expansion. Ends at the first failed or empty read.
    pub fn values(&self, section: &str, key: ConfigKey, options: QueryOptions) -> ConfigValues<'_> {
        ConfigValues {
            api: self.api.as_ref(),
            section: section.to_string(),
            key,
            options: options | QueryOptions::SKIP_VARIABLE_EXPANSION,
            index: 0,
            done: false,
        }
    }

    /// Every value of a multi-valued key, in index order.
    pub fn get_all(
        &self,
        section: &str,
        key: ConfigKey,
        options: QueryOptions,
    ) -> Outcome<Vec<String>> {
        let values: Vec<String> = self.values(section, key, options).collect();
        if values.is_empty() {
            return Outcome::fail(
                StatusCode::GetConfigValueError,
                format!("no values for {section}/{key}"),
            );
        }
        Outcome::ok(values)
    }

    /// Ask the native layer to re-read the persisted configuration.
    pub fn reload(&self, session_id: Option<u32>) -> Outcome<bool> {
        let installed = check_install_path(&self.settings);
        if !installed.is_ok() {
            return Outcome::<bool>::fail(
                StatusCode::ConfigReloadNotExists,
                "configuration reload skipped: install path does not exist",
            )
            .caused_by(&installed);
        }

        match self.api.reload_conf(session_id.unwrap_or(CURRENT_SESSION)) {
            Ok(()) => Outcome::ok(true),
            Err(err) => Outcome::fail(
                StatusCode::ConfigReloadDllError,
                format!("configuration reload rejected: {err}"),
            ),
        }
    }

    /// Seed protocol: wildcard-delete `section`, then append every value of
    /// `entries` in order. Partial writes are left in place on failure.
    pub fn seed(&self, section: &str, entries: &[DefaultEntry]) -> Outcome<bool> {
        let cleared = self.edit(
            ConfigOperation::Overwrite,
            section,
            ConfigKey::Wildcard,
            "",
            None,
        );
        if !cleared.is_ok() {
            return Outcome::<bool>::fail(
                StatusCode::BoxLoadDefaultsError,
                format!("could not clear section {section}"),
            )
            .caused_by(&cleared);
        }

        let failures: Vec<Outcome<bool>> = entries
            .iter()
            .flat_map(|entry| entry.values.iter().map(move |value| (entry.key, value)))
            .map(|(key, value)| self.edit(ConfigOperation::Append, section, key, value, None))
            .filter(|outcome| !outcome.is_ok())
            .collect();

        if failures.is_empty() {
            info!(section = %section, entries = entries.len(), "section seeded");
            return Outcome::ok(true);
        }

        let mut outcome = Outcome::fail(
            StatusCode::BoxLoadDefaultsError,
            format!("{} value(s) could not be written to {section}", failures.len()),
        );
        for failure in &failures {
            outcome.add_errors(failure.errors().iter().cloned());
        }
        outcome
    }

    /// Seed `GlobalSettings` with the global defaults.
    pub fn load_global_defaults(&self) -> Outcome<bool> {
        self.seed(GLOBAL_SECTION, &self.settings.global_defaults())
    }
}

/// Iterator returned by [`ConfigStore::values`].
pub struct ConfigValues<'a> {
    api: &'a dyn SbieApi,
    section: String,
    key: ConfigKey,
    options: QueryOptions,
    index: u32,
    done: bool,
}

impl Iterator for ConfigValues<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        if self.done {
            return None;
        }
        let value = self
            .options
            .query_word(self.index)
            .and_then(|word| self.api.query_conf(&self.section, self.key.as_str(), word).ok())
            .filter(|value| !value.is_empty());
        match value {
            Some(value) => {
                self.index += 1;
                Some(value)
            }
            None => {
                self.done = true;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sbie_native::MemorySbieApi;

    struct Fixture {
        _dir: tempfile::TempDir,
        api: Arc<MemorySbieApi>,
        store: ConfigStore,
    }

    fn fixture(installed: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let settings = SbieSettings::with_base_dir(dir.path());
        if installed {
            std::fs::create_dir_all(settings.install_dir()).unwrap();
            std::fs::write(settings.install_dir().join("SandMan.exe"), b"MZ").unwrap();
        }
        let api = Arc::new(MemorySbieApi::new());
        let store = ConfigStore::new(api.clone(), Arc::new(settings));
        Fixture {
            _dir: dir,
            api,
            store,
        }
    }

    #[test]
    fn test_edit_requires_install_path() {
        let fx = fixture(false);
        let outcome = fx.store.edit(
            ConfigOperation::Append,
            "Box1",
            ConfigKey::Enabled,
            "y",
            None,
        );
        assert_eq!(outcome.status(), StatusCode::ConfigEditNotExists);
        assert_eq!(outcome.errors()[1].status(), StatusCode::PathNotExists);
        assert_eq!(fx.api.call_count("update_conf"), 0);
    }

    #[test]
    fn test_edit_native_failure() {
        let fx = fixture(true);
        fx.api.fail_updates_for("Enabled");
        let outcome = fx.store.edit(
            ConfigOperation::Append,
            "Box1",
            ConfigKey::Enabled,
            "y",
            None,
        );
        assert_eq!(outcome.status(), StatusCode::ConfigEditDllError);
    }

    #[test]
    fn test_get_and_get_all() {
        let fx = fixture(true);
        for value in ["a", "b", "c"] {
            fx.store
                .edit(ConfigOperation::Append, "Box1", ConfigKey::OpenFilePath, value, None);
        }
        let second = fx
            .store
            .get("Box1", ConfigKey::OpenFilePath, 1, QueryOptions::empty());
        assert_eq!(second.data().map(String::as_str), Some("b"));

        let all = fx
            .store
            .get_all("Box1", ConfigKey::OpenFilePath, QueryOptions::empty());
        assert_eq!(all.into_data().unwrap(), vec!["a", "b", "c"]);

        let missing = fx
            .store
            .get_all("Box1", ConfigKey::ClosedFilePath, QueryOptions::empty());
        assert_eq!(missing.status(), StatusCode::GetConfigValueError);
    }

    #[test]
    fn test_get_rejects_colliding_index() {
        let fx = fixture(true);
        let outcome = fx.store.get(
            "Box1",
            ConfigKey::Enabled,
            0x1000_0000,
            QueryOptions::empty(),
        );
        assert_eq!(outcome.status(), StatusCode::GetConfigValueError);
        assert_eq!(fx.api.call_count("query_conf"), 0);
    }

    #[test]
    fn test_values_is_lazy() {
        let fx = fixture(true);
        for value in ["a", "b", "c"] {
            fx.store
                .edit(ConfigOperation::Append, "Box1", ConfigKey::Template, value, None);
        }
        let first: Vec<String> = fx
            .store
            .values("Box1", ConfigKey::Template, QueryOptions::empty())
            .take(1)
            .collect();
        assert_eq!(first, vec!["a"]);
        assert_eq!(fx.api.call_count("query_conf"), 1);
    }

    #[test]
    fn test_get_all_skips_expansion() {
        let fx = fixture(true);
        fx.store.edit(
            ConfigOperation::Append,
            "Box1",
            ConfigKey::FileRootPath,
            r"C:\boxes\%SANDBOX%",
            None,
        );
        let all = fx
            .store
            .get_all("Box1", ConfigKey::FileRootPath, QueryOptions::empty());
        assert_eq!(all.into_data().unwrap(), vec![r"C:\boxes\%SANDBOX%"]);
    }

    #[test]
    fn test_password_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let settings = SbieSettings::with_base_dir(dir.path()).with_config_password("pw");
        std::fs::create_dir_all(settings.install_dir()).unwrap();
        std::fs::write(settings.install_dir().join("SandMan.exe"), b"MZ").unwrap();
        let api = Arc::new(MemorySbieApi::new());
        api.set_password("pw");
        let store = ConfigStore::new(api.clone(), Arc::new(settings));

        let outcome = store.edit(ConfigOperation::Append, "Box1", ConfigKey::Enabled, "y", None);
        assert!(outcome.is_ok());
        let wrong = store.edit(
            ConfigOperation::Append,
            "Box1",
            ConfigKey::Enabled,
            "y",
            Some("nope"),
        );
        assert_eq!(wrong.status(), StatusCode::ConfigEditDllError);
    }

    #[test]
    fn test_reload_statuses() {
        let fx = fixture(false);
        assert_eq!(
            fx.store.reload(None).status(),
            StatusCode::ConfigReloadNotExists
        );

        let fx = fixture(true);
        assert!(fx.store.reload(None).is_ok());
        fx.api.fail_reload(true);
        assert_eq!(
            fx.store.reload(Some(1)).status(),
            StatusCode::ConfigReloadDllError
        );
    }

    #[test]
    fn test_seed_replaces_section() {
        let fx = fixture(true);
        fx.store
            .edit(ConfigOperation::Append, "Box1", ConfigKey::OpenFilePath, "stale", None);
        let entries = vec![
            DefaultEntry::new(ConfigKey::Enabled, &["y"]),
            DefaultEntry::new(ConfigKey::Template, &["A", "B", "C"]),
        ];
        assert!(fx.store.seed("Box1", &entries).is_ok());
        assert!(fx.api.stored_values("Box1", "OpenFilePath").is_empty());
        assert_eq!(fx.api.stored_values("Box1", "Template"), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_seed_reports_partial_failure_without_rollback() {
        let fx = fixture(true);
        fx.api.fail_updates_for("Template");
        let entries = vec![
            DefaultEntry::new(ConfigKey::Enabled, &["y"]),
            DefaultEntry::new(ConfigKey::Template, &["A", "B"]),
        ];
        let outcome = fx.store.seed("Box1", &entries);
        assert_eq!(outcome.status(), StatusCode::BoxLoadDefaultsError);
        assert_eq!(outcome.errors().len(), 3);
        assert_eq!(fx.api.stored_values("Box1", "Enabled"), vec!["y"]);
    }

    #[test]
    fn test_load_global_defaults() {
        let fx = fixture(true);
        assert!(fx.store.load_global_defaults().is_ok());
        let roots = fx.api.stored_values(GLOBAL_SECTION, "FileRootPath");
        assert_eq!(roots.len(), 1);
        assert!(roots[0].ends_with(r"\boxes\%SANDBOX%"));
    }
}

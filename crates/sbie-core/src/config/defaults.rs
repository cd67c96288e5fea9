//! Default value tables applied by the seed protocol.

use serde::{Deserialize, Serialize};

use super::keys::ConfigKey;

/// Section holding settings shared by every box.
pub const GLOBAL_SECTION: &str = "GlobalSettings";

/// One key and the values appended for it, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultEntry {
    pub key: ConfigKey,
    pub values: Vec<String>,
}

impl DefaultEntry {
    pub fn new(key: ConfigKey, values: &[&str]) -> Self {
        Self {
            key,
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }
}

/// Settings written into a freshly created box.
pub fn box_defaults() -> Vec<DefaultEntry> {
    vec![
        DefaultEntry::new(ConfigKey::Enabled, &["y"]),
        DefaultEntry::new(ConfigKey::BlockNetworkFiles, &["y"]),
        DefaultEntry::new(ConfigKey::RecoverFolder, &["%Personal%", "%Desktop%"]),
        DefaultEntry::new(ConfigKey::BorderColor, &["#00FFFF,ttl,2"]),
        DefaultEntry::new(
            ConfigKey::Template,
            &[
                "AutoRecoverIgnore",
                "LingerPrograms",
                "BlockPorts",
                "qWave",
                "SkipHook",
                "OpenBluetooth",
            ],
        ),
        DefaultEntry::new(ConfigKey::ConfigLevel, &["10"]),
        DefaultEntry::new(ConfigKey::UseFileDeleteV2, &["y"]),
        DefaultEntry::new(ConfigKey::UseRegDeleteV2, &["y"]),
        DefaultEntry::new(ConfigKey::AutoRecover, &["y"]),
    ]
}

/// Settings written into `GlobalSettings`; `box_root` is the file root
/// template containing `%SANDBOX%`.
pub fn global_defaults(box_root: &str) -> Vec<DefaultEntry> {
    vec![DefaultEntry::new(ConfigKey::FileRootPath, &[box_root])]
}

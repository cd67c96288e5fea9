//! Recognized configuration setting names.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

macro_rules! config_keys {
    ($($key:ident),+ $(,)?) => {
        /// A recognized setting name, or [`ConfigKey::Wildcard`] for "every key
        /// in the section".
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum ConfigKey {
            $($key,)+
            #[serde(rename = "*")]
            Wildcard,
        }

        impl ConfigKey {
            /// Every concrete key, in declaration order (wildcard excluded).
            pub const ALL: &'static [ConfigKey] = &[$(ConfigKey::$key,)+];

            /// Wire name sent to the native layer.
            pub fn as_str(self) -> &'static str {
                match self {
                    $(ConfigKey::$key => stringify!($key),)+
                    ConfigKey::Wildcard => "*",
                }
            }
        }
    };
}

config_keys! {
    AlertFolder,
    AlertProcess,
    AutoDelete,
    AutoExec,
    AutoRecover,
    AutoRecoverIgnore,
    BlockNetParam,
    BlockNetworkFiles,
    BlockPassword,
    BorderColor,
    BoxNameTitle,
    BreakoutDocument,
    BreakoutFolder,
    BreakoutProcess,
    ClosedClsid,
    ClosedFilePath,
    ClosedIpcPath,
    ClosedKeyPath,
    ClosedRT,
    ConfigLevel,
    CopyLimitKb,
    CopyLimitSilent,
    DeleteCommand,
    Description,
    DisableRTBlacklist,
    DropAdminRights,
    EditAdminOnly,
    EditPassword,
    Enabled,
    FileRootPath,
    ForceDisableAdminOnly,
    ForceDisableSeconds,
    ForceFolder,
    ForceProcess,
    InjectDll,
    InjectDll64,
    IpcRootPath,
    KeyRootPath,
    LeaderProcess,
    LingerProcess,
    MonitorAdminOnly,
    NeverDelete,
    NoRenameWinClass,
    NormalFilePath,
    NormalIpcPath,
    NotifyDirectDiskAccess,
    NotifyInternetAccessDenied,
    NotifyProcessAccessDenied,
    NotifyStartRunAccessDenied,
    OpenClsid,
    OpenConfPath,
    OpenCredentials,
    OpenFilePath,
    OpenIpcPath,
    OpenKeyPath,
    OpenPipePath,
    OpenProtectedStorage,
    OpenSamEndpoint,
    OpenWinClass,
    ProcessLimit,
    ReadFilePath,
    ReadIpcPath,
    ReadKeyPath,
    RecoverFolder,
    Template,
    UseFileDeleteV2,
    UsePrivacyMode,
    UseRegDeleteV2,
    UseRuleSpecificity,
    UseSecurityMode,
    StartProgram,
    StartService,
    WriteFilePath,
    WriteKeyPath,
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfigKey {
    type Err = String;

    /// Case-insensitive; `*` parses as the wildcard.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "*" {
            return Ok(ConfigKey::Wildcard);
        }
        ConfigKey::ALL
            .iter()
            .copied()
            .find(|key| key.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown configuration key: {s}"))
    }
}

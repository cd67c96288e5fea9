//! sbie-core: Sandboxie-Plus orchestration
//!
//! Installs, removes and controls a portable Sandboxie-Plus installation and
//! manages its sandbox configuration through the native control interface.
//!
//! ## Layers
//!
//! - [`outcome`]: status codes and the error-chain carrying [`Outcome`]
//! - [`config`]: typed configuration keys and the [`ConfigStore`]
//! - [`probe`]: presence checks for the install path, driver and service
//! - [`installer`]: driver/service registration through the privileged helper
//! - [`sandbox`]: the per-box facade [`SandboxBox`]
//! - [`orchestrator`]: install, remove and start flows
//!
//! Host access goes through the [`host`] and [`release`] traits; [`fakes`]
//! provides in-memory implementations for tests.

pub mod config;
pub mod error;
pub mod executable;
pub mod fakes;
pub mod host;
pub mod installer;
pub mod obs;
pub mod orchestrator;
pub mod outcome;
pub mod probe;
pub mod release;
pub mod retry;
pub mod sandbox;
pub mod settings;
pub mod telemetry;

pub use config::{
    ConfigKey, ConfigOperation, ConfigStore, DefaultEntry, QueryOptions, GLOBAL_SECTION,
};
pub use error::{DownloadError, ExecError, SystemError};
pub use host::{ElevatedCommand, PrivilegedRunner, ServiceControl, ServiceState};
pub use installer::ComponentInstaller;
pub use orchestrator::{ComponentStatus, Orchestrator};
pub use outcome::{ErrorRecord, Outcome, StatusCode};
pub use probe::PresenceProbe;
pub use release::{GithubReleases, ReleaseAsset, ReleaseSource};
pub use retry::RetryPolicy;
pub use sandbox::{BoxConfiguration, BoxedProcess, SandboxBox};
pub use settings::SbieSettings;

pub use sbie_native::{HomePath, SbieApi};

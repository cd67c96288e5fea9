//! sbie-native: the SbieDll control interface
//!
//! This crate is the foreign-function boundary of sbie. Everything the
//! orchestration layer needs from the Sandboxie-Plus shared library (and the
//! one kernel32 call used for device-path translation) is exposed through the
//! [`SbieApi`] trait as a fixed set of typed calls.
//!
//! ## Layer 0 - Native Control Interface
//!
//! - [`DynamicSbieApi`] binds the real `SbieDll.dll` by symbol name, lazily,
//!   on first use (the library only exists once the product is installed).
//! - [`fakes::MemorySbieApi`] is an in-memory implementation with real
//!   configuration-edit semantics, used by tests.

pub mod api;
pub mod error;
pub mod fakes;
pub mod library;

pub use api::{
    wide_to_string, BoxPaths, HomePath, ProcessInfo, SbieApi, ALL_SESSIONS, BOX_NAME_CAPACITY,
    CONF_VALUE_CAPACITY, CURRENT_SESSION, STATUS_INVALID_PARAMETER, STATUS_OBJECT_NAME_NOT_FOUND,
    STATUS_RESOURCE_NAME_NOT_FOUND, STATUS_WRONG_PASSWORD,
};
pub use error::{NativeError, NativeResult};
pub use fakes::MemorySbieApi;
pub use library::DynamicSbieApi;

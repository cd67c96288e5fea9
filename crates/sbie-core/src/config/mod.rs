//! Configuration store: typed keys, edit operations, query options and
//! the seed protocol over the native configuration calls.

pub mod defaults;
pub mod keys;
pub mod options;
pub mod store;

pub use defaults::{DefaultEntry, GLOBAL_SECTION};
pub use keys::ConfigKey;
pub use options::{ConfigOperation, QueryOptions, MAX_OCCURRENCE_INDEX};
pub use store::{ConfigStore, ConfigValues};

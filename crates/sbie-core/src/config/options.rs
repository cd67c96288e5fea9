//! Edit operation codes and query option flags.

use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Highest occurrence index that does not collide with [`QueryOptions`] bits.
pub const MAX_OCCURRENCE_INDEX: u32 = 0x0FFF_FFFF;

/// Update operation, sent to the native layer as a single character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigOperation {
    Overwrite,
    Append,
    Insert,
    Delete,
}

impl ConfigOperation {
    pub fn code(self) -> char {
        match self {
            ConfigOperation::Overwrite => 's',
            ConfigOperation::Append => 'a',
            ConfigOperation::Insert => 'i',
            ConfigOperation::Delete => 'd',
        }
    }
}

impl fmt::Display for ConfigOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

bitflags! {
    /// Mode flags for configuration queries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct QueryOptions: u32 {
        /// Do not fall through to `GlobalSettings`.
        const SKIP_GLOBAL_SETTINGS = 0x4000_0000;
        /// Return values with `%VAR%` placeholders unexpanded.
        const SKIP_VARIABLE_EXPANSION = 0x2000_0000;
        /// Do not inherit values from `Template=` sections.
        const IGNORE_TEMPLATE_SETTINGS = 0x1000_0000;
    }
}

impl QueryOptions {
    /// Combine flags and occurrence index into the native query word.
    ///
    /// Returns `None` when the index would overlap the flag bits.
    pub fn query_word(self, index: u32) -> Option<u32> {
        (index <= MAX_OCCURRENCE_INDEX).then(|| self.bits() | index)
    }
}

impl FromStr for QueryOptions {
    type Err = String;

    /// Comma separated flag names, e.g. `skip-global,ignore-templates`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut options = QueryOptions::empty();
        for name in s.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            options |= match name {
                "none" => QueryOptions::empty(),
                "skip-global" => QueryOptions::SKIP_GLOBAL_SETTINGS,
                "skip-expansion" => QueryOptions::SKIP_VARIABLE_EXPANSION,
                "ignore-templates" => QueryOptions::IGNORE_TEMPLATE_SETTINGS,
                other => return Err(format!("unknown query option: {other}")),
            };
        }
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_codes() {
        assert_eq!(ConfigOperation::Overwrite.code(), 's');
        assert_eq!(ConfigOperation::Append.code(), 'a');
        assert_eq!(ConfigOperation::Insert.code(), 'i');
        assert_eq!(ConfigOperation::Delete.code(), 'd');
    }

    #[test]
    fn test_query_word_combines_flags_and_index() {
        let options = QueryOptions::SKIP_VARIABLE_EXPANSION | QueryOptions::IGNORE_TEMPLATE_SETTINGS;
        assert_eq!(options.query_word(2), Some(0x3000_0002));
        assert_eq!(QueryOptions::empty().query_word(0), Some(0));
    }

    #[test]
    fn test_query_word_rejects_colliding_index() {
        assert_eq!(QueryOptions::empty().query_word(0x1000_0000), None);
        assert!(QueryOptions::empty().query_word(MAX_OCCURRENCE_INDEX).is_some());
    }

    #[test]
    fn test_parse_options() {
        let parsed: QueryOptions = "skip-global, ignore-templates".parse().unwrap();
        assert_eq!(
            parsed,
            QueryOptions::SKIP_GLOBAL_SETTINGS | QueryOptions::IGNORE_TEMPLATE_SETTINGS
        );
        assert!("bogus".parse::<QueryOptions>().is_err());
    }
}

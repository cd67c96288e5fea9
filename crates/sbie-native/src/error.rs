//! Error types for sbie-native

use thiserror::Error;

/// Errors raised at the native control interface boundary
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NativeError {
    /// A call returned a non-zero status code
    #[error("{call} returned status {code:#010x}")]
    Status { call: &'static str, code: u32 },

    /// A call returned FALSE without a status code
    #[error("{call} reported failure")]
    Failed { call: &'static str },

    /// The shared library could not be loaded
    #[error("failed to load {path}: {reason}")]
    Load { path: String, reason: String },

    /// An exported function could not be resolved
    #[error("symbol {symbol} not found: {reason}")]
    Symbol { symbol: &'static str, reason: String },

    /// The interface only exists on Windows hosts
    #[error("native control interface is not available on this platform")]
    Unsupported,
}

impl NativeError {
    /// Status code carried by the error, if the native layer returned one
    pub fn code(&self) -> Option<u32> {
        match self {
            NativeError::Status { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Result type for native calls
pub type NativeResult<T> = std::result::Result<T, NativeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display_is_hex() {
        let err = NativeError::Status {
            call: "SbieApi_QueryConf",
            code: 0xC000_008B,
        };
        assert_eq!(err.to_string(), "SbieApi_QueryConf returned status 0xc000008b");
        assert_eq!(err.code(), Some(0xC000_008B));
    }

    #[test]
    fn test_non_status_has_no_code() {
        assert_eq!(NativeError::Unsupported.code(), None);
    }
}

//! Uniform outcome envelope returned by every public operation.
//!
//! An [`Outcome`] carries a [`StatusCode`], the derived success flag, optional
//! data and an ordered causal chain of [`ErrorRecord`]s. The outermost failure
//! comes first; upstream causes are appended after it with
//! [`Outcome::add_errors`] / [`Outcome::caused_by`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// Message used when a failing outcome is built without one.
pub const DEFAULT_FAILURE_MESSAGE: &str = "Operation failed";

/// Closed set of status codes. `Ok` is the only success value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    Ok,

    // Presence
    PathNotExists,
    NotExists,
    NoAccess,
    DriverNotFound,
    ServiceNotFound,
    ServiceNotStarted,

    // Executable checks
    Is64BitNot64,
    Is64BitError,
    ExecuteError,
    ExecuteCanNotExecute,
    ExecuteNotFound,

    // Privileged helper
    KmdUtilExecError,
    KmdUtilInstallServiceError,
    KmdUtilInstallServiceNotExists,
    KmdUtilInstallDriverError,
    KmdUtilInstallDriverNotExists,
    KmdUtilStopServiceError,
    KmdUtilStopServiceNotExists,
    KmdUtilStopServiceExecError,
    KmdUtilRemoveServiceNotExists,
    KmdUtilRemoveDriverNotExists,
    KmdUtilRemoveDriverError,

    // Release discovery and download
    WebBadStatusCode,
    WebNotFound,
    WebNoReleases,
    WebNoAssets,
    WebNoRequiredAsset,
    WebNoDownloadUrl,
    DownloadTimeout,
    DownloadNoUrl,
    DownloadFailed,
    DownloadFileNotFound,
    DownloadDigestMismatch,

    // Install and remove
    InstallWebParsingError,
    InstallDownloadError,
    InstallUnpackingError,
    InstallFileNotFound,
    InstallComponentsError,
    RemoveServiceError,
    RemoveServiceNotStopped,
    RemoveDriverError,
    RemoveComponentsError,
    RemovePathNotExists,

    // Service start
    ServiceStartNotExists,
    ServiceStartDllError,

    // Configuration
    ConfigEditNotExists,
    ConfigEditDllError,
    ConfigReloadNotExists,
    ConfigReloadDllError,
    GetHomePathDllError,
    GetConfigValueError,

    // Boxes
    GetBoxedPidsError,
    GetBoxPathError,
    BoxNoAnyConfiguration,
    BoxIsActiveError,
    BoxLoadDefaultsError,
    BoxNotExists,
    BoxAlreadyExists,
    BoxRemoveError,
    BoxRemoveBoxIsActive,
    BoxKillError,
    RunBoxedNotExists,
    RunBoxedError,

    Unknown,
}

impl StatusCode {
    pub fn is_ok(self) -> bool {
        self == StatusCode::Ok
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One link of a causal chain. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    status: StatusCode,
    message: String,
}

impl ErrorRecord {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

/// Status, success flag, optional data and the ordered error chain.
///
/// `success` is always derived from `status`, so a successful outcome can
/// only ever carry [`StatusCode::Ok`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outcome<T> {
    status: StatusCode,
    success: bool,
    data: Option<T>,
    errors: Vec<ErrorRecord>,
}

impl<T> Outcome<T> {
    /// Build an outcome. A failing status seeds the chain with one record
    /// made from `message` (or [`DEFAULT_FAILURE_MESSAGE`]).
    pub fn new(status: StatusCode, data: Option<T>, message: Option<&str>) -> Self {
        let success = status.is_ok();
        let mut errors = Vec::new();
        if !success {
            errors.push(ErrorRecord::new(
                status,
                message.unwrap_or(DEFAULT_FAILURE_MESSAGE),
            ));
        }
        Self {
            status,
            success,
            data,
            errors,
        }
    }

    /// Successful outcome carrying `data`.
    pub fn ok(data: T) -> Self {
        Self::new(StatusCode::Ok, Some(data), None)
    }

    /// Successful outcome without data (e.g. "no boxed processes").
    pub fn ok_empty() -> Self {
        Self::new(StatusCode::Ok, None, None)
    }

    /// Failing outcome with a single record.
    pub fn fail(status: StatusCode, message: impl AsRef<str>) -> Self {
        Self::new(status, None, Some(message.as_ref()))
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn is_ok(&self) -> bool {
        self.success
    }

    pub fn data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    pub fn into_data(self) -> Option<T> {
        self.data
    }

    pub fn errors(&self) -> &[ErrorRecord] {
        &self.errors
    }

    /// Append one record to the chain.
    pub fn add_error(&mut self, status: StatusCode, message: impl Into<String>) {
        self.errors.push(ErrorRecord::new(status, message));
    }

    /// Append many records, preserving their order.
    pub fn add_errors<I>(&mut self, records: I)
    where
        I: IntoIterator<Item = ErrorRecord>,
    {
        self.errors.extend(records);
    }

    /// Append the whole chain of `cause` (a no-op when it succeeded).
    pub fn caused_by<U>(mut self, cause: &Outcome<U>) -> Self {
        self.errors.extend(cause.errors.iter().cloned());
        self
    }

    /// Convert the data while keeping status and chain.
    pub fn map<U, F>(self, f: F) -> Outcome<U>
    where
        F: FnOnce(T) -> U,
    {
        Outcome {
            status: self.status,
            success: self.success,
            data: self.data.map(f),
            errors: self.errors,
        }
    }

    /// Re-label a failure under `status`, keeping the previous chain as cause.
    pub fn context<U>(self, status: StatusCode, message: impl AsRef<str>) -> Outcome<U> {
        Outcome::<U>::fail(status, message).caused_by(&self)
    }
}

impl<T: fmt::Display> fmt::Display for Outcome<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.data, self.success) {
            (Some(data), true) => write!(f, "{}: {}", self.status, data)?,
            _ => write!(f, "{}", self.status)?,
        }
        for record in &self.errors {
            write!(f, "\n  - {record}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_has_no_errors() {
        let outcome = Outcome::ok(42);
        assert!(outcome.is_ok());
        assert_eq!(outcome.status(), StatusCode::Ok);
        assert_eq!(outcome.data(), Some(&42));
        assert!(outcome.errors().is_empty());
    }

    #[test]
    fn test_failure_seeds_default_message() {
        let outcome: Outcome<bool> = Outcome::new(StatusCode::NotExists, None, None);
        assert!(!outcome.is_ok());
        assert_eq!(outcome.errors().len(), 1);
        assert_eq!(outcome.errors()[0].status(), StatusCode::NotExists);
        assert_eq!(outcome.errors()[0].message(), DEFAULT_FAILURE_MESSAGE);
    }

    #[test]
    fn test_ok_status_with_message_stays_clean() {
        let outcome: Outcome<()> = Outcome::new(StatusCode::Ok, None, Some("ignored"));
        assert!(outcome.is_ok());
        assert!(outcome.errors().is_empty());
    }

    #[test]
    fn test_chain_keeps_outer_cause_first() {
        let root: Outcome<bool> = Outcome::fail(StatusCode::PathNotExists, "no dir");
        let mid: Outcome<bool> =
            Outcome::fail(StatusCode::ConfigEditNotExists, "edit").caused_by(&root);
        let mut top: Outcome<bool> = Outcome::fail(StatusCode::BoxLoadDefaultsError, "seed");
        top.add_errors(mid.errors().iter().cloned());

        let statuses: Vec<_> = top.errors().iter().map(|e| e.status()).collect();
        assert_eq!(
            statuses,
            vec![
                StatusCode::BoxLoadDefaultsError,
                StatusCode::ConfigEditNotExists,
                StatusCode::PathNotExists,
            ]
        );
    }

    #[test]
    fn test_merging_successful_cause_is_noop() {
        let fine = Outcome::ok(true);
        let outcome: Outcome<bool> = Outcome::fail(StatusCode::Unknown, "x").caused_by(&fine);
        assert_eq!(outcome.errors().len(), 1);
    }

    #[test]
    fn test_context_relabels_failure() {
        let inner: Outcome<String> = Outcome::fail(StatusCode::WebNoAssets, "no assets");
        let outer: Outcome<bool> = inner.context(StatusCode::DownloadNoUrl, "no url");
        assert_eq!(outer.status(), StatusCode::DownloadNoUrl);
        assert_eq!(outer.errors()[1].status(), StatusCode::WebNoAssets);
    }

    #[test]
    fn test_serializes_chain() {
        let outcome: Outcome<bool> = Outcome::fail(StatusCode::BoxKillError, "kill failed");
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "BoxKillError");
        assert_eq!(json["success"], false);
        assert_eq!(json["errors"][0]["message"], "kill failed");
    }
}
